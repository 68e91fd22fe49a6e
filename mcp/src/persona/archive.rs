//! `.htp` persona archives: a gzip-compressed tar of the persona directory
//! plus a hidden `.htp-meta.json` entry.
//!
//! Packing writes to a temp file next to the target and persists it;
//! unpacking extracts into a temp directory next to the destination and
//! renames it into place. A failure at any point leaves no partial output.

use std::{
    fs::{self, File},
    io::Read,
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    loader::{walk, PersonaLoader},
    types::PersonaConfig,
    validation,
};
use crate::error::{PersonaError, PersonaErrorKind};

pub const META_ENTRY: &str = ".htp-meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl ArchiveMetadata {
    fn for_persona(config: &PersonaConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            created_at: Utc::now(),
        }
    }
}

fn is_meta(path: &Path) -> bool {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == META_ENTRY
    )
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn open(archive: &Path) -> Result<tar::Archive<GzDecoder<File>>, PersonaError> {
    let file = File::open(archive).map_err(|e| {
        PersonaError::new(
            PersonaErrorKind::NotFound,
            format!("cannot open archive {}: {}", archive.display(), e),
        )
    })?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

fn extraction_error(archive: &Path, err: impl std::fmt::Display) -> PersonaError {
    PersonaError::archive(format!("{}: {}", archive.display(), err))
        .with_suggestion("Re-create the archive with the pack command")
}

/// Extract every entry except the metadata entry into an existing directory.
pub(super) fn extract_into(archive: &Path, dest: &Path) -> Result<(), PersonaError> {
    let mut tar = open(archive)?;
    let entries = tar.entries().map_err(|e| extraction_error(archive, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_error(archive, e))?;
        let path = entry
            .path()
            .map_err(|e| extraction_error(archive, e))?
            .into_owned();
        if is_meta(&path) {
            continue;
        }
        let inside = entry
            .unpack_in(dest)
            .map_err(|e| extraction_error(archive, e))?;
        if !inside {
            return Err(extraction_error(
                archive,
                format!("entry '{}' points outside the archive root", path.display()),
            ));
        }
    }
    Ok(())
}

/// Swap `staged` into `dest`, keeping the old `dest` aside until the new
/// tree is in place. On failure the old tree is moved back.
fn replace_with_backup(staged: &Path, dest: &Path) -> Result<(), PersonaError> {
    let parent = parent_dir(dest);
    let backup = tempfile::Builder::new()
        .prefix(".htp-backup-")
        .tempdir_in(parent)
        .map_err(|e| PersonaError::io("creating backup directory", e))?;
    let aside = backup.path().join("previous");
    fs::rename(dest, &aside)
        .map_err(|e| PersonaError::io(&format!("moving aside {}", dest.display()), e))?;

    if let Err(e) = fs::rename(staged, dest) {
        if let Err(restore) = fs::rename(&aside, dest) {
            // keep the backup on disk, it is the only copy left
            let kept = backup.keep();
            warn!(
                dest = %dest.display(),
                backup = %kept.display(),
                error = %restore,
                "Could not restore previous directory"
            );
        }
        return Err(PersonaError::io(&format!("moving into {}", dest.display()), e));
    }
    // dropping the guard removes the old tree
    drop(backup);
    Ok(())
}

/// Namespace for archive operations.
pub struct PersonaArchive;

impl PersonaArchive {
    /// Pack the persona directory `source` into `target`.
    pub fn pack(source: &Path, target: &Path, force: bool) -> Result<ArchiveMetadata, PersonaError> {
        if target.exists() && !force {
            return Err(PersonaError::new(
                PersonaErrorKind::Io,
                format!("{} already exists", target.display()),
            )
            .with_suggestion("Pass force to overwrite the existing archive"));
        }

        let persona = PersonaLoader::load_dir(source)?;
        validation::validate_schema(&persona)?;
        let metadata = ArchiveMetadata::for_persona(&persona.config);

        let parent = parent_dir(target);
        fs::create_dir_all(parent)
            .map_err(|e| PersonaError::io(&format!("creating {}", parent.display()), e))?;
        let staged = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| PersonaError::io("creating temporary archive", e))?;

        let write = |staged: &File| -> std::io::Result<()> {
            let mut builder = tar::Builder::new(GzEncoder::new(staged, Compression::default()));
            builder.mode(tar::HeaderMode::Deterministic);

            let meta = serde_json::to_vec_pretty(&metadata)?;
            let mut header = tar::Header::new_gnu();
            header.set_size(meta.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(metadata.created_at.timestamp().max(0) as u64);
            builder.append_data(&mut header, META_ENTRY, meta.as_slice())?;

            let tree = walk(source)?;
            // parents sort before their children
            for relative in &tree.dirs {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_mtime(0);
                builder.append_data(&mut header, relative, std::io::empty())?;
            }
            for relative in &tree.files {
                builder.append_path_with_name(source.join(relative), relative)?;
            }
            builder.into_inner()?.finish()?;
            Ok(())
        };
        write(staged.as_file())
            .map_err(|e| PersonaError::io(&format!("writing {}", target.display()), e))?;

        staged
            .persist(target)
            .map_err(|e| PersonaError::io(&format!("persisting {}", target.display()), e.error))?;

        info!(persona = %metadata.name, archive = %target.display(), "Packed persona");
        Ok(metadata)
    }

    /// Unpack `archive` into the directory `dest`.
    pub fn unpack(archive: &Path, dest: &Path, force: bool) -> Result<PathBuf, PersonaError> {
        if dest.exists() && !force {
            return Err(PersonaError::archive(format!("{} already exists", dest.display()))
                .with_suggestion("Pass force to replace the existing directory"));
        }

        let parent = parent_dir(dest);
        fs::create_dir_all(parent)
            .map_err(|e| PersonaError::io(&format!("creating {}", parent.display()), e))?;
        let staging = tempfile::Builder::new()
            .prefix(".htp-unpack-")
            .tempdir_in(parent)
            .map_err(|e| PersonaError::io("creating staging directory", e))?;

        extract_into(archive, staging.path())?;
        PersonaLoader::load_dir(staging.path()).map_err(|e| {
            PersonaError::archive(format!(
                "{} does not contain a valid persona: {}",
                archive.display(),
                e.message()
            ))
        })?;

        // the TempDir guard finds nothing left to clean up after the rename
        if dest.exists() {
            replace_with_backup(staging.path(), dest)?;
        } else {
            fs::rename(staging.path(), dest)
                .map_err(|e| PersonaError::io(&format!("moving into {}", dest.display()), e))?;
        }

        info!(archive = %archive.display(), dest = %dest.display(), "Unpacked persona");
        Ok(dest.to_path_buf())
    }

    /// Content file paths, sorted, without the metadata entry.
    pub fn list(archive: &Path) -> Result<Vec<PathBuf>, PersonaError> {
        let mut tar = open(archive)?;
        let mut paths = Vec::new();
        for entry in tar.entries().map_err(|e| extraction_error(archive, e))? {
            let entry = entry.map_err(|e| extraction_error(archive, e))?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| extraction_error(archive, e))?
                .into_owned();
            if !is_meta(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// The hidden metadata entry, if the archive has one.
    pub fn read_metadata(archive: &Path) -> Result<Option<ArchiveMetadata>, PersonaError> {
        let mut tar = open(archive)?;
        for entry in tar.entries().map_err(|e| extraction_error(archive, e))? {
            let mut entry = entry.map_err(|e| extraction_error(archive, e))?;
            let is_meta_entry = entry.path().map(|p| is_meta(&p)).unwrap_or(false);
            if is_meta_entry {
                let mut content = String::new();
                entry
                    .read_to_string(&mut content)
                    .map_err(|e| extraction_error(archive, e))?;
                let metadata =
                    serde_json::from_str(&content).map_err(|e| extraction_error(archive, e))?;
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }
}
