//! Personas: named bundles of toolsets and backend configuration,
//! switchable as a unit.

mod activation;
mod archive;
mod loader;
mod registry;
mod types;
pub mod validation;

pub use activation::{ActiveView, PersonaManager};
pub use archive::{ArchiveMetadata, PersonaArchive, META_ENTRY};
pub use loader::{
    is_archive, parse_backends, PersonaCatalog, PersonaLoader, ARCHIVE_EXTENSION, BACKEND_FILE,
    PERSONA_FILE,
};
pub use registry::{PersonaRegistry, PERSONA_NAMESPACE};
pub use types::{
    ActivationMetadata, ActivationOptions, ActivationSource, ActivePersonaState, LoadedPersona,
    PersonaConfig, PersonaEvent, PersonaSource, PersonaState, PersonaToolset,
};
