//! Toolset specifications and their resolution against discovered tools.

mod resolver;
mod spec;
mod types;

pub use resolver::apply;
pub use spec::{ConflictStrategy, ServerSelection, ToolSelection, ToolsetOptions, ToolsetSpecification};
pub use types::{
    ResolutionOutcome, ResolutionStats, ResolvedConflict, ResolvedTool, ResolvedToolset,
};
