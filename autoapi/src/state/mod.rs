//! Persisted selection and generation state.

mod model;
mod pg;
mod repository;
mod selection;

pub use model::{GenerationState, GenerationStatus, SelectionMode, SkipReason, TableKey, TableSelection};
pub use pg::PgStateRepository;
pub use repository::{MemoryRepository, StateRepository};
pub use selection::{ScanReport, ScannedTable, SelectionPatch, SelectionRegistry, SelectionStats};
