pub mod error;
pub mod journal;
pub mod memory;
pub mod views;

pub use error::JournalError;
pub use journal::{ExecutionJournal, Snapshot};
pub use memory::MemoryStore;
pub use views::{
    RAW_SUFFIX, dependency_results, global_results, history_outputs, outputs_map, slice_item,
};
