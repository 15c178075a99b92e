//! # mo-storage
//!
//! Trial persistence for multiopt: one SQLite shard per worker process, a
//! master store that absorbs every shard once the run is over, and the ranked
//! CSV summary.

pub mod coordinator;
pub mod shard;
pub mod summary;
pub mod table;

pub use coordinator::{
    is_shard_file_name, shard_file_name, MergeReport, StorageCoordinator, MASTER_FILE_NAME,
};
pub use shard::StorageShard;
pub use summary::{summary_file_name, write_summary_csv, SummaryReport};
pub use table::TABLE_NAME;
