pub mod cache;
pub mod kv;
pub mod remote;
pub mod sweep;

pub use cache::{CacheStore, StorageStats, SweepReport};
pub use kv::{FileStore, KeyValueStore, MemoryStore, StorageChange};
pub use remote::{RemoteSummarySource, RestSummarySource};
pub use sweep::RetentionSweeper;
