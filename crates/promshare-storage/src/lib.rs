pub mod cas;
pub mod config;
pub mod key;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod traits;

pub use cas::{CasAdapter, CasStore, MemoryCasStore};
pub use config::{BackendKind, CasConfig, StorageConfig};
pub use memory::MemoryAdapter;
pub use sqlite::SqliteAdapter;
pub use traits::Adapter;
