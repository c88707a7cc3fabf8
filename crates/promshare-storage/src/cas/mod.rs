pub mod engine;
pub mod store;

pub use engine::CasAdapter;
pub use store::{CasStore, MemoryCasStore};
