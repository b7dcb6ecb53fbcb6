mod registry;
mod types;

pub use registry::SchemaRegistry;
pub use types::{CacheType, SchemaTable, StorageType, StorageVersion};
