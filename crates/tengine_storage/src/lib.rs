mod repository;

pub use repository::{StorageConfig, TransferStore, SCHEMA_VERSION};
