pub mod kv;
pub mod profiles;

pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use profiles::{ConfigStore, LoadOutcome};
