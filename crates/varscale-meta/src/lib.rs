pub mod etcd;
pub mod memory;
pub mod resources;
pub mod types;

pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;
pub use resources::{ResourceStore, Versioned};
pub use types::{KeyValue, KvBackend, StoreError, WatchEvent, WatchStream};
