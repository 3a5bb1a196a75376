//! scanhost: runs untrusted scanning plugins in a fixed pool of isolated
//! script contexts, with deadlines, backpressure and bounded host-side buffers.

pub mod bridge;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod heap;
pub mod logger;
pub mod normalizer;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod stats;
pub mod store;
pub mod watcher;
pub mod worker;

pub use config::{ConfigManager, EngineConfig, EnvConfigManager, MapConfigManager};
pub use engine::PluginEngine;
pub use error::{EngineError, LoadError, Result, ValidationError};
pub use pool::{WorkerSnapshot, WorkerState};
pub use stats::ExecutorStats;
pub use store::{FilePluginStore, MemoryPluginStore, PluginRecord, PluginStore};

pub use scan_plugin;

#[cfg(feature = "heap-accounting")]
#[global_allocator]
static ALLOCATOR: heap::CountingAlloc = heap::CountingAlloc;
