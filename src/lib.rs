pub mod config;
pub mod counter;
pub mod download;
pub mod error;
pub mod lock;
pub mod logger;
pub mod plugin;
pub mod plugin_manager;
pub mod server;
pub mod store;
pub mod tracking;
pub mod utils;

pub use config::Config;
pub use error::{CounterError, Result};
pub use plugin_manager::PluginManager;

pub mod prelude {
    pub use crate::config::{Config, CountPolicy, LockStrategy};
    pub use crate::counter::DownloadCounter;
    pub use crate::download::{DownloadHandler, DownloadRequest};
    pub use crate::lock::{LockGuard, LockManager, LockProvider};
    pub use crate::plugin::Plugin;
    pub use crate::server::{AppState, DownloadServer};
    pub use crate::store::{CatalogResourceStore, MemoryMetaStore, MetaStore, ResourceStore, SledMetaStore};
    pub use crate::tracking::TrackingPolicy;
}
