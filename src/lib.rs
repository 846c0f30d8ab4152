pub mod app;
pub mod cli;
pub mod config;
pub mod model;
pub mod storage;
pub mod sync;
pub mod ui;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use sync::{SyncEngine, SyncError};
