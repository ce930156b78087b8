//! Beanstalkd exporter process: flags, HTTP endpoint, mapping file watcher
//! and optional background polling around [`bsx_core`].

pub mod cli;
pub mod poller;
pub mod server;
pub mod source;
pub mod watcher;

pub use cli::Args;
pub use poller::Poller;
pub use server::MetricsServer;
pub use source::MetricsSource;
pub use watcher::MappingWatcher;
