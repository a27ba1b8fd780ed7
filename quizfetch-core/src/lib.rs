pub mod browser;
pub mod config;
pub mod error;

pub use config::{load_exporter_config, ExporterConfig};
pub use error::{ConfigError, Result};
