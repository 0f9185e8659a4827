//! Configuration file parsing for packlink
//!
//! Supports:
//! - `.packlink/config.toml` - Dev server, connection and polling settings

pub mod settings;
pub mod types;

pub use settings::{init_config_dir, load_settings, save_settings, CONFIG_FILENAME, PACKLINK_DIR};
pub use types::*;
