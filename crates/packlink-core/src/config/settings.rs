//! Settings parser for .packlink/config.toml

use super::types::Settings;
use crate::prelude::*;
use std::path::Path;

pub const CONFIG_FILENAME: &str = "config.toml";
pub const PACKLINK_DIR: &str = ".packlink";

// ─────────────────────────────────────────────────────────────────────────────
// Settings Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load settings from .packlink/config.toml
///
/// Returns default settings if file doesn't exist or can't be parsed.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = project_path.join(PACKLINK_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Create default config file in .packlink/ directory
pub fn init_config_dir(project_path: &Path) -> Result<()> {
    let packlink_dir = project_path.join(PACKLINK_DIR);

    if !packlink_dir.exists() {
        std::fs::create_dir_all(&packlink_dir)
            .with_context(|| format!("Failed to create {:?}", packlink_dir))?;
    }

    let config_path = packlink_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        std::fs::write(&config_path, generate_default_config())
            .with_context(|| format!("Failed to write {:?}", config_path))?;
        info!("Created default {:?}", config_path);
    }

    Ok(())
}

/// Save settings to .packlink/config.toml
///
/// Uses atomic write (temp file + rename).
pub fn save_settings(project_path: &Path, settings: &Settings) -> Result<()> {
    let packlink_dir = project_path.join(PACKLINK_DIR);

    if !packlink_dir.exists() {
        std::fs::create_dir_all(&packlink_dir)
            .with_context(|| format!("Failed to create {:?}", packlink_dir))?;
    }

    let config_path = packlink_dir.join(CONFIG_FILENAME);
    let temp_path = packlink_dir.join(".config.toml.tmp");

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let full_content = format!("# packlink configuration\n\n{}", content);

    // Atomic write: write to temp, then rename
    std::fs::write(&temp_path, &full_content).context("Failed to write temp settings file")?;
    std::fs::rename(&temp_path, &config_path)
        .with_context(|| format!("Failed to replace {:?}", config_path))?;

    info!("Saved settings to {:?}", config_path);
    Ok(())
}

fn generate_default_config() -> String {
    r#"# packlink configuration

[server]
host = "localhost:8081"      # host:port of the development server
# device = "Pixel 7"         # reported to the packager in the connection URL
# app = "com.example.app"

[connection]
reconnect_initial_delay_ms = 2000
reconnect_max_delay_ms = 10000
max_reconnect_attempts = 10  # give up and report after this many failures
request_timeout_secs = 60

[polling]
failure_delay_ms = 5000      # wait before re-polling after a network failure
connect_timeout_ms = 5000
"#
    .to_string()
}
