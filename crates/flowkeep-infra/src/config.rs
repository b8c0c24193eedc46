//! Configuration loader for flowkeep.
//!
//! Reads `flowkeep.toml` from the data directory (`~/.flowkeep/` by
//! default) and deserializes it into [`FlowkeepConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use flowkeep_types::config::{EngineConfig, FlowkeepConfig};

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "flowkeep.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FLOWKEEP_DATA_DIR";

/// Resolve the data directory.
///
/// Priority: `FLOWKEEP_DATA_DIR`, then `~/.flowkeep`, then `.flowkeep` in
/// the current directory.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".flowkeep");
    }

    PathBuf::from(".flowkeep")
}

/// Load configuration from `{data_dir}/flowkeep.toml`.
///
/// - Missing file: returns [`FlowkeepConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> FlowkeepConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return FlowkeepConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return FlowkeepConfig::default();
        }
    };

    match toml::from_str::<FlowkeepConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            FlowkeepConfig::default()
        }
    }
}

/// The `[engine]` section, with out-of-range values clamped.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    load_config(data_dir).await.engine.normalized()
}
