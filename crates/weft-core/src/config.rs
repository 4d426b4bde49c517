//! Engine configuration loader.
//!
//! Reads an `EngineConfig` from a TOML file. Falls back to defaults when the
//! file is missing or malformed, so a bad config never stops the engine.

use std::path::Path;

use weft_types::config::EngineConfig;

/// Load engine configuration from `path`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning, returns the default.
/// - Otherwise the parsed config, with zero values clamped.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no engine config at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config.validated(),
        Err(err) => {
            tracing::warn!("failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}
