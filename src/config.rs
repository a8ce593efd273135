//! Configuration management for bitgrid-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (BITGRID_WIDTH, etc.)
//! 2. Project-local config file (`./bitgrid-emu.toml`)
//! 3. User config file (`~/.config/bitgrid-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # bitgrid-emu.toml
//!
//! # Default fabric dimensions (must be even)
//! grid_width = 64
//! grid_height = 64
//!
//! # Router turn penalty (hops are cost 1, each turn adds this)
//! turn_penalty = 1
//!
//! # Control server bind address
//! serve_host = "127.0.0.1"
//! serve_port = 9000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// bitgrid-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Default fabric width in cells. Must be even.
    pub grid_width: Option<u16>,

    /// Default fabric height in cells. Must be even.
    pub grid_height: Option<u16>,

    /// Extra cost the router charges per 90-degree turn.
    pub turn_penalty: Option<u32>,

    /// Host the control server binds to.
    pub serve_host: Option<String>,

    /// Port the control server binds to.
    pub serve_port: Option<u16>,

    /// Seam trace output path. Tracing is off when unset.
    pub trace_path: Option<String>,

    /// Seam trace format: "jsonl" or "csv".
    pub trace_format: Option<String>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `bitgrid-emu.toml`
    /// 3. User config `~/.config/bitgrid-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Get the fabric width, with fallback to default.
    pub fn grid_width(&self) -> u16 {
        self.grid_width.unwrap_or(64)
    }

    /// Get the fabric height, with fallback to default.
    pub fn grid_height(&self) -> u16 {
        self.grid_height.unwrap_or(64)
    }

    /// Get the router turn penalty, with fallback to default.
    pub fn turn_penalty(&self) -> u32 {
        self.turn_penalty.unwrap_or(1)
    }

    /// Get the control server host, with fallback to default.
    pub fn serve_host(&self) -> String {
        self.serve_host
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Get the control server port, with fallback to default.
    pub fn serve_port(&self) -> u16 {
        self.serve_port.unwrap_or(9000)
    }

    /// Load user configuration from ~/.config/bitgrid-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("bitgrid-emu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./bitgrid-emu.toml
    fn load_local_config() -> Option<Self> {
        // Try current directory
        let local_path = Path::new("bitgrid-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("bitgrid-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.grid_width.is_some() {
            self.grid_width = other.grid_width;
        }
        if other.grid_height.is_some() {
            self.grid_height = other.grid_height;
        }
        if other.turn_penalty.is_some() {
            self.turn_penalty = other.turn_penalty;
        }
        if other.serve_host.is_some() {
            self.serve_host = other.serve_host;
        }
        if other.serve_port.is_some() {
            self.serve_port = other.serve_port;
        }
        if other.trace_path.is_some() {
            self.trace_path = other.trace_path;
        }
        if other.trace_format.is_some() {
            self.trace_format = other.trace_format;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BITGRID_WIDTH") {
            match v.parse() {
                Ok(w) => {
                    log::info!("Using BITGRID_WIDTH from environment: {}", w);
                    self.grid_width = Some(w);
                }
                Err(_) => log::warn!("Ignoring unparsable BITGRID_WIDTH: {}", v),
            }
        }
        if let Ok(v) = std::env::var("BITGRID_HEIGHT") {
            match v.parse() {
                Ok(h) => {
                    log::info!("Using BITGRID_HEIGHT from environment: {}", h);
                    self.grid_height = Some(h);
                }
                Err(_) => log::warn!("Ignoring unparsable BITGRID_HEIGHT: {}", v),
            }
        }
        if let Ok(v) = std::env::var("BITGRID_TURN_PENALTY") {
            match v.parse() {
                Ok(p) => {
                    log::info!("Using BITGRID_TURN_PENALTY from environment: {}", p);
                    self.turn_penalty = Some(p);
                }
                Err(_) => log::warn!("Ignoring unparsable BITGRID_TURN_PENALTY: {}", v),
            }
        }
        if let Ok(host) = std::env::var("BITGRID_SERVE_HOST") {
            log::info!("Using BITGRID_SERVE_HOST from environment: {}", host);
            self.serve_host = Some(host);
        }
        if let Ok(v) = std::env::var("BITGRID_SERVE_PORT") {
            match v.parse() {
                Ok(p) => {
                    log::info!("Using BITGRID_SERVE_PORT from environment: {}", p);
                    self.serve_port = Some(p);
                }
                Err(_) => log::warn!("Ignoring unparsable BITGRID_SERVE_PORT: {}", v),
            }
        }
        if let Ok(path) = std::env::var("BITGRID_TRACE") {
            self.trace_path = Some(path);
        }
        if let Ok(fmt) = std::env::var("BITGRID_TRACE_FORMAT") {
            self.trace_format = Some(fmt);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bitgrid-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# bitgrid-emu configuration
# Place this file at ~/.config/bitgrid-emu/config.toml or ./bitgrid-emu.toml

# Default fabric dimensions in cells (both must be even)
grid_width = 64
grid_height = 64

# Extra routing cost per 90-degree turn (0 disables the penalty)
# turn_penalty = 1

# Control server bind address
# serve_host = "127.0.0.1"
# serve_port = 9000

# Seam trace capture (off unless a path is set)
# trace_path = "seams.jsonl"
# trace_format = "jsonl"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.grid_width(), 64);
        assert_eq!(config.grid_height(), 64);
        assert_eq!(config.turn_penalty(), 1);
        assert_eq!(config.serve_host(), "127.0.0.1");
        assert_eq!(config.serve_port(), 9000);
        assert!(config.trace_path.is_none());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            grid_width: Some(16),
            serve_port: Some(7000),
            ..Config::default()
        };

        let overlay = Config {
            grid_width: None,
            grid_height: Some(32),
            serve_port: Some(9100),
            ..Config::default()
        };

        base.merge(overlay);

        // grid_width unchanged (overlay was None)
        assert_eq!(base.grid_width, Some(16));
        // grid_height set from overlay
        assert_eq!(base.grid_height, Some(32));
        // serve_port overridden by overlay
        assert_eq!(base.serve_port, Some(9100));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let parsed: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(parsed.grid_width, Some(64));
        assert_eq!(parsed.grid_height, Some(64));
    }
}
