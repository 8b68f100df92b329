//! Configuration management for touchpadd
//!
//! Handles loading, validation, and hot-reload of JSON configuration files.
//! Configuration is stored at `~/.config/touchpadd/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::TouchpadState;
use crate::parameters::ParameterSet;

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "touchpadd";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

/// Default keyboard idle time before typing counts as finished
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 500;

/// Bounds for the keyboard idle timeout
const MIN_IDLE_TIMEOUT_MS: u64 = 100;
const MAX_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default mouse rescan interval
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const MAX_POLL_INTERVAL_SECS: u64 = 60;

// ============================================================================
// Backend Configuration
// ============================================================================

/// Which touchpad driver to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// sysfs if a touchpad is found, memory otherwise
    #[default]
    Auto,
    Sysfs,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "sysfs" => Ok(BackendKind::Sysfs),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend '{}' (expected auto, sysfs or memory)", other)),
        }
    }
}

/// Driver selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind (default: auto)
    #[serde(default)]
    pub kind: BackendKind,

    /// Touchpad to drive, by event node path or device name.
    /// First detected touchpad when unset.
    #[serde(default)]
    pub device: Option<String>,
}

// ============================================================================
// Typing Configuration
// ============================================================================

/// Keyboard activity handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Watch keyboards for activity
    #[serde(default = "default_true")]
    pub watch_keyboard: bool,

    /// Switch the touchpad to `typing_state` while typing
    #[serde(default)]
    pub disable_while_typing: bool,

    /// State used while typing (default: tap_and_scroll_disabled)
    #[serde(default = "default_typing_state")]
    pub typing_state: TouchpadState,

    /// Keyboard idle time after which typing is considered finished
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Do not count modifier-only presses (Ctrl+click, Shift+scroll)
    #[serde(default = "default_true")]
    pub ignore_modifiers: bool,
}

fn default_true() -> bool { true }
fn default_typing_state() -> TouchpadState { TouchpadState::TapAndScrollDisabled }
fn default_idle_timeout() -> u64 { DEFAULT_IDLE_TIMEOUT_MS }

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            watch_keyboard: true,
            disable_while_typing: false,
            typing_state: TouchpadState::TapAndScrollDisabled,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            ignore_modifiers: true,
        }
    }
}

impl TypingConfig {
    /// Validate and clamp values
    pub fn validate(&mut self) {
        self.idle_timeout_ms = self.idle_timeout_ms.clamp(MIN_IDLE_TIMEOUT_MS, MAX_IDLE_TIMEOUT_MS);
        if self.disable_while_typing && !self.watch_keyboard {
            tracing::warn!("disable_while_typing needs keyboard watching, enabling watch_keyboard");
            self.watch_keyboard = true;
        }
        if self.typing_state == TouchpadState::Enabled {
            tracing::warn!("typing_state 'enabled' would never disable anything, using tap_and_scroll_disabled");
            self.typing_state = TouchpadState::TapAndScrollDisabled;
        }
    }
}

// ============================================================================
// Mouse Configuration
// ============================================================================

/// External mouse handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MouseConfig {
    /// Fully disable the touchpad while an external mouse is plugged in
    #[serde(default)]
    pub disable_when_plugged_in: bool,

    /// Devices never counted as mice (case-insensitive name substrings),
    /// e.g. "TrackPoint" or a virtual pointer
    #[serde(default)]
    pub ignored_devices: Vec<String>,

    /// Seconds between input device rescans
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 { DEFAULT_POLL_INTERVAL_SECS }

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            disable_when_plugged_in: false,
            ignored_devices: Vec::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl MouseConfig {
    pub fn validate(&mut self) {
        self.poll_interval_secs = self.poll_interval_secs.clamp(1, MAX_POLL_INTERVAL_SECS);
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Driver selection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Keyboard activity settings
    #[serde(default)]
    pub typing: TypingConfig,

    /// External mouse settings
    #[serde(default)]
    pub mouse: MouseConfig,

    /// Touchpad parameters applied once at startup
    #[serde(default)]
    pub parameters: ParameterSet,

    /// Configuration file path (not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from file path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut config: Config =
            serde_json::from_str(&contents).map_err(ConfigError::ParseError)?;

        config.validate();
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            backend = ?config.backend.kind,
            watch_keyboard = config.typing.watch_keyboard,
            disable_while_typing = config.typing.disable_while_typing,
            disable_when_mouse = config.mouse.disable_when_plugged_in,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Reload from wherever this config came from
    pub fn reload(&self) -> Result<Self, ConfigError> {
        match &self.config_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Validate and clamp all sections
    pub fn validate(&mut self) {
        self.typing.validate();
        self.mouse.validate();
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => Self::default_config_path()
                .ok_or_else(|| ConfigError::ValidationError("No config path".to_string()))?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::ParseError)?;
        fs::write(&path, contents).map_err(ConfigError::IoError)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

// ============================================================================
// Shared Config (for hot-reload)
// ============================================================================

use std::sync::{Arc, RwLock};

/// Thread-safe shared configuration for hot-reload support
pub type SharedConfig = Arc<RwLock<Config>>;

/// Create a new shared config with defaults
pub fn new_shared_config() -> SharedConfig {
    Arc::new(RwLock::new(Config::default()))
}

/// Create a shared config from `path`, or from the default location
pub fn load_shared_config(path: Option<&Path>) -> Result<SharedConfig, ConfigError> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    Ok(Arc::new(RwLock::new(config)))
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing file
    IoError(std::io::Error),
    /// JSON parsing error
    ParseError(serde_json::Error),
    /// Validation error
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(e) => Some(e),
            ConfigError::ValidationError(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
