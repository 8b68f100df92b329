//! Touchpad driver contract
//!
//! A driver applies and reads `ParameterSet`s for one touchpad. Exactly one
//! driver is chosen at startup by `detect_driver` and handed to the state
//! machine; nothing else talks to the hardware.
//!
//! ## State convention
//! Touchpad states are expressed through the synaptics `TouchpadOff`
//! parameter unless a driver overrides `state_parameters` /
//! `state_from_parameters`:
//! - `0` - enabled
//! - `1` - fully disabled
//! - `2` - tapping and scrolling disabled

pub mod memory;
pub mod sysfs;

use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, BackendKind};
use crate::devices::{self, DeviceError};
use crate::parameters::ParameterSet;

pub use memory::MemoryDriver;
pub use sysfs::SysfsDriver;

/// Parameter carrying the touchpad state
pub const TOUCHPAD_OFF: &str = "TouchpadOff";

/// Logical touchpad state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchpadState {
    #[default]
    Enabled,
    FullyDisabled,
    TapAndScrollDisabled,
}

impl TouchpadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TouchpadState::Enabled => "enabled",
            TouchpadState::FullyDisabled => "fully_disabled",
            TouchpadState::TapAndScrollDisabled => "tap_and_scroll_disabled",
        }
    }

    /// Value of `TouchpadOff` for this state
    pub fn touchpad_off(&self) -> i64 {
        match self {
            TouchpadState::Enabled => 0,
            TouchpadState::FullyDisabled => 1,
            TouchpadState::TapAndScrollDisabled => 2,
        }
    }

    pub fn from_touchpad_off(value: i64) -> Option<Self> {
        match value {
            0 => Some(TouchpadState::Enabled),
            1 => Some(TouchpadState::FullyDisabled),
            2 => Some(TouchpadState::TapAndScrollDisabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TouchpadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TouchpadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "enabled" => Ok(TouchpadState::Enabled),
            "fully_disabled" | "disabled" => Ok(TouchpadState::FullyDisabled),
            "tap_and_scroll_disabled" => Ok(TouchpadState::TapAndScrollDisabled),
            other => Err(format!("unknown touchpad state '{}'", other)),
        }
    }
}

/// Failure reported by a driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DriverError {}

/// Hardware driver for one touchpad
///
/// Calls may block on device I/O; the state machine runs them on a blocking
/// worker thread.
pub trait TouchpadDriver: Send {
    /// Short backend name for logs and D-Bus
    fn name(&self) -> &str;

    /// Write `params` to the hardware. Must be idempotent.
    fn apply_config(&mut self, params: &ParameterSet) -> Result<(), DriverError>;

    /// Read the current hardware configuration into `params`
    fn get_config(&mut self, params: &mut ParameterSet) -> Result<(), DriverError>;

    /// Parameter names this driver understands; fixed for the driver's lifetime
    fn supported_parameters(&self) -> &[String];

    /// Text of the failure of the most recent call; empty when it succeeded
    fn error_string(&self) -> &str;

    /// Parameters that put the touchpad into `state`
    fn state_parameters(&self, state: TouchpadState) -> ParameterSet {
        ParameterSet::new().with(TOUCHPAD_OFF, state.touchpad_off())
    }

    /// State described by `params`, if they carry one
    fn state_from_parameters(&self, params: &ParameterSet) -> Option<TouchpadState> {
        params
            .get(TOUCHPAD_OFF)
            .and_then(|v| v.as_int())
            .and_then(TouchpadState::from_touchpad_off)
    }
}

/// Boxed driver as owned by the state machine
pub type BoxedDriver = Box<dyn TouchpadDriver>;

/// Pick a driver for the configured backend and the detected hardware
pub fn detect_driver(config: &BackendConfig) -> Result<BoxedDriver, DeviceError> {
    match config.kind {
        BackendKind::Memory => {
            tracing::info!("Using in-memory touchpad backend");
            Ok(Box::new(MemoryDriver::new()))
        }
        BackendKind::Sysfs => {
            let device = devices::find_touchpad(config.device.as_deref())?;
            Ok(Box::new(SysfsDriver::for_device(&device)?))
        }
        BackendKind::Auto => match devices::find_touchpad(config.device.as_deref())
            .and_then(|device| SysfsDriver::for_device(&device))
        {
            Ok(driver) => Ok(Box::new(driver)),
            Err(e) => {
                tracing::warn!(error = %e, "No usable touchpad detected, falling back to in-memory backend");
                Ok(Box::new(MemoryDriver::new()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParamValue;

    #[test]
    fn test_touchpad_off_mapping() {
        for state in [
            TouchpadState::Enabled,
            TouchpadState::FullyDisabled,
            TouchpadState::TapAndScrollDisabled,
        ] {
            assert_eq!(TouchpadState::from_touchpad_off(state.touchpad_off()), Some(state));
        }
        assert_eq!(TouchpadState::from_touchpad_off(3), None);
        assert_eq!(TouchpadState::from_touchpad_off(-1), None);
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("enabled".parse::<TouchpadState>(), Ok(TouchpadState::Enabled));
        assert_eq!("Fully-Disabled".parse::<TouchpadState>(), Ok(TouchpadState::FullyDisabled));
        assert_eq!("disabled".parse::<TouchpadState>(), Ok(TouchpadState::FullyDisabled));
        assert_eq!(
            " tap_and_scroll_disabled ".parse::<TouchpadState>(),
            Ok(TouchpadState::TapAndScrollDisabled)
        );
        assert!("sideways".parse::<TouchpadState>().is_err());
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&TouchpadState::TapAndScrollDisabled).unwrap();
        assert_eq!(json, "\"tap_and_scroll_disabled\"");
        let state: TouchpadState = serde_json::from_str("\"fully_disabled\"").unwrap();
        assert_eq!(state, TouchpadState::FullyDisabled);
    }

    #[test]
    fn test_default_state_convention() {
        let driver = MemoryDriver::new();
        let params = driver.state_parameters(TouchpadState::TapAndScrollDisabled);
        assert_eq!(params.get(TOUCHPAD_OFF), Some(&ParamValue::Int(2)));
        assert_eq!(
            driver.state_from_parameters(&params),
            Some(TouchpadState::TapAndScrollDisabled)
        );

        let unrelated = ParameterSet::new().with("TapButton1", 1i64);
        assert_eq!(driver.state_from_parameters(&unrelated), None);

        let bogus = ParameterSet::new().with(TOUCHPAD_OFF, 7i64);
        assert_eq!(driver.state_from_parameters(&bogus), None);
    }

    #[test]
    fn test_detect_memory_backend() {
        let config = BackendConfig {
            kind: BackendKind::Memory,
            device: None,
        };
        let driver = detect_driver(&config).unwrap();
        assert_eq!(driver.name(), "memory");
    }
}
