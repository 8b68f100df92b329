//! sysfs touchpad driver
//!
//! Enables and disables a touchpad through the kernel's per-device
//! `inhibited` attribute (Linux 5.11+), which works the same under X11 and
//! every Wayland compositor. The attribute is binary, so only `TouchpadOff`
//! values 0 and 1 can be honoured.
//!
//! Writing the attribute needs write access to
//! `/sys/class/input/eventN/device/inhibited`, usually granted by a udev rule.

use std::fs;
use std::path::{Path, PathBuf};

use super::{DriverError, TouchpadDriver, TouchpadState, TOUCHPAD_OFF};
use crate::devices::{DeviceError, DeviceInfo};
use crate::parameters::ParameterSet;

/// Touchpad driver writing the sysfs `inhibited` attribute
pub struct SysfsDriver {
    /// Device name, for logs
    device_name: String,
    /// Path to the `inhibited` attribute
    attribute: PathBuf,
    supported: Vec<String>,
    error: String,
}

impl SysfsDriver {
    /// Driver for a detected touchpad
    pub fn for_device(device: &DeviceInfo) -> Result<Self, DeviceError> {
        let attribute = device.inhibited_attribute().ok_or(DeviceError::DeviceNotFound)?;
        if !attribute.exists() {
            tracing::warn!(
                device = %device.name,
                path = %attribute.display(),
                "Kernel does not expose the inhibited attribute"
            );
            return Err(DeviceError::DeviceNotFound);
        }

        tracing::info!(
            device = %device.name,
            path = %attribute.display(),
            "Using sysfs touchpad backend"
        );
        Ok(Self::with_attribute(&device.name, attribute))
    }

    /// Driver for an explicit attribute path
    pub fn with_attribute(device_name: &str, attribute: impl AsRef<Path>) -> Self {
        Self {
            device_name: device_name.to_string(),
            attribute: attribute.as_ref().to_path_buf(),
            supported: vec![TOUCHPAD_OFF.to_string()],
            error: String::new(),
        }
    }

    pub fn attribute(&self) -> &Path {
        &self.attribute
    }

    fn fail(&mut self, message: String) -> DriverError {
        tracing::warn!(device = %self.device_name, error = %message, "sysfs backend call failed");
        self.error = message.clone();
        DriverError::new(message)
    }

    fn read_inhibited(&self) -> Result<bool, String> {
        let contents = fs::read_to_string(&self.attribute)
            .map_err(|e| format!("Failed to read {}: {}", self.attribute.display(), e))?;
        match contents.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(format!("Unexpected inhibited value '{}'", other)),
        }
    }

    fn write_inhibited(&self, inhibited: bool) -> Result<(), String> {
        let value = if inhibited { "1" } else { "0" };
        fs::write(&self.attribute, value)
            .map_err(|e| format!("Failed to write {}: {}", self.attribute.display(), e))
    }
}

impl TouchpadDriver for SysfsDriver {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn apply_config(&mut self, params: &ParameterSet) -> Result<(), DriverError> {
        self.error.clear();
        let Some(value) = params.get(TOUCHPAD_OFF) else {
            // Nothing this backend can express
            return Ok(());
        };

        let inhibited = match value.as_int().and_then(TouchpadState::from_touchpad_off) {
            Some(TouchpadState::Enabled) => false,
            Some(TouchpadState::FullyDisabled) => true,
            Some(TouchpadState::TapAndScrollDisabled) => {
                return Err(self.fail(
                    "Tap and scroll disabling is not supported by the sysfs backend".to_string(),
                ));
            }
            None => {
                return Err(self.fail(format!("Invalid {} value '{}'", TOUCHPAD_OFF, value)));
            }
        };

        match self.write_inhibited(inhibited) {
            Ok(()) => {
                tracing::debug!(device = %self.device_name, inhibited, "Touchpad inhibited state written");
                Ok(())
            }
            Err(message) => Err(self.fail(message)),
        }
    }

    fn get_config(&mut self, params: &mut ParameterSet) -> Result<(), DriverError> {
        self.error.clear();
        match self.read_inhibited() {
            Ok(inhibited) => {
                let state = if inhibited {
                    TouchpadState::FullyDisabled
                } else {
                    TouchpadState::Enabled
                };
                params.set(TOUCHPAD_OFF, state.touchpad_off());
                Ok(())
            }
            Err(message) => Err(self.fail(message)),
        }
    }

    fn supported_parameters(&self) -> &[String] {
        &self.supported
    }

    fn error_string(&self) -> &str {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParamValue;

    fn fake_attribute(initial: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inhibited");
        fs::write(&path, initial).unwrap();
        (dir, path)
    }

    #[test]
    fn test_get_config_reads_attribute() {
        let (_dir, path) = fake_attribute("1\n");
        let mut driver = SysfsDriver::with_attribute("Test TouchPad", &path);

        let mut params = ParameterSet::new();
        driver.get_config(&mut params).unwrap();
        assert_eq!(params.get(TOUCHPAD_OFF), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn test_apply_writes_attribute() {
        let (_dir, path) = fake_attribute("0\n");
        let mut driver = SysfsDriver::with_attribute("Test TouchPad", &path);

        driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 1i64))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");

        driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 0i64))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn test_tap_and_scroll_rejected() {
        let (_dir, path) = fake_attribute("0\n");
        let mut driver = SysfsDriver::with_attribute("Test TouchPad", &path);

        let err = driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 2i64))
            .unwrap_err();
        assert!(err.message.contains("not supported"));
        assert_eq!(driver.error_string(), err.message);
        assert_eq!(fs::read_to_string(&path).unwrap(), "0\n");
    }

    #[test]
    fn test_missing_attribute_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = SysfsDriver::with_attribute("Gone", dir.path().join("inhibited"));

        let mut params = ParameterSet::new();
        assert!(driver.get_config(&mut params).is_err());
        assert!(driver.error_string().contains("Failed to read"));
    }

    #[test]
    fn test_error_string_cleared_by_next_success() {
        let (_dir, path) = fake_attribute("0\n");
        let mut driver = SysfsDriver::with_attribute("Test TouchPad", &path);

        assert!(driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 2i64))
            .is_err());
        assert!(!driver.error_string().is_empty());

        driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 1i64))
            .unwrap();
        assert_eq!(driver.error_string(), "");
    }

    #[test]
    fn test_error_string_empty_before_failure() {
        let (_dir, path) = fake_attribute("0");
        let driver = SysfsDriver::with_attribute("Test TouchPad", &path);
        assert_eq!(driver.error_string(), "");
        assert_eq!(driver.supported_parameters(), &[TOUCHPAD_OFF.to_string()]);
    }
}
