//! In-process touchpad driver
//!
//! Keeps the applied configuration in memory. Used for `--backend memory`
//! dry runs, as the fallback when no touchpad is detected, and by tests,
//! which can script failures of either direction.

use std::sync::{Arc, Mutex};

use super::{DriverError, TouchpadDriver, TOUCHPAD_OFF};
use crate::parameters::ParameterSet;

/// Parameter names accepted by the memory driver (synaptics naming)
pub const MEMORY_PARAMETERS: &[&str] = &[
    TOUCHPAD_OFF,
    "TapButton1",
    "TapButton2",
    "TapButton3",
    "VertEdgeScroll",
    "HorizEdgeScroll",
    "VertTwoFingerScroll",
    "HorizTwoFingerScroll",
    "PalmDetect",
    "MinSpeed",
    "MaxSpeed",
];

/// Observable side of a `MemoryDriver`, shared with tests
#[derive(Debug, Default)]
pub struct MemoryDriverState {
    /// Current "hardware" configuration
    pub config: ParameterSet,
    /// Number of `apply_config` calls, failed ones included
    pub apply_calls: usize,
    /// Number of `get_config` calls
    pub query_calls: usize,
    /// Error returned by every `apply_config` while set
    pub apply_failure: Option<String>,
    /// Error returned by every `get_config` while set
    pub query_failure: Option<String>,
}

pub type SharedMemoryDriverState = Arc<Mutex<MemoryDriverState>>;

/// In-memory driver
pub struct MemoryDriver {
    supported: Vec<String>,
    state: SharedMemoryDriverState,
    error: String,
}

impl MemoryDriver {
    /// Driver starting enabled
    pub fn new() -> Self {
        Self::with_config(ParameterSet::new().with(TOUCHPAD_OFF, 0i64))
    }

    /// Driver whose hardware starts out with `config`
    pub fn with_config(config: ParameterSet) -> Self {
        let state = MemoryDriverState {
            config,
            ..Default::default()
        };
        Self {
            supported: MEMORY_PARAMETERS.iter().map(|s| s.to_string()).collect(),
            state: Arc::new(Mutex::new(state)),
            error: String::new(),
        }
    }

    /// Handle for inspecting the driver or injecting failures after it has
    /// been moved into the state machine
    pub fn handle(&self) -> SharedMemoryDriverState {
        Arc::clone(&self.state)
    }

    fn fail(&mut self, message: String) -> DriverError {
        self.error = message.clone();
        DriverError::new(message)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TouchpadDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn apply_config(&mut self, params: &ParameterSet) -> Result<(), DriverError> {
        self.error.clear();
        let failure = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| DriverError::new(format!("Lock error: {}", e)))?;
            state.apply_calls += 1;
            match state.apply_failure.clone() {
                Some(message) => Some(message),
                None => {
                    state.config.merge(params);
                    None
                }
            }
        };

        match failure {
            Some(message) => Err(self.fail(message)),
            None => {
                tracing::debug!(parameters = params.len(), "Memory backend applied configuration");
                Ok(())
            }
        }
    }

    fn get_config(&mut self, params: &mut ParameterSet) -> Result<(), DriverError> {
        self.error.clear();
        let result = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| DriverError::new(format!("Lock error: {}", e)))?;
            state.query_calls += 1;
            match state.query_failure.clone() {
                Some(message) => Err(message),
                None => Ok(state.config.clone()),
            }
        };

        match result {
            Ok(config) => {
                params.merge(&config);
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

    #[test]
    fn test_apply_then_get() {
        let mut driver = MemoryDriver::new();
        let params = ParameterSet::new().with(TOUCHPAD_OFF, 1i64).with("PalmDetect", true);
        driver.apply_config(&params).unwrap();

        let mut read = ParameterSet::new();
        driver.get_config(&mut read).unwrap();
        assert_eq!(read.get(TOUCHPAD_OFF), Some(&ParamValue::Int(1)));
        assert_eq!(read.get("PalmDetect"), Some(&ParamValue::Bool(true)));
        assert_eq!(driver.error_string(), "");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut driver = MemoryDriver::new();
        let params = ParameterSet::new().with(TOUCHPAD_OFF, 2i64);
        driver.apply_config(&params).unwrap();
        driver.apply_config(&params).unwrap();

        let handle = driver.handle();
        let state = handle.lock().unwrap();
        assert_eq!(state.apply_calls, 2);
        assert_eq!(state.config.len(), 1);
    }

    #[test]
    fn test_scripted_failures() {
        let mut driver = MemoryDriver::new();
        let handle = driver.handle();
        handle.lock().unwrap().apply_failure = Some("I/O error".to_string());

        let err = driver
            .apply_config(&ParameterSet::new().with(TOUCHPAD_OFF, 1i64))
            .unwrap_err();
        assert_eq!(err.message, "I/O error");
        assert_eq!(driver.error_string(), "I/O error");
        // Hardware untouched
        assert_eq!(
            handle.lock().unwrap().config.get(TOUCHPAD_OFF),
            Some(&ParamValue::Int(0))
        );

        handle.lock().unwrap().query_failure = Some("device gone".to_string());
        let mut read = ParameterSet::new();
        assert!(driver.get_config(&mut read).is_err());
        assert!(read.is_empty());
        assert_eq!(driver.error_string(), "device gone");
    }

    #[test]
    fn test_error_string_cleared_after_recovery() {
        let mut driver = MemoryDriver::new();
        let handle = driver.handle();
        handle.lock().unwrap().apply_failure = Some("I/O error".to_string());
        let params = ParameterSet::new().with(TOUCHPAD_OFF, 1i64);
        assert!(driver.apply_config(&params).is_err());

        handle.lock().unwrap().apply_failure = None;
        driver.apply_config(&params).unwrap();
        assert_eq!(driver.error_string(), "");
        assert_eq!(
            handle.lock().unwrap().config.get(TOUCHPAD_OFF),
            Some(&ParamValue::Int(1))
        );
    }

    #[test]
    fn test_supported_parameters_listed() {
        let driver = MemoryDriver::new();
        let supported = driver.supported_parameters();
        assert_eq!(supported.len(), MEMORY_PARAMETERS.len());
        assert!(supported.iter().any(|p| p == TOUCHPAD_OFF));
    }
}
