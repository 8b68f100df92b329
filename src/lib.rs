//! touchpadd Library
//!
//! Public API for testing and integration.

pub mod backend;
pub mod config;
pub mod config_watcher;
pub mod dbus;
pub mod devices;
pub mod parameters;
pub mod policy;
pub mod presence;
pub mod runtime;
pub mod state;

/// Re-export commonly used types
pub use backend::{detect_driver, BoxedDriver, DriverError, MemoryDriver, SysfsDriver, TouchpadDriver, TouchpadState};
pub use config::{Config, ConfigError, SharedConfig, new_shared_config, load_shared_config};
pub use config_watcher::start_config_watcher;
pub use dbus::{init_dbus_service, spawn_signal_forwarder, TouchpadService, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH};
pub use devices::{DeviceError, DeviceInfo, DeviceKind};
pub use parameters::{ParamValue, ParameterSet};
pub use policy::MousePolicy;
pub use presence::{EvdevPresenceMonitor, MonitorSettings, PresenceEvent, PresenceMonitor};
pub use runtime::Runtime;
pub use state::{TouchpadError, TouchpadNotification, TouchpadStateMachine, TypingPolicy};
