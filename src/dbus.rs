//! D-Bus IPC server for touchpadd
//!
//! Exposes the touchpad state machine on the session bus so desktop shells
//! and settings modules can drive it.
//!
//! ## Interface: org.kde.touchpadd.Daemon
//!
//! ### Methods:
//! - `SetTouchpadState(state: String)` - Request enabled, fully_disabled or tap_and_scroll_disabled
//! - `GetTouchpadState() -> String` - Last committed state
//! - `Toggle() -> String` - Flip between enabled and fully disabled
//! - `IsMousePluggedIn() -> bool` - External mouse presence
//! - `WatchForEvents(keyboard: bool)` - Start or reconfigure event watching
//! - `SupportedParameters() -> Vec<String>` - Parameters the backend accepts
//! - `ErrorString() -> String` - Backend error text
//! - `GetParameters() -> String` - Backend configuration as JSON
//! - `ApplyParameters(json: String)` - Apply a JSON parameter object
//! - `ReloadConfig()` - Re-read config.json
//!
//! ### Signals:
//! - `TouchpadStateChanged(state: String)`
//! - `MousesChanged(present: bool)`
//! - `KeyboardActivityStarted()`
//! - `KeyboardActivityFinished()`

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::backend::TouchpadState;
use crate::parameters::ParameterSet;
use crate::runtime::Runtime;
use crate::state::{TouchpadError, TouchpadNotification, TouchpadStateMachine};

/// D-Bus interface name
pub const DBUS_INTERFACE: &str = "org.kde.touchpadd.Daemon";

/// D-Bus object path
pub const DBUS_PATH: &str = "/org/kde/touchpadd/Daemon";

/// D-Bus bus name
pub const DBUS_NAME: &str = "org.kde.touchpadd";

/// touchpadd D-Bus service
pub struct TouchpadService {
    runtime: Arc<Runtime>,
    /// Daemon version
    version: String,
}

impl TouchpadService {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn machine(&self) -> &TouchpadStateMachine {
        self.runtime.machine()
    }
}

/// Map a state machine error onto a D-Bus error
///
/// Driver failures carry the backend's own error text.
fn to_fdo_error(error: TouchpadError) -> fdo::Error {
    match error {
        TouchpadError::UnsupportedParameter(_) | TouchpadError::InvalidParameterValue(_) => {
            fdo::Error::InvalidArgs(error.to_string())
        }
        TouchpadError::DriverApplyFailed(_) | TouchpadError::DriverQueryFailed(_) => {
            fdo::Error::Failed(error.message())
        }
        TouchpadError::ShutDown => fdo::Error::Failed(error.to_string()),
    }
}

#[interface(name = "org.kde.touchpadd.Daemon")]
impl TouchpadService {
    // =========================================================================
    // METHODS
    // =========================================================================

    /// Request a touchpad state
    ///
    /// # Arguments
    /// * `state` - "enabled", "fully_disabled" or "tap_and_scroll_disabled"
    async fn set_touchpad_state(&self, state: &str) -> fdo::Result<()> {
        tracing::info!(state, "SetTouchpadState called");
        let state: TouchpadState = state.parse().map_err(fdo::Error::InvalidArgs)?;
        self.machine().set_touchpad_state(state).await.map_err(to_fdo_error)
    }

    /// Last committed touchpad state
    async fn get_touchpad_state(&self) -> fdo::Result<String> {
        Ok(self.machine().touchpad_state().as_str().to_string())
    }

    /// Switch between enabled and fully disabled
    ///
    /// # Returns
    /// The state after toggling
    async fn toggle(&self) -> fdo::Result<String> {
        tracing::info!("Toggle called");
        let state = self.machine().toggle().await.map_err(to_fdo_error)?;
        Ok(state.as_str().to_string())
    }

    /// Whether an external mouse is plugged in
    async fn is_mouse_plugged_in(&self) -> fdo::Result<bool> {
        Ok(self.machine().is_mouse_plugged_in())
    }

    /// Start watching for mouse presence, and keyboard activity if `keyboard`
    async fn watch_for_events(&self, keyboard: bool) -> fdo::Result<()> {
        tracing::info!(keyboard, "WatchForEvents called");
        self.machine().watch_for_events(keyboard).await;
        Ok(())
    }

    async fn supported_parameters(&self) -> fdo::Result<Vec<String>> {
        Ok(self.machine().supported_parameters().to_vec())
    }

    /// Backend error text, empty when the last backend call succeeded
    async fn error_string(&self) -> fdo::Result<String> {
        Ok(self.machine().last_error())
    }

    /// Current backend configuration as a JSON object
    async fn get_parameters(&self) -> fdo::Result<String> {
        let params = self.machine().current_parameters().await.map_err(to_fdo_error)?;
        serde_json::to_string(&params)
            .map_err(|e| fdo::Error::Failed(format!("Failed to encode parameters: {}", e)))
    }

    /// Apply a JSON object of backend parameters
    ///
    /// # Arguments
    /// * `json` - e.g. `{"TouchpadOff": 1}`
    async fn apply_parameters(&self, json: &str) -> fdo::Result<()> {
        tracing::info!(json, "ApplyParameters called");
        let params: ParameterSet = serde_json::from_str(json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("Invalid parameter JSON: {}", e)))?;
        self.machine().apply_parameters(params).await.map_err(to_fdo_error)
    }

    /// Reload configuration from disk
    ///
    /// Typing, mouse and device-ignore settings take effect immediately.
    async fn reload_config(&self) -> fdo::Result<()> {
        tracing::info!("ReloadConfig called - reloading configuration from disk");
        self.runtime.reload().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to reload configuration");
            fdo::Error::Failed(format!("Config reload failed: {}", e))
        })
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Emitted after a new state is committed
    #[zbus(signal)]
    async fn touchpad_state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

    /// Emitted when external mouse presence changes
    #[zbus(signal)]
    async fn mouses_changed(emitter: &SignalEmitter<'_>, present: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn keyboard_activity_started(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn keyboard_activity_finished(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    /// Get daemon version
    #[zbus(property)]
    async fn daemon_version(&self) -> &str {
        &self.version
    }

    /// Name of the active touchpad backend
    #[zbus(property)]
    async fn backend(&self) -> &str {
        self.machine().driver_name()
    }
}

/// Initialize and run the D-Bus service
///
/// Connects to the session bus, registers the service name, and exports
/// the interface at the object path.
///
/// # Returns
/// A `zbus::Connection` that should be kept alive for the service to run.
pub async fn init_dbus_service(runtime: Arc<Runtime>) -> zbus::Result<zbus::Connection> {
    let service = TouchpadService::new(runtime);

    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        name = DBUS_NAME,
        path = DBUS_PATH,
        "D-Bus service registered"
    );

    Ok(connection)
}

/// Re-emit state machine notifications as D-Bus signals
///
/// Runs until the machine closes the subscription on shutdown.
pub fn spawn_signal_forwarder(
    connection: zbus::Connection,
    mut notifications: mpsc::UnboundedReceiver<TouchpadNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let emitter = match SignalEmitter::new(&connection, DBUS_PATH) {
            Ok(emitter) => emitter,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create D-Bus signal emitter");
                return;
            }
        };

        while let Some(notification) = notifications.recv().await {
            let result = match notification {
                TouchpadNotification::TouchpadStateChanged(state) => {
                    TouchpadService::touchpad_state_changed(&emitter, state.as_str()).await
                }
                TouchpadNotification::MousesChanged(present) => {
                    TouchpadService::mouses_changed(&emitter, present).await
                }
                TouchpadNotification::KeyboardActivityStarted => {
                    TouchpadService::keyboard_activity_started(&emitter).await
                }
                TouchpadNotification::KeyboardActivityFinished => {
                    TouchpadService::keyboard_activity_finished(&emitter).await
                }
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, ?notification, "Failed to emit D-Bus signal");
            }
        }

        tracing::debug!("Signal forwarder stopped");
    })
}
