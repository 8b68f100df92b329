//! Touchpad state machine
//!
//! Owns the committed `TouchpadState` and is the only component that issues
//! driver calls. One instance lives for the whole daemon run and is shared
//! by `Arc` with the D-Bus service and the policies.
//!
//! ## Guarantees
//! - A state is committed only after the driver accepted it. Readers and
//!   subscribers never see a requested-but-unconfirmed value.
//! - Transitions are serialised by an async mutex held across the driver
//!   call, so a concurrent request can never act on a stale prior state.
//! - Driver calls run on the blocking pool. Reading the committed state does
//!   not wait for an in-flight apply.
//! - Notifications go to every subscriber in registration order and are sent
//!   while the transition lock is held, so they arrive in commit order.
//! - There is no timeout on driver calls. A driver that never returns stalls
//!   the transition waiting on it; reads keep working.
//!
//! ## Typing policy
//! With `TypingPolicy::enabled`, a keyboard activity start while `Enabled`
//! switches to the typing state and the finish edge restores `Enabled`,
//! provided nothing else changed the state in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::backend::{BoxedDriver, DriverError, TouchpadState};
use crate::parameters::ParameterSet;
use crate::presence::{PresenceEvent, PresenceMonitor};

/// Notification delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchpadNotification {
    /// A new state was committed
    TouchpadStateChanged(TouchpadState),
    /// External mouse presence changed
    MousesChanged(bool),
    KeyboardActivityStarted,
    KeyboardActivityFinished,
}

/// Auto-disable while typing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingPolicy {
    pub enabled: bool,
    /// State used while typing
    pub typing_state: TouchpadState,
}

impl Default for TypingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            typing_state: TouchpadState::TapAndScrollDisabled,
        }
    }
}

/// What a transition asks the driver to do
enum ApplyRequest {
    State(TouchpadState),
    Parameters(ParameterSet),
}

/// Bookkeeping guarded by the transition lock
#[derive(Debug, Default)]
struct Transitions {
    /// `watch_for_events` has been called
    watching: bool,
    keyboard_watched: bool,
    /// Last presence reported to subscribers
    mouse_present: bool,
    keyboard_active: bool,
    /// Pending typing restore, kept until typing finishes
    restore_after_typing: Option<TypingRestore>,
    typing: TypingPolicy,
}

/// What the typing policy changed and what to put back
#[derive(Debug, Clone, Copy)]
struct TypingRestore {
    /// State before typing started
    previous: TouchpadState,
    /// State the policy applied
    applied: TouchpadState,
}

type SharedDriver = Arc<Mutex<BoxedDriver>>;

/// The touchpad state machine
pub struct TouchpadStateMachine {
    driver: SharedDriver,
    presence: Arc<dyn PresenceMonitor>,
    transitions: tokio::sync::Mutex<Transitions>,
    committed: RwLock<TouchpadState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TouchpadNotification>>>,
    /// Driver error text as of the last driver call
    last_error: RwLock<String>,
    driver_name: String,
    supported: Vec<String>,
    startup_error: Option<TouchpadError>,
    shut_down: AtomicBool,
}

impl TouchpadStateMachine {
    /// Create the state machine, reading the initial state from the driver
    ///
    /// If the driver cannot be queried the machine starts `Enabled` and the
    /// failure is kept in `startup_error`.
    pub async fn new(
        driver: BoxedDriver,
        presence: Arc<dyn PresenceMonitor>,
        typing: TypingPolicy,
    ) -> Self {
        let driver_name = driver.name().to_string();
        let supported = driver.supported_parameters().to_vec();
        let driver: SharedDriver = Arc::new(Mutex::new(driver));

        let (initial, error_text) = call_driver(&driver, TouchpadError::DriverQueryFailed, |d| {
            let mut params = ParameterSet::new();
            d.get_config(&mut params)
                .map_err(|e| TouchpadError::DriverQueryFailed(e.message))?;
            d.state_from_parameters(&params).ok_or_else(|| {
                TouchpadError::DriverQueryFailed(
                    "Driver configuration does not describe a touchpad state".to_string(),
                )
            })
        })
        .await;

        let (state, startup_error) = match initial {
            Ok(state) => {
                tracing::info!(backend = %driver_name, state = %state, "Initial touchpad state read from driver");
                (state, None)
            }
            Err(e) => {
                tracing::warn!(backend = %driver_name, error = %e, "Could not query touchpad, assuming enabled");
                (TouchpadState::Enabled, Some(e))
            }
        };

        Self {
            driver,
            presence,
            transitions: tokio::sync::Mutex::new(Transitions {
                typing,
                ..Default::default()
            }),
            committed: RwLock::new(state),
            subscribers: Mutex::new(Vec::new()),
            last_error: RwLock::new(error_text.unwrap_or_default()),
            driver_name,
            supported,
            startup_error,
            shut_down: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Last committed state
    pub fn touchpad_state(&self) -> TouchpadState {
        match self.committed.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_mouse_plugged_in(&self) -> bool {
        self.presence.is_mouse_plugged_in()
    }

    pub fn supported_parameters(&self) -> &[String] {
        &self.supported
    }

    /// Driver error text as of the last driver call
    pub fn last_error(&self) -> String {
        self.last_error
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Query failure at startup, if the initial state had to be assumed
    pub fn startup_error(&self) -> Option<&TouchpadError> {
        self.startup_error.as_ref()
    }

    /// Read the full configuration from the driver
    pub async fn current_parameters(&self) -> Result<ParameterSet, TouchpadError> {
        self.ensure_running()?;
        self.run(TouchpadError::DriverQueryFailed, |d| {
            let mut params = ParameterSet::new();
            d.get_config(&mut params)
                .map_err(|e| TouchpadError::DriverQueryFailed(e.message))?;
            Ok(params)
        })
        .await
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Request a new state
    ///
    /// The driver is always called, even for the current state. Subscribers
    /// hear `TouchpadStateChanged` only when the committed value changes.
    pub async fn set_touchpad_state(&self, state: TouchpadState) -> Result<(), TouchpadError> {
        let mut transitions = self.transitions.lock().await;
        self.apply_locked(ApplyRequest::State(state)).await?;
        if transitions.restore_after_typing.take().is_some() {
            tracing::debug!("Explicit state request replaces the typing restore");
        }
        Ok(())
    }

    /// Enabled becomes fully disabled; any other state becomes enabled
    pub async fn toggle(&self) -> Result<TouchpadState, TouchpadError> {
        let mut transitions = self.transitions.lock().await;
        let target = match self.touchpad_state() {
            TouchpadState::Enabled => TouchpadState::FullyDisabled,
            _ => TouchpadState::Enabled,
        };
        self.apply_locked(ApplyRequest::State(target)).await?;
        transitions.restore_after_typing = None;
        Ok(target)
    }

    /// Apply an arbitrary parameter set
    ///
    /// Every name must be supported by the driver, otherwise nothing is
    /// applied. If the set carries a touchpad state, that state is committed.
    pub async fn apply_parameters(&self, params: ParameterSet) -> Result<(), TouchpadError> {
        let mut transitions = self.transitions.lock().await;
        if let Some(state) = self.apply_locked(ApplyRequest::Parameters(params)).await? {
            tracing::debug!(state = %state, "Parameter set carried a touchpad state");
            transitions.restore_after_typing = None;
        }
        Ok(())
    }

    /// Caller must hold the transition lock
    async fn apply_locked(&self, request: ApplyRequest) -> Result<Option<TouchpadState>, TouchpadError> {
        self.ensure_running()?;

        let target = self
            .run(TouchpadError::DriverApplyFailed, move |d| {
                let (params, target) = match request {
                    ApplyRequest::State(state) => (d.state_parameters(state), Some(state)),
                    ApplyRequest::Parameters(params) => {
                        let target = d.state_from_parameters(&params);
                        if target.is_none() {
                            let state_keys = d.state_parameters(TouchpadState::Enabled);
                            if let Some(name) = state_keys.names().find(|n| params.contains(n)) {
                                return Err(TouchpadError::InvalidParameterValue(name.to_string()));
                            };
                        }
                        (params, target)
                    }
                };

                if let Some(name) = params.first_unsupported(d.supported_parameters()) {
                    return Err(TouchpadError::UnsupportedParameter(name.to_string()));
                }

                d.apply_config(&params)
                    .map_err(|e| TouchpadError::DriverApplyFailed(e.message))?;
                Ok(target)
            })
            .await;

        match &target {
            Ok(Some(state)) => self.commit(*state),
            Ok(None) => {}
            Err(e) => tracing::warn!(backend = %self.driver_name, error = %e, "Touchpad configuration rejected"),
        }
        target
    }

    fn commit(&self, state: TouchpadState) {
        let previous = match self.committed.write() {
            Ok(mut committed) => std::mem::replace(&mut *committed, state),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), state),
        };

        if previous != state {
            tracing::info!(from = %previous, to = %state, "Touchpad state committed");
            self.notify(TouchpadNotification::TouchpadStateChanged(state));
        } else {
            tracing::debug!(state = %state, "Touchpad state re-applied");
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Start (or reconfigure) event handling
    ///
    /// Mouse presence is always watched; keyboard activity only when
    /// `keyboard` is set. Turning keyboard watching off during activity
    /// counts as the activity finishing.
    pub async fn watch_for_events(&self, keyboard: bool) {
        if self.shut_down.load(Ordering::SeqCst) {
            tracing::debug!("watch_for_events after shutdown ignored");
            return;
        }

        let mut transitions = self.transitions.lock().await;
        let first = !transitions.watching;
        if first {
            transitions.watching = true;
            transitions.mouse_present = self.presence.is_mouse_plugged_in();
            tracing::info!(mouse_present = transitions.mouse_present, keyboard, "Watching for input events");
        }

        if first || transitions.keyboard_watched != keyboard {
            transitions.keyboard_watched = keyboard;
            self.presence.set_keyboard_watch(keyboard);
            if !keyboard && transitions.keyboard_active {
                self.finish_typing(&mut transitions).await;
            }
        }
    }

    /// Feed one event from the presence monitor
    ///
    /// Events arriving before `watch_for_events` or after shutdown are dropped.
    pub async fn handle_presence_event(&self, event: PresenceEvent) {
        let mut transitions = self.transitions.lock().await;
        if !transitions.watching || self.shut_down.load(Ordering::SeqCst) {
            tracing::trace!(?event, "Presence event ignored, not watching");
            return;
        }

        match event {
            PresenceEvent::MousePresenceChanged(present) => {
                if transitions.mouse_present != present {
                    transitions.mouse_present = present;
                    self.notify(TouchpadNotification::MousesChanged(present));
                }
            }
            PresenceEvent::KeyboardActivityStarted => {
                if !transitions.keyboard_watched || transitions.keyboard_active {
                    return;
                }
                transitions.keyboard_active = true;
                self.notify(TouchpadNotification::KeyboardActivityStarted);
                self.start_typing(&mut transitions).await;
            }
            PresenceEvent::KeyboardActivityFinished => {
                if !transitions.keyboard_active {
                    tracing::trace!("Keyboard activity finished without start");
                    return;
                }
                self.finish_typing(&mut transitions).await;
            }
        }
    }

    /// Replace the typing policy
    ///
    /// Disabling it while the touchpad is held in the typing state restores
    /// the previous state right away.
    pub async fn set_typing_policy(&self, policy: TypingPolicy) {
        let mut transitions = self.transitions.lock().await;
        transitions.typing = policy;

        if !policy.enabled {
            if let Some(restore) = transitions.restore_after_typing.take() {
                if self.touchpad_state() == restore.applied {
                    if let Err(e) = self.apply_locked(ApplyRequest::State(restore.previous)).await {
                        tracing::warn!(error = %e, "Failed to restore touchpad after disabling typing policy");
                    }
                }
            }
        }
    }

    async fn start_typing(&self, transitions: &mut Transitions) {
        let policy = transitions.typing;
        if !policy.enabled || self.touchpad_state() != TouchpadState::Enabled {
            return;
        }

        match self.apply_locked(ApplyRequest::State(policy.typing_state)).await {
            Ok(_) => {
                transitions.restore_after_typing = Some(TypingRestore {
                    previous: TouchpadState::Enabled,
                    applied: policy.typing_state,
                })
            }
            Err(e) => tracing::warn!(error = %e, "Failed to disable touchpad while typing"),
        }
    }

    async fn finish_typing(&self, transitions: &mut Transitions) {
        transitions.keyboard_active = false;
        self.notify(TouchpadNotification::KeyboardActivityFinished);

        // Compared against what was applied; the policy may have changed since
        if let Some(restore) = transitions.restore_after_typing.take() {
            if self.touchpad_state() != restore.applied {
                return;
            }
            if let Err(e) = self.apply_locked(ApplyRequest::State(restore.previous)).await {
                tracing::warn!(error = %e, "Failed to restore touchpad after typing");
            }
        }
    }

    // =========================================================================
    // Subscribers and lifecycle
    // =========================================================================

    /// Register for notifications
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TouchpadNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(e) => tracing::error!(error = %e, "Failed to lock subscriber list"),
        }
        rx
    }

    fn notify(&self, notification: TouchpadNotification) {
        tracing::debug!(?notification, "Notifying subscribers");
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.retain(|tx| tx.send(notification).is_ok()),
            Err(e) => tracing::error!(error = %e, "Failed to lock subscriber list"),
        }
    }

    /// Stop issuing driver calls
    ///
    /// Waits for an in-flight transition, stops keyboard watching and closes
    /// all subscriptions.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut transitions = self.transitions.lock().await;
        transitions.watching = false;
        transitions.restore_after_typing = None;
        self.presence.set_keyboard_watch(false);

        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.clear(),
            Err(e) => tracing::error!(error = %e, "Failed to lock subscriber list"),
        }
        tracing::info!(state = %self.touchpad_state(), "Touchpad state machine shut down");
    }

    fn ensure_running(&self) -> Result<(), TouchpadError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(TouchpadError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn run<T, F>(&self, on_failure: fn(String) -> TouchpadError, op: F) -> Result<T, TouchpadError>
    where
        T: Send + 'static,
        F: FnOnce(&mut BoxedDriver) -> Result<T, TouchpadError> + Send + 'static,
    {
        let (result, error_text) = call_driver(&self.driver, on_failure, op).await;
        if let Some(text) = error_text {
            match self.last_error.write() {
                Ok(mut last) => *last = text,
                Err(e) => tracing::error!(error = %e, "Failed to record driver error"),
            }
        }
        result
    }
}

/// Run `op` against the driver on the blocking pool
///
/// Returns the outcome and the driver's error text afterwards (None when the
/// driver could not be reached at all).
async fn call_driver<T, F>(
    driver: &SharedDriver,
    on_failure: fn(String) -> TouchpadError,
    op: F,
) -> (Result<T, TouchpadError>, Option<String>)
where
    T: Send + 'static,
    F: FnOnce(&mut BoxedDriver) -> Result<T, TouchpadError> + Send + 'static,
{
    let driver = Arc::clone(driver);
    let outcome = tokio::task::spawn_blocking(move || {
        let mut guard = driver
            .lock()
            .map_err(|e| DriverError::new(format!("Driver lock poisoned: {}", e)))?;
        let result = op(&mut *guard);
        let error_text = guard.error_string().to_string();
        Ok::<_, DriverError>((result, error_text))
    })
    .await;

    match outcome {
        Ok(Ok((result, error_text))) => (result, Some(error_text)),
        Ok(Err(e)) => (Err(on_failure(e.message)), None),
        Err(e) => (Err(on_failure(format!("Driver task failed: {}", e))), None),
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// State machine error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchpadError {
    /// Driver refused the configuration; prior state still holds
    DriverApplyFailed(String),
    /// Driver configuration could not be read
    DriverQueryFailed(String),
    /// Parameter not listed in the driver's supported parameters
    UnsupportedParameter(String),
    /// State parameter whose value describes no touchpad state
    InvalidParameterValue(String),
    /// The state machine has been shut down
    ShutDown,
}

impl TouchpadError {
    /// Error text as reported by the driver, or a description for the
    /// non-driver variants
    pub fn message(&self) -> String {
        match self {
            TouchpadError::DriverApplyFailed(msg) | TouchpadError::DriverQueryFailed(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for TouchpadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TouchpadError::DriverApplyFailed(msg) => write!(f, "Failed to apply touchpad configuration: {}", msg),
            TouchpadError::DriverQueryFailed(msg) => write!(f, "Failed to query touchpad configuration: {}", msg),
            TouchpadError::UnsupportedParameter(name) => write!(f, "Unsupported touchpad parameter '{}'", name),
            TouchpadError::InvalidParameterValue(name) => write!(f, "Invalid value for touchpad parameter '{}'", name),
            TouchpadError::ShutDown => write!(f, "Touchpad service is shutting down"),
        }
    }
}

impl std::error::Error for TouchpadError {}
