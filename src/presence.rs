//! External mouse presence and keyboard activity
//!
//! ## Contract
//! A `PresenceMonitor` answers "is an external mouse plugged in?" on demand
//! and feeds `PresenceEvent`s into an mpsc channel owned by the daemon.
//! Consumers must tolerate duplicates, including a `KeyboardActivityFinished`
//! without a preceding start.
//!
//! ## evdev implementation
//! - Mice are found by rescanning `/dev/input` every
//!   `mouse.poll_interval_secs`; a change of "any mouse present" is reported.
//! - Keyboards are opened as evdev event streams merged in a `StreamMap`.
//!   Key presses feed the activity tracker, which turns them into
//!   started/finished edges using an idle timeout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::devices::{self, DeviceError, DeviceInfo, DeviceKind};

/// How often keyboards are rescanned for hotplug while watching
const KEYBOARD_RESCAN_SECS: u64 = 10;

/// Capacity of the key press channel between keyboard streams and tracker
const KEY_CHANNEL_CAPACITY: usize = 64;

/// Highest evdev code that is a keyboard key; BTN_* codes start at 0x100
const MAX_KEYBOARD_CODE: u16 = 0xFF;

/// Modifier key codes ignored when `typing.ignore_modifiers` is set
pub const MODIFIER_KEY_CODES: &[u16] = &[
    29,  // KEY_LEFTCTRL
    42,  // KEY_LEFTSHIFT
    54,  // KEY_RIGHTSHIFT
    56,  // KEY_LEFTALT
    97,  // KEY_RIGHTCTRL
    100, // KEY_RIGHTALT
    125, // KEY_LEFTMETA
    126, // KEY_RIGHTMETA
];

/// Event raised by a presence monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Whether any external mouse is plugged in now
    MousePresenceChanged(bool),
    /// First key after an idle period
    KeyboardActivityStarted,
    /// Keyboard idle for the configured timeout
    KeyboardActivityFinished,
}

/// Source of mouse presence and keyboard activity
pub trait PresenceMonitor: Send + Sync {
    /// Whether an external pointing device is attached right now
    fn is_mouse_plugged_in(&self) -> bool;

    /// Start or stop producing keyboard activity events
    fn set_keyboard_watch(&self, enabled: bool);

    /// Take new settings after a config reload
    fn update_settings(&self, _settings: MonitorSettings) {}
}

/// Settings the monitor reads on every poll, updated on config reload
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub ignored_devices: Vec<String>,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub ignore_modifiers: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ignored_devices: config.mouse.ignored_devices.clone(),
            poll_interval: Duration::from_secs(config.mouse.poll_interval_secs),
            idle_timeout: Duration::from_millis(config.typing.idle_timeout_ms),
            ignore_modifiers: config.typing.ignore_modifiers,
        }
    }
}

// ============================================================================
// evdev monitor
// ============================================================================

/// Presence monitor backed by evdev
pub struct EvdevPresenceMonitor {
    mouse_present: Arc<AtomicBool>,
    keyboard_watch: watch::Sender<bool>,
    settings: Arc<RwLock<MonitorSettings>>,
    /// Idle timeout in ms, read by the activity tracker on every wait
    idle_timeout_ms: Arc<AtomicU64>,
}

impl EvdevPresenceMonitor {
    /// Create the monitor and take an initial mouse census
    pub fn new(settings: MonitorSettings) -> Self {
        let present = match find_mice(&settings.ignored_devices) {
            Ok(mice) => {
                for mouse in &mice {
                    tracing::info!(name = %mouse.name, path = %mouse.path.display(), "External mouse present");
                }
                !mice.is_empty()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial mouse scan failed, assuming no mouse");
                false
            }
        };

        let (keyboard_watch, _) = watch::channel(false);
        let idle_ms = duration_millis(settings.idle_timeout);

        Self {
            mouse_present: Arc::new(AtomicBool::new(present)),
            keyboard_watch,
            settings: Arc::new(RwLock::new(settings)),
            idle_timeout_ms: Arc::new(AtomicU64::new(idle_ms)),
        }
    }

    /// Spawn the mouse poll loop and the keyboard loop
    pub fn start(&self, event_tx: mpsc::Sender<PresenceEvent>) -> Vec<JoinHandle<()>> {
        let mouse = tokio::spawn(run_mouse_poll_loop(
            Arc::clone(&self.mouse_present),
            Arc::clone(&self.settings),
            event_tx.clone(),
        ));
        let keyboard = tokio::spawn(run_keyboard_loop(
            self.keyboard_watch.subscribe(),
            Arc::clone(&self.settings),
            Arc::clone(&self.idle_timeout_ms),
            event_tx,
        ));
        vec![mouse, keyboard]
    }
}

impl PresenceMonitor for EvdevPresenceMonitor {
    fn is_mouse_plugged_in(&self) -> bool {
        self.mouse_present.load(Ordering::SeqCst)
    }

    fn set_keyboard_watch(&self, enabled: bool) {
        let previous = self.keyboard_watch.send_replace(enabled);
        if previous != enabled {
            tracing::info!(enabled, "Keyboard activity watching changed");
        }
    }

    /// The next poll and the next idle wait use the new settings
    fn update_settings(&self, settings: MonitorSettings) {
        self.idle_timeout_ms
            .store(duration_millis(settings.idle_timeout), Ordering::SeqCst);
        match self.settings.write() {
            Ok(mut current) => *current = settings,
            Err(e) => tracing::error!(error = %e, "Failed to acquire monitor settings lock"),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// External mice, skipping ignored names
pub fn find_mice(ignored: &[String]) -> Result<Vec<DeviceInfo>, DeviceError> {
    Ok(devices::scan_devices()?
        .into_iter()
        .filter(|d| d.kind == DeviceKind::Mouse && !devices::is_ignored(&d.name, ignored))
        .collect())
}

fn read_settings(settings: &RwLock<MonitorSettings>) -> Option<MonitorSettings> {
    match settings.read() {
        Ok(s) => Some(s.clone()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read monitor settings");
            None
        }
    }
}

/// Rescan for mice and report changes of presence
async fn run_mouse_poll_loop(
    present: Arc<AtomicBool>,
    settings: Arc<RwLock<MonitorSettings>>,
    event_tx: mpsc::Sender<PresenceEvent>,
) {
    loop {
        let Some(current) = read_settings(&settings) else {
            return;
        };

        let ignored = current.ignored_devices.clone();
        match tokio::task::spawn_blocking(move || find_mice(&ignored)).await {
            Ok(Ok(mice)) => {
                let now = !mice.is_empty();
                let before = present.swap(now, Ordering::SeqCst);
                if before != now {
                    tracing::info!(plugged_in = now, count = mice.len(), "Mouse presence changed");
                    if event_tx.send(PresenceEvent::MousePresenceChanged(now)).await.is_err() {
                        tracing::debug!("Presence receiver closed, stopping mouse poll loop");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Mouse scan failed");
            }
            Err(e) => {
                tracing::error!("Mouse scan task panicked: {:?}", e);
            }
        }

        tokio::time::sleep(current.poll_interval).await;
    }
}

/// Watch keyboards while enabled, restarting on every enable
async fn run_keyboard_loop(
    mut watch_rx: watch::Receiver<bool>,
    settings: Arc<RwLock<MonitorSettings>>,
    idle_timeout_ms: Arc<AtomicU64>,
    event_tx: mpsc::Sender<PresenceEvent>,
) {
    loop {
        while !*watch_rx.borrow_and_update() {
            if watch_rx.changed().await.is_err() {
                return;
            }
        }

        tracing::info!("Keyboard activity watching started");
        let (key_tx, key_rx) = mpsc::channel(KEY_CHANNEL_CAPACITY);
        let tracker = tokio::spawn(run_activity_tracker(
            key_rx,
            event_tx.clone(),
            Arc::clone(&idle_timeout_ms),
        ));

        tokio::select! {
            _ = pump_keyboard_events(Arc::clone(&settings), key_tx) => {}
            _ = wait_until_disabled(&mut watch_rx) => {}
        }

        // key_tx is gone now, the tracker closes any open activity and exits
        if let Err(e) = tracker.await {
            tracing::error!("Activity tracker panicked: {:?}", e);
        }
        tracing::info!("Keyboard activity watching stopped");

        if event_tx.is_closed() {
            return;
        }
    }
}

async fn wait_until_disabled(watch_rx: &mut watch::Receiver<bool>) {
    loop {
        if watch_rx.changed().await.is_err() {
            return;
        }
        if !*watch_rx.borrow_and_update() {
            return;
        }
    }
}

/// Whether a key event counts as typing
///
/// Press (1) and autorepeat (2) of keyboard keys count; releases, pointer
/// buttons and, optionally, modifiers do not.
pub fn is_typing_key(code: u16, value: i32, ignore_modifiers: bool) -> bool {
    if value == 0 || code > MAX_KEYBOARD_CODE {
        return false;
    }
    !(ignore_modifiers && MODIFIER_KEY_CODES.contains(&code))
}

#[cfg(target_os = "linux")]
async fn pump_keyboard_events(settings: Arc<RwLock<MonitorSettings>>, key_tx: mpsc::Sender<()>) {
    use evdev::EventType;
    use tokio_stream::{StreamExt, StreamMap};

    let mut streams: StreamMap<PathBuf, evdev::EventStream> = StreamMap::new();
    let mut rescan = tokio::time::interval(Duration::from_secs(KEYBOARD_RESCAN_SECS));

    loop {
        tokio::select! {
            _ = rescan.tick() => {
                add_new_keyboards(&mut streams);
            }
            Some((path, result)) = streams.next(), if !streams.is_empty() => {
                match result {
                    Ok(event) => {
                        if event.event_type() != EventType::KEY {
                            continue;
                        }
                        let ignore_modifiers = read_settings(&settings)
                            .map(|s| s.ignore_modifiers)
                            .unwrap_or(true);
                        if is_typing_key(event.code(), event.value(), ignore_modifiers)
                            && key_tx.send(()).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Keyboard stream ended");
                        streams.remove(&path);
                    }
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn add_new_keyboards(streams: &mut tokio_stream::StreamMap<PathBuf, evdev::EventStream>) {
    let keyboards = match devices::scan_devices() {
        Ok(found) => found.into_iter().filter(|d| d.kind == DeviceKind::Keyboard),
        Err(e) => {
            tracing::debug!(error = %e, "Keyboard scan failed");
            return;
        }
    };

    for keyboard in keyboards {
        if streams.contains_key(&keyboard.path) {
            continue;
        }
        let stream = devices::open_device(&keyboard.path)
            .and_then(|device| device.into_event_stream().map_err(DeviceError::IoError));
        match stream {
            Ok(stream) => {
                tracing::info!(name = %keyboard.name, path = %keyboard.path.display(), "Watching keyboard");
                streams.insert(keyboard.path, stream);
            }
            Err(e) => {
                tracing::warn!(name = %keyboard.name, error = %e, "Cannot watch keyboard");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn pump_keyboard_events(_settings: Arc<RwLock<MonitorSettings>>, _key_tx: mpsc::Sender<()>) {
    tracing::warn!("Keyboard watching is only available on Linux");
    std::future::pending::<()>().await
}

/// Turn a stream of key presses into activity edges
///
/// Emits `KeyboardActivityStarted` on the first press after idle and
/// `KeyboardActivityFinished` once no press arrived for the idle timeout.
/// When the press channel closes during activity, the finish edge is still
/// sent before returning.
pub async fn run_activity_tracker(
    mut key_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<PresenceEvent>,
    idle_timeout_ms: Arc<AtomicU64>,
) {
    loop {
        if key_rx.recv().await.is_none() {
            return;
        }
        if event_tx.send(PresenceEvent::KeyboardActivityStarted).await.is_err() {
            return;
        }

        loop {
            let idle = Duration::from_millis(idle_timeout_ms.load(Ordering::SeqCst));
            match tokio::time::timeout(idle, key_rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    let _ = event_tx.send(PresenceEvent::KeyboardActivityFinished).await;
                    return;
                }
                Err(_) => {
                    if event_tx.send(PresenceEvent::KeyboardActivityFinished).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
