//! Running daemon components and how a config is applied to them
//!
//! Both `ReloadConfig` over D-Bus and the file watcher go through
//! [`Runtime::reload`], so a reload has the same effect either way.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{Config, ConfigError, SharedConfig};
use crate::presence::{MonitorSettings, PresenceMonitor};
use crate::state::{TouchpadStateMachine, TypingPolicy};

/// Typing policy described by a config
pub fn typing_policy(config: &Config) -> TypingPolicy {
    TypingPolicy {
        enabled: config.typing.disable_while_typing,
        typing_state: config.typing.typing_state,
    }
}

pub struct Runtime {
    machine: Arc<TouchpadStateMachine>,
    presence: Arc<dyn PresenceMonitor>,
    config: SharedConfig,
    /// `mouse.disable_when_plugged_in`, followed by the mouse policy
    mouse_policy: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(
        machine: Arc<TouchpadStateMachine>,
        presence: Arc<dyn PresenceMonitor>,
        config: SharedConfig,
    ) -> Self {
        let disable_with_mouse = config
            .read()
            .map(|c| c.mouse.disable_when_plugged_in)
            .unwrap_or(false);
        let (mouse_policy, _) = watch::channel(disable_with_mouse);

        Self {
            machine,
            presence,
            config,
            mouse_policy,
        }
    }

    pub fn machine(&self) -> &Arc<TouchpadStateMachine> {
        &self.machine
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Receiver for the mouse policy's on/off switch
    pub fn mouse_policy_enabled(&self) -> watch::Receiver<bool> {
        self.mouse_policy.subscribe()
    }

    /// Snapshot of the current configuration
    pub fn current_config(&self) -> Config {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read shared config, using defaults");
                Config::default()
            }
        }
    }

    /// Push `config` into every running component
    ///
    /// Startup parameters and the backend selection only take effect at
    /// startup and are not reapplied here.
    pub async fn apply_config(&self, config: &Config) {
        self.presence.update_settings(MonitorSettings::from_config(config));
        self.machine.set_typing_policy(typing_policy(config)).await;
        self.machine.watch_for_events(config.typing.watch_keyboard).await;
        self.mouse_policy.send_replace(config.mouse.disable_when_plugged_in);
    }

    /// Re-read the config file and apply it
    ///
    /// On a read or parse error the running configuration stays in place.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let new_config = self.current_config().reload()?;
        self.apply_config(&new_config).await;

        match self.config.write() {
            Ok(mut config) => {
                *config = new_config;
                tracing::info!(
                    watch_keyboard = config.typing.watch_keyboard,
                    disable_while_typing = config.typing.disable_while_typing,
                    disable_when_mouse = config.mouse.disable_when_plugged_in,
                    "Configuration reloaded successfully"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire config write lock");
                Err(ConfigError::ValidationError(format!("Lock error: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryDriver, TouchpadState};
    use crate::presence::PresenceEvent;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, RwLock};
    use std::time::Duration;

    #[derive(Default)]
    struct FakePresence {
        keyboard_watch: AtomicBool,
        idle_timeout: Mutex<Option<Duration>>,
    }

    impl PresenceMonitor for FakePresence {
        fn is_mouse_plugged_in(&self) -> bool {
            false
        }

        fn set_keyboard_watch(&self, enabled: bool) {
            self.keyboard_watch.store(enabled, Ordering::SeqCst);
        }

        fn update_settings(&self, settings: MonitorSettings) {
            *self.idle_timeout.lock().unwrap() = Some(settings.idle_timeout);
        }
    }

    async fn setup(dir: &tempfile::TempDir, json: &str) -> (Runtime, Arc<FakePresence>) {
        let path = dir.path().join("config.json");
        fs::write(&path, json).unwrap();
        let config = Config::load(&path).unwrap();

        let presence = Arc::new(FakePresence::default());
        let machine = Arc::new(
            TouchpadStateMachine::new(
                Box::new(MemoryDriver::new()),
                presence.clone(),
                typing_policy(&config),
            )
            .await,
        );
        let runtime = Runtime::new(machine, presence.clone(), Arc::new(RwLock::new(config)));
        (runtime, presence)
    }

    #[test]
    fn test_typing_policy_from_config() {
        let mut config = Config::default();
        assert!(!typing_policy(&config).enabled);

        config.typing.disable_while_typing = true;
        config.typing.typing_state = TouchpadState::FullyDisabled;
        let policy = typing_policy(&config);
        assert!(policy.enabled);
        assert_eq!(policy.typing_state, TouchpadState::FullyDisabled);
    }

    #[tokio::test]
    async fn test_apply_config_starts_watching() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, presence) = setup(&dir, r#"{"typing": {"idle_timeout_ms": 800}}"#).await;

        runtime.apply_config(&runtime.current_config()).await;
        assert!(presence.keyboard_watch.load(Ordering::SeqCst));
        assert_eq!(*presence.idle_timeout.lock().unwrap(), Some(Duration::from_millis(800)));
        assert!(!*runtime.mouse_policy_enabled().borrow());
    }

    #[tokio::test]
    async fn test_reload_applies_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, presence) = setup(&dir, "{}").await;
        runtime.apply_config(&runtime.current_config()).await;

        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"typing": {"watch_keyboard": false}, "mouse": {"disable_when_plugged_in": true}}"#,
        )
        .unwrap();
        let policy = runtime.mouse_policy_enabled();

        runtime.reload().await.unwrap();
        assert!(!presence.keyboard_watch.load(Ordering::SeqCst));
        assert!(*policy.borrow());
        assert!(runtime.current_config().mouse.disable_when_plugged_in);
    }

    #[tokio::test]
    async fn test_reload_enables_typing_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _presence) = setup(&dir, "{}").await;
        runtime.apply_config(&runtime.current_config()).await;

        fs::write(
            dir.path().join("config.json"),
            r#"{"typing": {"disable_while_typing": true}}"#,
        )
        .unwrap();
        runtime.reload().await.unwrap();

        let machine = runtime.machine();
        machine.handle_presence_event(PresenceEvent::KeyboardActivityStarted).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::TapAndScrollDisabled);
        machine.handle_presence_event(PresenceEvent::KeyboardActivityFinished).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::Enabled);
    }

    #[tokio::test]
    async fn test_reload_keeps_config_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _presence) = setup(&dir, r#"{"mouse": {"poll_interval_secs": 5}}"#).await;

        fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        assert!(matches!(runtime.reload().await, Err(ConfigError::ParseError(_))));
        assert_eq!(runtime.current_config().mouse.poll_interval_secs, 5);
    }
}
