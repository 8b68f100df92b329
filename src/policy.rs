//! Disable the touchpad while an external mouse is plugged in
//!
//! This is a consumer of the state machine, not part of it: the machine only
//! reports `MousesChanged`, and this policy turns those reports into state
//! requests when `mouse.disable_when_plugged_in` is set.
//!
//! The policy only undoes its own work. If the user changes the state while
//! the mouse is plugged in, unplugging leaves that choice alone.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::backend::TouchpadState;
use crate::state::{TouchpadNotification, TouchpadStateMachine};

pub struct MousePolicy {
    machine: Arc<TouchpadStateMachine>,
    enabled: watch::Receiver<bool>,
    /// The policy disabled the touchpad and has not restored it yet
    disabled_by_policy: bool,
}

impl MousePolicy {
    pub fn new(machine: Arc<TouchpadStateMachine>, enabled: watch::Receiver<bool>) -> Self {
        Self {
            machine,
            enabled,
            disabled_by_policy: false,
        }
    }

    /// Bring the touchpad in line with the current presence
    pub async fn evaluate(&mut self, mouse_present: bool) {
        let enabled = *self.enabled.borrow();

        if enabled && mouse_present {
            if self.disabled_by_policy || self.machine.touchpad_state() != TouchpadState::Enabled {
                return;
            }
            match self.machine.set_touchpad_state(TouchpadState::FullyDisabled).await {
                Ok(()) => {
                    tracing::info!("External mouse plugged in, touchpad disabled");
                    self.disabled_by_policy = true;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to disable touchpad for external mouse"),
            }
        } else if self.disabled_by_policy {
            self.disabled_by_policy = false;
            if self.machine.touchpad_state() != TouchpadState::FullyDisabled {
                return;
            }
            match self.machine.set_touchpad_state(TouchpadState::Enabled).await {
                Ok(()) => tracing::info!(mouse_present, "Touchpad re-enabled by mouse policy"),
                Err(e) => tracing::warn!(error = %e, "Failed to re-enable touchpad"),
            }
        }
    }

    fn observe_state(&mut self, state: TouchpadState) {
        if self.disabled_by_policy && state != TouchpadState::FullyDisabled {
            tracing::debug!(state = %state, "Touchpad changed elsewhere, mouse policy lets go");
            self.disabled_by_policy = false;
        }
    }

    /// Follow notifications until the machine shuts down
    ///
    /// `notifications` should be subscribed before calling so no presence
    /// change between subscription and the initial evaluation is lost.
    pub async fn run(mut self, mut notifications: mpsc::UnboundedReceiver<TouchpadNotification>) {
        let present = self.machine.is_mouse_plugged_in();
        self.evaluate(present).await;

        loop {
            tokio::select! {
                notification = notifications.recv() => match notification {
                    Some(TouchpadNotification::MousesChanged(present)) => self.evaluate(present).await,
                    Some(TouchpadNotification::TouchpadStateChanged(state)) => self.observe_state(state),
                    Some(_) => {}
                    None => break,
                },
                changed = self.enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!(enabled = *self.enabled.borrow(), "Mouse policy setting changed");
                    let present = self.machine.is_mouse_plugged_in();
                    self.evaluate(present).await;
                }
            }
        }

        tracing::debug!("Mouse policy stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDriver;
    use crate::presence::{PresenceEvent, PresenceMonitor};
    use crate::state::TypingPolicy;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakePresence {
        mouse: AtomicBool,
    }

    impl PresenceMonitor for FakePresence {
        fn is_mouse_plugged_in(&self) -> bool {
            self.mouse.load(Ordering::SeqCst)
        }

        fn set_keyboard_watch(&self, _enabled: bool) {}
    }

    async fn wait_for(machine: &TouchpadStateMachine, state: TouchpadState) {
        for _ in 0..200 {
            if machine.touchpad_state() == state {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn setup(enabled: bool) -> (Arc<TouchpadStateMachine>, MousePolicy, watch::Sender<bool>) {
        let presence = Arc::new(FakePresence::default());
        let machine = Arc::new(
            TouchpadStateMachine::new(Box::new(MemoryDriver::new()), presence, TypingPolicy::default()).await,
        );
        machine.watch_for_events(false).await;
        let (tx, rx) = watch::channel(enabled);
        let policy = MousePolicy::new(Arc::clone(&machine), rx);
        (machine, policy, tx)
    }

    #[tokio::test]
    async fn test_disabled_policy_does_nothing() {
        let (machine, mut policy, _tx) = setup(false).await;
        policy.evaluate(true).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::Enabled);
    }

    #[tokio::test]
    async fn test_plug_and_unplug() {
        let (machine, mut policy, _tx) = setup(true).await;

        policy.evaluate(true).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::FullyDisabled);

        policy.evaluate(false).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::Enabled);
    }

    #[tokio::test]
    async fn test_user_choice_survives_unplug() {
        let (machine, mut policy, _tx) = setup(true).await;

        policy.evaluate(true).await;
        machine.set_touchpad_state(TouchpadState::TapAndScrollDisabled).await.unwrap();
        policy.observe_state(TouchpadState::TapAndScrollDisabled);

        policy.evaluate(false).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::TapAndScrollDisabled);
    }

    #[tokio::test]
    async fn test_already_disabled_touchpad_not_restored() {
        let (machine, mut policy, _tx) = setup(true).await;
        machine.set_touchpad_state(TouchpadState::FullyDisabled).await.unwrap();

        policy.evaluate(true).await;
        policy.evaluate(false).await;
        // The policy never disabled it, so it does not enable it either
        assert_eq!(machine.touchpad_state(), TouchpadState::FullyDisabled);
    }

    #[tokio::test]
    async fn test_run_follows_notifications() {
        let (machine, policy, tx) = setup(true).await;
        let notifications = machine.subscribe();
        let handle = tokio::spawn(policy.run(notifications));

        machine
            .handle_presence_event(PresenceEvent::MousePresenceChanged(true))
            .await;
        wait_for(&machine, TouchpadState::FullyDisabled).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::FullyDisabled);

        // Turning the policy off hands the touchpad back
        tx.send(false).unwrap();
        wait_for(&machine, TouchpadState::Enabled).await;
        assert_eq!(machine.touchpad_state(), TouchpadState::Enabled);

        machine.shutdown().await;
        handle.await.unwrap();
    }
}
