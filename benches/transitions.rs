//! State transition latency against the in-memory backend

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use touchpadd::{MemoryDriver, PresenceMonitor, TouchpadState, TouchpadStateMachine, TypingPolicy};

struct NoPresence;

impl PresenceMonitor for NoPresence {
    fn is_mouse_plugged_in(&self) -> bool {
        false
    }

    fn set_keyboard_watch(&self, _enabled: bool) {}
}

fn bench_transitions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let machine = rt.block_on(TouchpadStateMachine::new(
        Box::new(MemoryDriver::new()),
        Arc::new(NoPresence),
        TypingPolicy::default(),
    ));
    // Keep a subscriber so notification delivery is part of the cost
    let mut notifications = machine.subscribe();

    c.bench_function("set_touchpad_state", |b| {
        let mut disabled = false;
        b.iter(|| {
            disabled = !disabled;
            let state = if disabled {
                TouchpadState::FullyDisabled
            } else {
                TouchpadState::Enabled
            };
            rt.block_on(machine.set_touchpad_state(state)).unwrap();
            while notifications.try_recv().is_ok() {}
        })
    });

    c.bench_function("toggle", |b| {
        b.iter(|| {
            rt.block_on(machine.toggle()).unwrap();
            while notifications.try_recv().is_ok() {}
        })
    });

    c.bench_function("touchpad_state", |b| b.iter(|| machine.touchpad_state()));
}

criterion_group!(benches, bench_transitions);
criterion_main!(benches);
