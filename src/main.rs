//! touchpadd
//!
//! A daemon for Linux that owns the touchpad's enabled state, reacts to
//! external mice and keyboard activity, and exposes control over D-Bus.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, error, Level};
use tracing_subscriber::FmtSubscriber;

use touchpadd::{
    backend::detect_driver,
    config::{load_shared_config, BackendKind, Config},
    config_watcher::start_config_watcher,
    dbus::{init_dbus_service, spawn_signal_forwarder},
    devices,
    policy::MousePolicy,
    presence::{EvdevPresenceMonitor, MonitorSettings, PresenceEvent, PresenceMonitor},
    runtime::{typing_policy, Runtime},
    state::TouchpadStateMachine,
};

/// Capacity of the presence event channel
const PRESENCE_CHANNEL_CAPACITY: usize = 32;

/// touchpadd - Touchpad state daemon
#[derive(Parser, Debug)]
#[command(name = "touchpadd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/touchpadd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List input devices and how they are classified, then exit
    #[arg(long)]
    list_devices: bool,

    /// Override the configured backend (auto, sysfs, memory)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Run without registering on the session bus
    #[arg(long)]
    no_dbus: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_devices {
        list_input_devices();
        return Ok(());
    }

    info!("touchpadd starting...");

    let shared_config = match load_shared_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // Keep the path so a fixed file is picked up by hot-reload
            warn!("Failed to load config, using defaults: {}", e);
            let mut config = Config::default();
            config.config_path = args.config.clone().or_else(Config::default_config_path);
            Arc::new(RwLock::new(config))
        }
    };

    if let Some(kind) = args.backend {
        match shared_config.write() {
            Ok(mut config) => config.backend.kind = kind,
            Err(e) => warn!("Failed to apply --backend override: {}", e),
        }
    }

    let config = shared_config
        .read()
        .map(|c| c.clone())
        .unwrap_or_else(|_| Config::default());

    let driver = match detect_driver(&config.backend) {
        Ok(driver) => driver,
        Err(e) => {
            error!("Failed to open touchpad backend: {}", e);
            return Err(e.into());
        }
    };

    let monitor = Arc::new(EvdevPresenceMonitor::new(MonitorSettings::from_config(&config)));
    let presence: Arc<dyn PresenceMonitor> = monitor.clone();

    let machine = Arc::new(
        TouchpadStateMachine::new(driver, Arc::clone(&presence), typing_policy(&config)).await,
    );
    if let Some(e) = machine.startup_error() {
        warn!("Could not read initial touchpad state, assuming enabled: {}", e);
    }
    info!(
        backend = machine.driver_name(),
        state = %machine.touchpad_state(),
        "Touchpad state machine ready"
    );

    if !config.parameters.is_empty() {
        match machine.apply_parameters(config.parameters.clone()).await {
            Ok(()) => info!(count = config.parameters.len(), "Startup parameters applied"),
            Err(e) => warn!("Failed to apply startup parameters: {}", e),
        }
    }

    let runtime = Arc::new(Runtime::new(
        Arc::clone(&machine),
        presence,
        shared_config.clone(),
    ));

    // Presence monitor -> state machine
    let (event_tx, event_rx) = mpsc::channel::<PresenceEvent>(PRESENCE_CHANNEL_CAPACITY);
    let monitor_handles = monitor.start(event_tx);
    let event_handle = tokio::spawn(process_presence_events(event_rx, Arc::clone(&machine)));

    // Subscribe before the first watch so no presence change is missed
    let policy = MousePolicy::new(Arc::clone(&machine), runtime.mouse_policy_enabled());
    let policy_handle = tokio::spawn(policy.run(machine.subscribe()));

    runtime.apply_config(&config).await;

    let dbus = if args.no_dbus {
        info!("D-Bus disabled by --no-dbus");
        None
    } else {
        match init_dbus_service(Arc::clone(&runtime)).await {
            Ok(connection) => {
                info!("D-Bus service initialized successfully");
                let forwarder = spawn_signal_forwarder(connection.clone(), machine.subscribe());
                Some((connection, forwarder))
            }
            Err(e) => {
                error!("Failed to initialize D-Bus service: {}", e);
                return Err(e.into());
            }
        }
    };

    let _config_watcher = match config.config_path.clone().or_else(Config::default_config_path) {
        Some(path) => match start_config_watcher(path, Arc::clone(&runtime)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config hot-reload unavailable: {}", e);
                None
            }
        },
        None => None,
    };

    info!("touchpadd ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
        result = event_handle => {
            if let Err(e) = result {
                error!("Presence event task panicked: {:?}", e);
            }
        }
        result = policy_handle => {
            if let Err(e) = result {
                error!("Mouse policy task panicked: {:?}", e);
            }
        }
    }

    machine.shutdown().await;
    for handle in monitor_handles {
        handle.abort();
    }
    if let Some((_connection, forwarder)) = dbus {
        let _ = forwarder.await;
    }

    info!("touchpadd stopped");
    Ok(())
}

/// List input devices with their classification
fn list_input_devices() {
    println!("Scanning input devices...\n");

    let devices = devices::list_devices();

    if devices.is_empty() {
        println!("No input devices found.");
        println!("\nTroubleshooting:");
        println!("  - Check that udev rules are installed");
        println!("  - Verify user is in 'input' group");
        return;
    }

    println!("Found {} device(s):\n", devices.len());

    for (i, device) in devices.iter().enumerate() {
        println!("{}. {} [{}]", i + 1, device.name, device.kind);
        println!("   Path:    {:?}", device.path);
        println!("   Vendor:  0x{:04X}", device.vendor_id);
        println!("   Product: 0x{:04X}", device.product_id);
        println!();
    }
}

/// Feed presence events into the state machine until the monitor stops
async fn process_presence_events(
    mut event_rx: mpsc::Receiver<PresenceEvent>,
    machine: Arc<TouchpadStateMachine>,
) {
    while let Some(event) = event_rx.recv().await {
        machine.handle_presence_event(event).await;
    }
    tracing::debug!("Presence event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["touchpadd"]);
        assert!(args.config.is_none());
        assert!(!args.verbose);
        assert!(!args.list_devices);
        assert!(args.backend.is_none());
        assert!(!args.no_dbus);
    }

    #[test]
    fn test_args_verbose() {
        let args = Args::parse_from(["touchpadd", "--verbose"]);
        assert!(args.verbose);
    }

    #[test]
    fn test_args_list_devices() {
        let args = Args::parse_from(["touchpadd", "--list-devices"]);
        assert!(args.list_devices);
    }

    #[test]
    fn test_args_backend_and_config() {
        let args = Args::parse_from([
            "touchpadd",
            "--backend",
            "memory",
            "-c",
            "/tmp/touchpadd.json",
            "--no-dbus",
        ]);
        assert_eq!(args.backend, Some(BackendKind::Memory));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/touchpadd.json")));
        assert!(args.no_dbus);
    }

    #[test]
    fn test_args_rejects_unknown_backend() {
        assert!(Args::try_parse_from(["touchpadd", "--backend", "xinput"]).is_err());
    }

    #[tokio::test]
    async fn test_presence_events_reach_machine() {
        use touchpadd::backend::MemoryDriver;
        use touchpadd::state::TypingPolicy;

        struct NoPresence;
        impl PresenceMonitor for NoPresence {
            fn is_mouse_plugged_in(&self) -> bool {
                false
            }
            fn set_keyboard_watch(&self, _enabled: bool) {}
        }

        let machine = Arc::new(
            TouchpadStateMachine::new(
                Box::new(MemoryDriver::new()),
                Arc::new(NoPresence),
                TypingPolicy::default(),
            )
            .await,
        );
        machine.watch_for_events(false).await;
        let mut notifications = machine.subscribe();

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(process_presence_events(rx, Arc::clone(&machine)));
        tx.send(PresenceEvent::MousePresenceChanged(true)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            notifications.recv().await,
            Some(touchpadd::state::TouchpadNotification::MousesChanged(true))
        );
    }
}
