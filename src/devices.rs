//! Input device discovery and classification
//!
//! Scans `/dev/input/event*` through evdev and sorts devices into touchpads,
//! mice and keyboards by the capabilities they advertise. Access without root
//! relies on the user being in the `input` group (or matching udev rules).

use std::path::{Path, PathBuf};

/// Directory holding the evdev nodes
pub const INPUT_DIR: &str = "/dev/input";

/// sysfs class directory for input devices
pub const SYSFS_INPUT_CLASS: &str = "/sys/class/input";

/// What a device looks like to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Touchpad,
    Mouse,
    Keyboard,
    Other,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceKind::Touchpad => "touchpad",
            DeviceKind::Mouse => "mouse",
            DeviceKind::Keyboard => "keyboard",
            DeviceKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Capability summary used for classification
///
/// Kept separate from `evdev::Device` so the rules can be tested without
/// real hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// REL_X and REL_Y
    pub relative_xy: bool,
    /// ABS_X and ABS_Y
    pub absolute_xy: bool,
    /// BTN_LEFT
    pub left_button: bool,
    /// BTN_TOOL_FINGER
    pub finger_tool: bool,
    /// Full row of letter keys plus space
    pub letter_keys: bool,
}

impl Capabilities {
    pub fn classify(&self) -> DeviceKind {
        if self.finger_tool && self.absolute_xy {
            DeviceKind::Touchpad
        } else if self.relative_xy && self.left_button {
            DeviceKind::Mouse
        } else if self.letter_keys {
            DeviceKind::Keyboard
        } else {
            DeviceKind::Other
        }
    }

    #[cfg(target_os = "linux")]
    fn from_device(device: &evdev::Device) -> Self {
        use evdev::{AbsoluteAxisCode, KeyCode, RelativeAxisCode};

        let keys = device.supported_keys();
        let has_key = |k: KeyCode| keys.map(|set| set.contains(k)).unwrap_or(false);

        let relative_xy = device
            .supported_relative_axes()
            .map(|axes| axes.contains(RelativeAxisCode::REL_X) && axes.contains(RelativeAxisCode::REL_Y))
            .unwrap_or(false);
        let absolute_xy = device
            .supported_absolute_axes()
            .map(|axes| axes.contains(AbsoluteAxisCode::ABS_X) && axes.contains(AbsoluteAxisCode::ABS_Y))
            .unwrap_or(false);

        let letter_keys = [KeyCode::KEY_A, KeyCode::KEY_Q, KeyCode::KEY_Z, KeyCode::KEY_SPACE]
            .into_iter()
            .all(|k| has_key(k));

        Self {
            relative_xy,
            absolute_xy,
            left_button: has_key(KeyCode::BTN_LEFT),
            finger_tool: has_key(KeyCode::BTN_TOOL_FINGER),
            letter_keys,
        }
    }
}

/// Information about a detected input device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the event device (e.g., /dev/input/event5)
    pub path: PathBuf,
    /// Device name as reported by the kernel
    pub name: String,
    /// Vendor ID
    pub vendor_id: u16,
    /// Product ID
    pub product_id: u16,
    /// Classification
    pub kind: DeviceKind,
}

impl DeviceInfo {
    /// `eventN` part of the node path
    pub fn node_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// sysfs `inhibited` attribute for this device
    pub fn inhibited_attribute(&self) -> Option<PathBuf> {
        self.node_name()
            .map(|node| Path::new(SYSFS_INPUT_CLASS).join(node).join("device/inhibited"))
    }

    /// Whether `hint` names this device, either by node path or by name
    pub fn matches(&self, hint: &str) -> bool {
        self.path == Path::new(hint) || self.name.eq_ignore_ascii_case(hint)
    }
}

/// Case-insensitive substring match of a device name against an ignore list
pub fn is_ignored(name: &str, patterns: &[String]) -> bool {
    let name = name.to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| name.contains(&p.to_lowercase()))
}

/// Scan all input devices
///
/// Unreadable nodes are skipped; the error is only returned when the input
/// directory itself cannot be read.
pub fn scan_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("evdev is only available on Linux");
        Err(DeviceError::DeviceNotFound)
    }

    #[cfg(target_os = "linux")]
    {
        scan_linux_devices()
    }
}

#[cfg(target_os = "linux")]
fn scan_linux_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    use std::fs;

    let input_dir = PathBuf::from(INPUT_DIR);
    if !input_dir.exists() {
        tracing::error!("Input directory does not exist: {:?}", input_dir);
        return Err(DeviceError::DeviceNotFound);
    }

    let entries = fs::read_dir(&input_dir).map_err(DeviceError::IoError)?;
    let mut devices = Vec::new();
    let mut denied = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if !filename.starts_with("event") {
            continue;
        }

        match check_device(&path) {
            Ok(info) => devices.push(info),
            Err(DeviceError::PermissionDenied) => denied += 1,
            Err(e) => {
                tracing::debug!("Could not check device {:?}: {}", path, e);
            }
        }
    }

    if devices.is_empty() && denied > 0 {
        return Err(DeviceError::PermissionDenied);
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

#[cfg(target_os = "linux")]
fn check_device(path: &Path) -> Result<DeviceInfo, DeviceError> {
    let device = open_device(path)?;
    let input_id = device.input_id();

    Ok(DeviceInfo {
        path: path.to_path_buf(),
        name: device.name().unwrap_or("Unknown").to_string(),
        vendor_id: input_id.vendor(),
        product_id: input_id.product(),
        kind: Capabilities::from_device(&device).classify(),
    })
}

/// Open an evdev node, mapping permission errors
#[cfg(target_os = "linux")]
pub fn open_device(path: &Path) -> Result<evdev::Device, DeviceError> {
    evdev::Device::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            DeviceError::PermissionDenied
        } else {
            DeviceError::IoError(e)
        }
    })
}

/// All devices, or an empty list when scanning fails
pub fn list_devices() -> Vec<DeviceInfo> {
    scan_devices().unwrap_or_default()
}

/// Find the touchpad to drive
///
/// With a hint (node path or device name) only that device is accepted;
/// otherwise the first touchpad in node order wins.
pub fn find_touchpad(hint: Option<&str>) -> Result<DeviceInfo, DeviceError> {
    let devices = scan_devices()?;
    select_touchpad(devices, hint).ok_or(DeviceError::DeviceNotFound)
}

fn select_touchpad(devices: Vec<DeviceInfo>, hint: Option<&str>) -> Option<DeviceInfo> {
    devices
        .into_iter()
        .filter(|d| d.kind == DeviceKind::Touchpad)
        .find(|d| hint.map_or(true, |h| d.matches(h)))
}

/// Device discovery error type
#[derive(Debug)]
pub enum DeviceError {
    /// No matching device present
    DeviceNotFound,
    /// Permission denied accessing device
    PermissionDenied,
    /// I/O error
    IoError(std::io::Error),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::DeviceNotFound => write!(f, "No matching input device found"),
            DeviceError::PermissionDenied => write!(
                f,
                "Permission denied. Ensure udev rules are installed and user is in 'input' group."
            ),
            DeviceError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::IoError(e) => Some(e),
            _ => None,
        }
    }
}
