//! Device discovery and mode classification.
//!
//! The SoC exposes different USB identities depending on its boot stage. In
//! emergency download mode it enumerates as the Qualcomm HS-USB QDLoader
//! (`05C6:9008`); after a normal boot it enumerates with the same vendor ID
//! and a different product ID. Fastboot is recognised through the
//! diagnostic tool instead, see [`crate::verify`].

use crate::port::PortInfo;

#[cfg(feature = "native")]
use {
    crate::port::{NativePortEnumerator, PortEnumerator},
    log::{debug, trace},
};

/// Qualcomm USB vendor ID.
pub const QUALCOMM_VID: u16 = 0x05C6;

/// Product ID of the emergency download (QDLoader 9008) interface.
pub const EDL_PID: u16 = 0x9008;

/// Boot stage of the SoC as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceMode {
    /// No SoC interface found.
    #[default]
    Unknown,
    /// Emergency download mode.
    Edl,
    /// Booted normally.
    Normal,
    /// Fastboot bootloader mode.
    Fastboot,
}

impl DeviceMode {
    /// Classify a single USB identity.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        match (vid, pid) {
            (QUALCOMM_VID, EDL_PID) => Self::Edl,
            (QUALCOMM_VID, _) => Self::Normal,
            _ => Self::Unknown,
        }
    }

    /// Get a human-readable name for the mode.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Edl => "EDL",
            Self::Normal => "normal",
            Self::Fastboot => "fastboot",
        }
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Discovered serial endpoint with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Mode implied by the USB identity.
    pub mode: DeviceMode,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let mode = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceMode::from_vid_pid(vid, pid),
            _ => DeviceMode::Unknown,
        };
        Self {
            name: info.name,
            mode,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
        }
    }
}

/// Classification result: the mode and the endpoint it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Current mode.
    pub mode: DeviceMode,
    /// Endpoint of the SoC interface, if one was found.
    pub port: Option<String>,
}

impl From<DeviceMode> for DeviceStatus {
    fn from(mode: DeviceMode) -> Self {
        Self { mode, port: None }
    }
}

/// Overall status for a set of endpoints. An EDL interface wins over a
/// normal one, since a board in download mode may still expose other ports.
#[must_use]
pub fn classify(ports: &[DetectedPort]) -> DeviceStatus {
    [DeviceMode::Edl, DeviceMode::Normal]
        .into_iter()
        .find_map(|mode| {
            ports
                .iter()
                .find(|p| p.mode == mode)
                .map(|p| DeviceStatus {
                    mode,
                    port: Some(
                        p.name
                            .clone(),
                    ),
                })
        })
        .unwrap_or_default()
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .inspect(|p| {
                trace!(
                    "Found port: {} (VID: {:?}, PID: {:?}, mode: {})",
                    p.name, p.vid, p.pid, p.mode
                );
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available endpoints (no native backend).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let id_info = match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => format!(" [VID:{vid:04X} PID:{pid:04X}]"),
                _ => String::new(),
            };
            let mode_info = if port.mode == DeviceMode::Unknown {
                String::new()
            } else {
                format!(" ({})", port.mode)
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{id_info}{mode_info}{product_info}", port.name)
        })
        .collect()
}

/// Source of the current device mode.
///
/// Called at the start of each waiting state; implementations must not cache
/// results between calls.
pub trait UsbProbe {
    /// Classify the currently connected device.
    fn detect(&mut self) -> DeviceStatus;
}

impl<F: FnMut() -> DeviceStatus> UsbProbe for F {
    fn detect(&mut self) -> DeviceStatus {
        self()
    }
}

/// Probe backed by serial port enumeration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeUsbProbe;

impl UsbProbe for NativeUsbProbe {
    fn detect(&mut self) -> DeviceStatus {
        classify(&detect_ports())
    }
}
