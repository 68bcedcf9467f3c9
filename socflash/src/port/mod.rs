//! Serial port abstraction.
//!
//! The boot monitor and the port scanner only talk to the [`Port`] and
//! [`PortOpener`] traits, so the serial-polling logic can be driven by an
//! in-memory port in tests and by the `serialport` crate on real hardware.
//!
//! ```text
//! +--------------------+     +--------------------+
//! |  SerialBootMonitor |     |    PortScanner     |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |     Port trait     |<----|  PortOpener trait  |
//! +---------+----------+     +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |  NativePort        |
//! |  (serialport)      |
//! +--------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;
pub mod scanner;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate used for the SoC debug console.
pub const CONSOLE_BAUD: u32 = 115200;

/// Serial port configuration.
///
/// Framing is always 8 data bits, no parity, one stop bit, no flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout, also used as the open timeout while scanning.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: CONSOLE_BAUD,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// An open serial connection.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens serial ports by configuration.
pub trait PortOpener {
    /// Concrete port type produced by this opener.
    type Port: Port;

    /// Open a port; the call must not block longer than `config.timeout`.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativePortOpener};
pub use scanner::{PortRange, PortScanner};
