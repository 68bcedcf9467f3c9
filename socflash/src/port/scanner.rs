//! Serial port scanning.
//!
//! Finds the lowest-numbered port in a name range that can be opened at the
//! console baud rate. Retrying a failed scan is left to the caller.

use crate::error::{Error, Result};
use crate::port::{CONSOLE_BAUD, Port, PortOpener, SerialConfig};
use log::{debug, info, trace, warn};
use std::time::Duration;

/// A numbered range of serial device names, e.g. `COM1..=COM255`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortRange {
    /// Name prefix (`COM` on Windows, `/dev/ttyUSB` on Linux).
    pub prefix: String,
    /// First number, inclusive.
    pub first: u32,
    /// Last number, inclusive.
    pub last: u32,
}

impl PortRange {
    /// Create a new range.
    pub fn new(prefix: impl Into<String>, first: u32, last: u32) -> Self {
        Self {
            prefix: prefix.into(),
            first,
            last,
        }
    }

    /// Candidate port names in ascending numeric order.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        (self.first..=self.last).map(|n| format!("{}{n}", self.prefix))
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first) as usize + 1
        }
    }

    /// Whether the range has no candidates.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("COM", 1, 255)
        } else {
            Self::new("/dev/ttyUSB", 0, 31)
        }
    }
}

/// Port that was opened and released successfully during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Port name/path.
    pub name: String,
    /// Baud rate the port was probed at.
    pub baud_rate: u32,
}

impl PortDescriptor {
    /// Serial configuration for reopening this port.
    pub fn config(&self, timeout: Duration) -> SerialConfig {
        SerialConfig::new(&self.name, self.baud_rate).with_timeout(timeout)
    }
}

/// Finds an available serial port.
pub struct PortScanner<O> {
    opener: O,
    open_timeout: Duration,
}

impl<O: PortOpener> PortScanner<O> {
    /// Per-port open timeout used when none is given.
    pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Create a scanner using the given opener.
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
        }
    }

    /// Set the per-port open timeout.
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// The opener this scanner uses.
    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Return the first port in `range` that opens; the probe handle is closed
    /// before returning. A failure to close it is logged, not returned.
    pub fn find_available_port(&self, range: &PortRange) -> Result<PortDescriptor> {
        debug!(
            "Scanning {} candidate ports starting at {}{}",
            range.len(),
            range.prefix,
            range.first
        );

        for name in range.names() {
            let config = SerialConfig::new(&name, CONSOLE_BAUD).with_timeout(self.open_timeout);
            match self
                .opener
                .open(&config)
            {
                Ok(mut port) => {
                    if let Err(e) = port.close() {
                        warn!("Failed to close {name} after scanning: {e}");
                    }
                    info!("Available serial port found: {name}");
                    return Ok(PortDescriptor {
                        name,
                        baud_rate: CONSOLE_BAUD,
                    });
                },
                Err(e) => trace!("Could not open {name}: {e}"),
            }
        }

        Err(Error::PortUnavailable {
            prefix: range
                .prefix
                .clone(),
            first: range.first,
            last: range.last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{self, Read, Write};

    struct FakePort {
        name: String,
        closed: bool,
        fail_close: bool,
    }

    impl Read for FakePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for FakePort {
        fn name(&self) -> &str {
            &self.name
        }

        fn baud_rate(&self) -> u32 {
            CONSOLE_BAUD
        }

        fn bytes_to_read(&mut self) -> Result<usize> {
            Ok(0)
        }

        fn clear_buffers(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            if self.fail_close {
                return Err(Error::Io(io::Error::other("close failed")));
            }
            self.closed = true;
            Ok(())
        }
    }

    /// Opens only the listed names and records every attempt.
    struct FakeOpener {
        free: Vec<&'static str>,
        attempts: RefCell<Vec<String>>,
        fail_close: bool,
    }

    impl PortOpener for FakeOpener {
        type Port = FakePort;

        fn open(&self, config: &SerialConfig) -> Result<FakePort> {
            self.attempts
                .borrow_mut()
                .push(config.port_name.clone());
            assert_eq!(config.baud_rate, CONSOLE_BAUD);
            if self
                .free
                .contains(&config.port_name.as_str())
            {
                Ok(FakePort {
                    name: config.port_name.clone(),
                    closed: false,
                    fail_close: self.fail_close,
                })
            } else {
                Err(Error::Io(io::Error::new(io::ErrorKind::NotFound, "busy")))
            }
        }
    }

    #[test]
    fn test_range_names_ascending() {
        let range = PortRange::new("COM", 3, 5);
        let names: Vec<String> = range.names().collect();
        assert_eq!(names, vec!["COM3", "COM4", "COM5"]);
        assert_eq!(range.len(), 3);
        assert!(PortRange::new("COM", 5, 3).is_empty());
    }

    #[test]
    fn test_finds_lowest_available_port() {
        let opener = FakeOpener {
            free: vec!["COM7", "COM4"],
            attempts: RefCell::new(Vec::new()),
            fail_close: false,
        };
        let scanner = PortScanner::new(opener);
        let found = scanner
            .find_available_port(&PortRange::new("COM", 1, 10))
            .unwrap();
        assert_eq!(found.name, "COM4");
        assert_eq!(found.baud_rate, 115200);
        assert_eq!(
            *scanner
                .opener()
                .attempts
                .borrow(),
            vec!["COM1", "COM2", "COM3", "COM4"]
        );
    }

    #[test]
    fn test_exhausted_range_reports_unavailable() {
        let opener = FakeOpener {
            free: vec![],
            attempts: RefCell::new(Vec::new()),
            fail_close: false,
        };
        let scanner = PortScanner::new(opener);
        let err = scanner
            .find_available_port(&PortRange::new("COM", 1, 4))
            .unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { first: 1, last: 4, .. }));
        assert_eq!(
            scanner
                .opener()
                .attempts
                .borrow()
                .len(),
            4
        );
    }

    #[test]
    fn test_close_failure_still_returns_port() {
        let opener = FakeOpener {
            free: vec!["COM2"],
            attempts: RefCell::new(Vec::new()),
            fail_close: true,
        };
        let scanner = PortScanner::new(opener);
        let found = scanner
            .find_available_port(&PortRange::new("COM", 1, 3))
            .unwrap();
        assert_eq!(found.name, "COM2");
    }
}
