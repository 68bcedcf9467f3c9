//! Error types for socflash.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for socflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for socflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No serial port in the scanned range could be opened.
    #[error("No available serial port in {prefix}{first}..={prefix}{last}")]
    PortUnavailable {
        /// Port name prefix (e.g. `COM`).
        prefix: String,
        /// First port number scanned.
        first: u32,
        /// Last port number scanned.
        last: u32,
    },

    /// The fastboot token never appeared on the serial console.
    #[error("Fastboot mode not detected within {0:?}")]
    BootTimeout(Duration),

    /// The diagnostic tool never confirmed the device.
    #[error("Device verification failed after {attempts} attempts")]
    VerificationExhausted {
        /// Number of probes performed.
        attempts: u32,
    },

    /// An external command could not be started.
    #[error("Failed to start {program}: {source}")]
    SubprocessSpawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An external command was killed after exceeding its time budget.
    #[error("{program} did not finish within {timeout:?} and was killed")]
    SubprocessTimeout {
        /// Program that was killed.
        program: String,
        /// Budget that was exceeded.
        timeout: Duration,
    },

    /// An external command finished but did not report success.
    #[error("{0} reported failure")]
    ScriptReportedFailure(String),

    /// An expected folder or file of the image layout is missing.
    #[error("Missing {what}: {}", path.display())]
    LayoutMissing {
        /// Human readable description of the missing artifact.
        what: String,
        /// Path that was searched.
        path: PathBuf,
    },

    /// A phase hit its configured retry cap.
    #[error("{phase} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Phase name.
        phase: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The operator aborted the run.
    #[error("Cancelled by operator")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a serial transport failure.
    pub fn is_port_error(&self) -> bool {
        #[cfg(feature = "native")]
        if matches!(self, Self::Serial(_)) {
            return true;
        }
        matches!(self, Self::Io(_) | Self::PortUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_unavailable_message_names_range() {
        let err = Error::PortUnavailable {
            prefix: "COM".to_string(),
            first: 1,
            last: 255,
        };
        assert_eq!(
            err.to_string(),
            "No available serial port in COM1..=COM255"
        );
        assert!(err.is_port_error());
    }

    #[test]
    fn test_layout_missing_message() {
        let err = Error::LayoutMissing {
            what: "flash script".to_string(),
            path: PathBuf::from("/images"),
        };
        assert!(err.to_string().contains("flash script"));
        assert!(err.to_string().contains("/images"));
        assert!(!err.is_port_error());
    }
}
