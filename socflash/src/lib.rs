//! # socflash
//!
//! Flashing orchestration for automotive infotainment SoCs and their
//! companion MCU boards.
//!
//! A full run moves the SoC through its boot modes and flashes each stage:
//!
//! - EDL payload through the Sahara/firehose loaders (or any [`Actuator`])
//! - serial-console reset loop until the bootloader reports fastboot
//! - fastboot presence check with the diagnostic CLI
//! - the fastboot flashing script, with its output classified line by line
//! - MCU components through the Renesas flash programmer
//!
//! Every wait is bounded and reads time through an injected [`Clock`], so
//! the timing behaviour is testable without sleeping.
//!
//! ## Features
//!
//! - `native` (default): serial ports and USB enumeration via `serialport`
//! - `serde`: serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use socflash::{
//!     SystemClock,
//!     monitor::{BootOutcome, MonitorSettings, SerialBootMonitor},
//!     port::{NativePortOpener, PortOpener, PortRange, PortScanner},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scanner = PortScanner::new(NativePortOpener);
//!     let found = scanner.find_available_port(&PortRange::default())?;
//!     let port = NativePortOpener.open(&found.config(std::time::Duration::from_secs(1)))?;
//!
//!     let monitor = SerialBootMonitor::new(port, SystemClock::shared(), MonitorSettings::default());
//!     match monitor.wait_for_fastboot_mode(&mut |_| {})? {
//!         BootOutcome::Fastboot => println!("device is in fastboot"),
//!         BootOutcome::TimedOut => println!("no fastboot within 60s"),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod clock;
pub mod device;
pub mod edl;
pub mod error;
pub mod layout;
pub mod monitor;
pub mod orchestrator;
pub mod port;
pub mod process;
pub mod verify;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted between retry attempts.
///
/// The checker should return `true` when the run should stop (for example
/// after receiving Ctrl-C in CLI applications). Bounded waits are never cut
/// short; the check happens before each orchestrator step and before every
/// retry delay.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub use {
    clock::{Clock, Deadline, ManualClock, SharedClock, SystemClock, Ticker},
    device::{DetectedPort, DeviceMode, DeviceStatus, NativeUsbProbe, UsbProbe},
    edl::{Actuator, EdlJobFiles, EdlTools, FirehoseActuator},
    error::{Error, Result},
    layout::{ComponentSpec, EdlPayload, ImageLayout},
    monitor::{BootOutcome, MonitorEvent, MonitorSettings, SerialBootMonitor},
    orchestrator::{
        BootModeTrigger, Collaborators, FastbootVerification, FlashOrchestrator, FlashPlan,
        FlashState, Operator, OrchestratorSettings, RetryPolicy, SerialFastbootTrigger,
    },
    port::{PortRange, PortScanner, SerialConfig},
    process::{
        ExitReport, FlashJob, JobRunner, OutputEvent, ProcessSupervisor, PromptPolicy,
        SupervisorSettings,
    },
    verify::{DeviceVerifier, DiagnosticTool, FastbootTool, VerifierSettings},
};

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, NativePortOpener};
