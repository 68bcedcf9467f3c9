//! Fastboot presence and completion checks.
//!
//! Each attempt lists devices; once the device is listed, `getvar all` must
//! print one of the completion phrases. Failed attempts are retried after a
//! backoff, and the final answer is a plain `bool`.

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::process::{FlashJob, ProcessSupervisor, PromptPolicy, SupervisorSettings};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::time::Duration;

/// Phrases (lowercase) that confirm a completed flash.
pub const COMPLETION_PHRASES: &[&str] = &["finished. total time", "all images flashed successfully"];

/// Token (lowercase) identifying a listed device in `devices` output.
pub const LISTED_TOKEN: &str = "fastboot";

/// Runs the diagnostic CLI and returns its combined output.
pub trait DiagnosticTool {
    /// Run with `args`, killing the tool after `timeout`.
    fn run(&mut self, args: &[&str], timeout: Duration) -> Result<String>;
}

/// The `fastboot` executable.
pub struct FastbootTool {
    program: OsString,
    supervisor: ProcessSupervisor,
}

impl FastbootTool {
    /// Wrap the given executable (a bare name is looked up in `PATH`).
    pub fn new(program: impl Into<OsString>, clock: SharedClock) -> Self {
        Self {
            program: program.into(),
            supervisor: ProcessSupervisor::new(
                clock,
                SupervisorSettings {
                    tail_lines: 0,
                    ..SupervisorSettings::default()
                },
            ),
        }
    }
}

impl DiagnosticTool for FastbootTool {
    fn run(&mut self, args: &[&str], timeout: Duration) -> Result<String> {
        let job = FlashJob::new("fastboot", self.program.clone())
            .with_args(args)
            .with_prompt(PromptPolicy::Ignore)
            .with_timeout(timeout);

        let mut output = String::new();
        let report = self
            .supervisor
            .run_and_stream(&job, &mut |_, line| {
                output.push_str(line);
                output.push('\n');
            })?;

        if report.timed_out {
            return Err(Error::SubprocessTimeout {
                program: format!("fastboot {}", args.join(" ")),
                timeout,
            });
        }
        if report.exit_code != Some(0) {
            debug!("fastboot {} exited with {:?}", args.join(" "), report.exit_code);
        }
        Ok(output)
    }
}

/// Attempt counts and delays for [`DeviceVerifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierSettings {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay after an attempt where the device was not listed.
    pub list_backoff: Duration,
    /// Delay after an attempt where completion was not confirmed.
    pub retry_backoff: Duration,
    /// Budget for the `devices` query.
    pub list_timeout: Duration,
    /// Budget for the `getvar all` query.
    pub getvar_timeout: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            list_backoff: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(10),
            list_timeout: Duration::from_secs(10),
            getvar_timeout: Duration::from_secs(20),
        }
    }
}

enum Probe {
    NotListed,
    Unconfirmed,
    Confirmed,
    ToolMissing,
}

/// Confirms that a device sits in fastboot and reports a finished flash.
pub struct DeviceVerifier<T> {
    tool: T,
    clock: SharedClock,
    settings: VerifierSettings,
}

impl<T: DiagnosticTool> DeviceVerifier<T> {
    /// Create a verifier.
    pub fn new(tool: T, clock: SharedClock, settings: VerifierSettings) -> Self {
        Self {
            tool,
            clock,
            settings,
        }
    }

    /// The wrapped diagnostic tool.
    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Probe up to `max_attempts` times; `false` when never confirmed.
    ///
    /// A missing tool fails immediately, since retrying cannot help.
    pub fn verify_device_ready(&mut self) -> bool {
        let max = self.settings.max_attempts;
        for attempt in 1..=max {
            let backoff = match self.probe() {
                Probe::Confirmed => {
                    info!("Fastboot device verified");
                    return true;
                },
                Probe::ToolMissing => {
                    warn!("fastboot tool not found; make sure it is installed and in PATH");
                    return false;
                },
                Probe::NotListed => {
                    warn!("Attempt {attempt}/{max}: no fastboot device found");
                    self.settings.list_backoff
                },
                Probe::Unconfirmed => {
                    info!("Attempt {attempt}/{max}: fastboot device connected, flash not confirmed yet");
                    self.settings.retry_backoff
                },
            };

            if attempt < max {
                debug!("Retrying verification in {backoff:?}");
                self.clock
                    .sleep(backoff);
            }
        }

        warn!("{}", Error::VerificationExhausted { attempts: max });
        false
    }

    fn probe(&mut self) -> Probe {
        let listing = match self
            .tool
            .run(&["devices"], self.settings.list_timeout)
        {
            Ok(out) => out,
            Err(e) if is_not_found(&e) => return Probe::ToolMissing,
            Err(e) => {
                warn!("fastboot devices failed: {e}");
                return Probe::NotListed;
            },
        };
        if !listing
            .to_ascii_lowercase()
            .contains(LISTED_TOKEN)
        {
            return Probe::NotListed;
        }

        match self
            .tool
            .run(&["getvar", "all"], self.settings.getvar_timeout)
        {
            Ok(out) => {
                let lower = out.to_ascii_lowercase();
                if COMPLETION_PHRASES
                    .iter()
                    .any(|p| lower.contains(p))
                {
                    Probe::Confirmed
                } else {
                    Probe::Unconfirmed
                }
            },
            Err(e) if is_not_found(&e) => Probe::ToolMissing,
            Err(e) => {
                warn!("fastboot getvar failed: {e}");
                Probe::Unconfirmed
            },
        }
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::SubprocessSpawn { source, .. } if source.kind() == ErrorKind::NotFound)
}
