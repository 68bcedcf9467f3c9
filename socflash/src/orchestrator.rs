//! Flashing state machine.
//!
//! ```text
//! AwaitEdlDevice -> EdlFlashing -> AwaitNormalDevice -> FastbootTrigger
//!        ^              |                                   ^      |
//!        +--- failure --+                                   |      v
//!                                            failure  +-----+  FastbootVerify
//!                                                     |            |
//!                                                     +---- FastbootFlashing
//!                                                                  |
//!   AwaitComponentReplug(i) -> ComponentFlashing(i) -> ... -> Done
//! ```
//!
//! Each state performs one bounded wait through a collaborator and returns
//! the next state. Phases that the [`FlashPlan`] leaves out are skipped: no
//! EDL payload starts the run at `AwaitNormalDevice`, no fastboot script
//! goes straight to the components.
//!
//! Failures loop back to the start of their phase. By default this repeats
//! until the operator aborts; a [`RetryPolicy`] cap turns endless retrying
//! into [`Error::RetriesExhausted`]. The global interrupt checker is polled
//! before every step.

use crate::clock::SharedClock;
use crate::device::{DeviceMode, UsbProbe};
use crate::edl::{Actuator, EdlJobFiles};
use crate::error::{Error, Result};
use crate::layout::EdlPayload;
use crate::monitor::{BootOutcome, MonitorEvent, MonitorSettings, SerialBootMonitor};
use crate::port::{PortOpener, PortRange, PortScanner, SerialConfig};
use crate::process::{FlashJob, JobRunner, OutputEvent};
use crate::verify::{DeviceVerifier, DiagnosticTool};
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Waiting for the SoC to enumerate in EDL mode.
    AwaitEdlDevice,
    /// Flashing the EDL payload.
    EdlFlashing,
    /// Waiting for the SoC to boot normally.
    AwaitNormalDevice,
    /// Forcing fastboot over the serial console.
    FastbootTrigger,
    /// Confirming fastboot with the diagnostic tool.
    FastbootVerify,
    /// Running the fastboot flashing script.
    FastbootFlashing,
    /// Waiting for the operator to connect MCU component `n`.
    AwaitComponentReplug(usize),
    /// Flashing MCU component `n`.
    ComponentFlashing(usize),
    /// Everything flashed.
    Done,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitEdlDevice => f.write_str("await EDL device"),
            Self::EdlFlashing => f.write_str("EDL flashing"),
            Self::AwaitNormalDevice => f.write_str("await normal device"),
            Self::FastbootTrigger => f.write_str("fastboot trigger"),
            Self::FastbootVerify => f.write_str("fastboot verify"),
            Self::FastbootFlashing => f.write_str("fastboot flashing"),
            Self::AwaitComponentReplug(n) => write!(f, "await component #{}", n + 1),
            Self::ComponentFlashing(n) => write!(f, "component #{} flashing", n + 1),
            Self::Done => f.write_str("done"),
        }
    }
}

/// What to flash, resolved from the image layout before the run starts.
#[derive(Debug, Clone, Default)]
pub struct FlashPlan {
    /// EDL payload; `None` skips the EDL phase.
    pub edl: Option<EdlPayload>,
    /// Fastboot flashing script job; `None` skips the fastboot phases.
    pub fastboot: Option<FlashJob>,
    /// MCU component jobs in flashing order.
    pub components: Vec<FlashJob>,
}

impl FlashPlan {
    /// State the run starts in.
    pub fn initial_state(&self) -> FlashState {
        if self.edl.is_some() {
            FlashState::AwaitEdlDevice
        } else if self.fastboot.is_some() {
            FlashState::AwaitNormalDevice
        } else {
            self.first_component_state()
        }
    }

    fn first_component_state(&self) -> FlashState {
        self.component_state_from(0)
    }

    fn component_state_from(&self, index: usize) -> FlashState {
        if index < self.components.len() {
            FlashState::AwaitComponentReplug(index)
        } else {
            FlashState::Done
        }
    }
}

/// Delay between attempts and an optional cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep before the next attempt.
    pub delay: Duration,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with `delay`.
    pub const fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Cap the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Retry policies of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Polling of USB enumeration while waiting for a mode.
    pub device_poll: RetryPolicy,
    /// EDL flashing.
    pub edl_retry: RetryPolicy,
    /// The trigger, verify and flash cycle.
    pub fastboot_retry: RetryPolicy,
    /// MCU component flashing.
    pub component_retry: RetryPolicy,
    /// Pause between detecting fastboot on the console and verifying it.
    pub post_trigger_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            device_poll: RetryPolicy::unbounded(Duration::from_secs(2)),
            edl_retry: RetryPolicy::unbounded(Duration::from_secs(5)),
            fastboot_retry: RetryPolicy::unbounded(Duration::from_secs(5)),
            component_retry: RetryPolicy::unbounded(Duration::from_secs(5)),
            post_trigger_delay: Duration::from_secs(5),
        }
    }
}

/// Forces the device into fastboot.
pub trait BootModeTrigger {
    /// One bounded attempt.
    fn trigger_fastboot(&mut self) -> Result<BootOutcome>;
}

/// Confirms fastboot after a trigger.
pub trait FastbootVerification {
    /// `true` when the device is listed and reports completion.
    fn verify_device_ready(&mut self) -> bool;
}

impl<T: DiagnosticTool> FastbootVerification for DeviceVerifier<T> {
    fn verify_device_ready(&mut self) -> bool {
        DeviceVerifier::verify_device_ready(self)
    }
}

/// The person at the bench.
pub trait Operator {
    /// Ask the operator to do something physical; `false` aborts the run.
    fn confirm(&mut self, prompt: &str) -> bool;

    /// Report a phase result.
    fn notify(&mut self, state: FlashState, message: &str);

    /// Report a failed step that will be retried or aborts the run.
    fn notify_failure(&mut self, state: FlashState, message: &str) {
        self.notify(state, message);
    }

    /// Show one classified line of tool output.
    fn render(&mut self, event: OutputEvent, line: &str) {
        let _ = (event, line);
    }
}

/// Serial fastboot trigger: scan for a console port, then monitor it.
pub struct SerialFastbootTrigger<O> {
    scanner: PortScanner<O>,
    range: PortRange,
    fixed_port: Option<String>,
    clock: SharedClock,
    settings: MonitorSettings,
    observer: Box<dyn FnMut(MonitorEvent<'_>)>,
}

impl<O: PortOpener> SerialFastbootTrigger<O> {
    /// Create a trigger that scans `range` for the console.
    pub fn new(
        scanner: PortScanner<O>,
        range: PortRange,
        clock: SharedClock,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            scanner,
            range,
            fixed_port: None,
            clock,
            settings,
            observer: Box::new(|_| {}),
        }
    }

    /// Always use this port instead of scanning.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.fixed_port = Some(port.into());
        self
    }

    /// Receive monitor events (console text, resets, hints).
    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(MonitorEvent<'_>) + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }
}

impl<O: PortOpener> BootModeTrigger for SerialFastbootTrigger<O> {
    fn trigger_fastboot(&mut self) -> Result<BootOutcome> {
        let config = match &self.fixed_port {
            Some(name) => SerialConfig::new(name, crate::port::CONSOLE_BAUD),
            None => self
                .scanner
                .find_available_port(&self.range)?
                .config(SerialConfig::default().timeout),
        };
        let port = self
            .scanner
            .opener()
            .open(&config)?;
        let monitor = SerialBootMonitor::new(port, self.clock.clone(), self.settings.clone());
        monitor.wait_for_fastboot_mode(&mut *self.observer)
    }
}

/// Collaborators driven by the orchestrator.
pub struct Collaborators<'a> {
    /// USB mode classification.
    pub probe: &'a mut dyn UsbProbe,
    /// EDL flashing capability.
    pub actuator: &'a mut dyn Actuator,
    /// Serial fastboot trigger.
    pub trigger: &'a mut dyn BootModeTrigger,
    /// Fastboot verification.
    pub verifier: &'a mut dyn FastbootVerification,
    /// Runs fastboot and component jobs.
    pub runner: &'a mut dyn JobRunner,
    /// Operator prompts and notifications.
    pub operator: &'a mut dyn Operator,
}

#[derive(Debug, Default)]
struct Attempts {
    device_wait: u32,
    edl: u32,
    fastboot: u32,
    component: u32,
}

/// Top-level flashing state machine.
pub struct FlashOrchestrator<'a> {
    plan: FlashPlan,
    settings: OrchestratorSettings,
    clock: SharedClock,
    io: Collaborators<'a>,
    state: FlashState,
    edl_port: Option<String>,
    attempts: Attempts,
}

impl<'a> FlashOrchestrator<'a> {
    /// Create an orchestrator positioned at the plan's initial state.
    pub fn new(
        plan: FlashPlan,
        settings: OrchestratorSettings,
        clock: SharedClock,
        io: Collaborators<'a>,
    ) -> Self {
        let state = plan.initial_state();
        Self {
            plan,
            settings,
            clock,
            io,
            state,
            edl_port: None,
            attempts: Attempts::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Run until `Done`, an operator abort, or a retry cap.
    pub fn run(&mut self) -> Result<()> {
        info!("Starting at {}", self.state);
        while self.state != FlashState::Done {
            self.step()?;
        }
        info!("All phases completed");
        Ok(())
    }

    /// Execute the current state once and move to the next one.
    pub fn step(&mut self) -> Result<FlashState> {
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }

        let next = match self.state {
            FlashState::AwaitEdlDevice => self.await_edl_device()?,
            FlashState::EdlFlashing => self.edl_flashing()?,
            FlashState::AwaitNormalDevice => self.await_normal_device()?,
            FlashState::FastbootTrigger => self.fastboot_trigger()?,
            FlashState::FastbootVerify => self.fastboot_verify()?,
            FlashState::FastbootFlashing => self.fastboot_flashing()?,
            FlashState::AwaitComponentReplug(n) => self.await_component(n)?,
            FlashState::ComponentFlashing(n) => self.component_flashing(n)?,
            FlashState::Done => FlashState::Done,
        };

        if next != self.state {
            debug!("{} -> {next}", self.state);
        }
        self.state = next;
        Ok(next)
    }

    fn after_edl(&self) -> FlashState {
        if self.plan.fastboot.is_some() {
            FlashState::AwaitNormalDevice
        } else {
            self.plan.first_component_state()
        }
    }

    fn await_edl_device(&mut self) -> Result<FlashState> {
        let status = self.io.probe.detect();
        match (status.mode, status.port) {
            (DeviceMode::Edl, Some(port)) => {
                info!("Device in EDL mode on {port}");
                self.attempts.device_wait = 0;
                self.edl_port = Some(port);
                Ok(FlashState::EdlFlashing)
            },
            (mode, _) => {
                debug!("Waiting for EDL device (current mode: {mode})");
                let policy = self.settings.device_poll;
                self.backoff("wait for EDL device", policy, |a| &mut a.device_wait)?;
                Ok(FlashState::AwaitEdlDevice)
            },
        }
    }

    fn edl_flashing(&mut self) -> Result<FlashState> {
        let (Some(payload), Some(port)) = (self.plan.edl.clone(), self.edl_port.clone()) else {
            return Ok(self.after_edl());
        };
        let files = EdlJobFiles { port, payload };

        if self
            .io
            .actuator
            .configure_and_launch(&files)
        {
            self.io
                .operator
                .notify(FlashState::EdlFlashing, "EDL flashing completed");
            self.attempts.edl = 0;
            return Ok(self.after_edl());
        }

        self.io
            .operator
            .notify_failure(FlashState::EdlFlashing, "EDL flashing failed");
        self.count_failure("EDL flashing", self.settings.edl_retry, |a| &mut a.edl)?;
        self.require_confirmation("Reconnect the device in EDL mode, then continue")?;
        Ok(FlashState::AwaitEdlDevice)
    }

    fn await_normal_device(&mut self) -> Result<FlashState> {
        let mode = self
            .io
            .probe
            .detect()
            .mode;
        if mode == DeviceMode::Normal {
            info!("Device booted normally");
            self.attempts.device_wait = 0;
            return Ok(FlashState::FastbootTrigger);
        }

        debug!("Waiting for normal boot (current mode: {mode})");
        let policy = self.settings.device_poll;
        self.backoff("wait for normal device", policy, |a| &mut a.device_wait)?;
        Ok(FlashState::AwaitNormalDevice)
    }

    fn fastboot_trigger(&mut self) -> Result<FlashState> {
        let failure = match self
            .io
            .trigger
            .trigger_fastboot()
        {
            Ok(BootOutcome::Fastboot) => {
                info!("Fastboot mode triggered");
                self.clock
                    .sleep(self.settings.post_trigger_delay);
                return Ok(FlashState::FastbootVerify);
            },
            Ok(BootOutcome::TimedOut) => "fastboot token not seen on the serial console".to_string(),
            Err(e) => e.to_string(),
        };

        warn!("Fastboot trigger failed: {failure}");
        self.io
            .operator
            .notify_failure(FlashState::FastbootTrigger, &failure);
        let policy = self.settings.fastboot_retry;
        self.backoff("fastboot trigger", policy, |a| &mut a.fastboot)?;
        Ok(FlashState::FastbootTrigger)
    }

    fn fastboot_verify(&mut self) -> Result<FlashState> {
        if self
            .io
            .verifier
            .verify_device_ready()
        {
            return Ok(FlashState::FastbootFlashing);
        }

        self.io
            .operator
            .notify_failure(FlashState::FastbootVerify, "No fastboot device detected");
        let policy = self.settings.fastboot_retry;
        self.backoff("fastboot verification", policy, |a| &mut a.fastboot)?;
        Ok(FlashState::FastbootTrigger)
    }

    fn fastboot_flashing(&mut self) -> Result<FlashState> {
        let Some(job) = self.plan.fastboot.clone() else {
            return Ok(self.plan.first_component_state());
        };

        if self.run_job(FlashState::FastbootFlashing, &job) {
            self.io
                .operator
                .notify(FlashState::FastbootFlashing, "Flash script completed");
            self.attempts.fastboot = 0;
            return Ok(self.plan.first_component_state());
        }

        self.count_failure("fastboot flashing", self.settings.fastboot_retry, |a| {
            &mut a.fastboot
        })?;
        self.require_confirmation("Fastboot flashing failed. Retry from the fastboot trigger?")?;
        Ok(FlashState::FastbootTrigger)
    }

    fn await_component(&mut self, index: usize) -> Result<FlashState> {
        let Some(job) = self.plan.components.get(index) else {
            return Ok(FlashState::Done);
        };
        let prompt = format!("Connect the {} board, then continue", job.name());
        self.require_confirmation(&prompt)?;
        Ok(FlashState::ComponentFlashing(index))
    }

    fn component_flashing(&mut self, index: usize) -> Result<FlashState> {
        let Some(job) = self.plan.components.get(index).cloned() else {
            return Ok(FlashState::Done);
        };

        let state = FlashState::ComponentFlashing(index);
        if self.run_job(state, &job) {
            self.io
                .operator
                .notify(state, &format!("{} programmed", job.name()));
            self.attempts.component = 0;
            return Ok(self.plan.component_state_from(index + 1));
        }

        let phase = format!("{} flashing", job.name());
        let policy = self.settings.component_retry;
        self.backoff(&phase, policy, |a| &mut a.component)?;
        Ok(state)
    }

    /// Run a job, forwarding output to the operator. `true` on success.
    fn run_job(&mut self, state: FlashState, job: &FlashJob) -> bool {
        let operator = &mut *self.io.operator;
        let outcome = self
            .io
            .runner
            .run_job(job, &mut |event, line| operator.render(event, line));

        match outcome {
            Ok(report) => match report.ensure_success(job) {
                Ok(()) => true,
                Err(e) => {
                    let detail = report
                        .errors
                        .last()
                        .map(|l| format!(" (last error: {l})"))
                        .unwrap_or_default();
                    operator.notify_failure(state, &format!("{e}{detail}"));
                    false
                },
            },
            Err(e) => {
                operator.notify_failure(state, &e.to_string());
                false
            },
        }
    }

    fn require_confirmation(&mut self, prompt: &str) -> Result<()> {
        if self
            .io
            .operator
            .confirm(prompt)
        {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Count a failed attempt and fail once the policy cap is reached.
    fn count_failure(
        &mut self,
        phase: &str,
        policy: RetryPolicy,
        counter: impl FnOnce(&mut Attempts) -> &mut u32,
    ) -> Result<()> {
        let attempts = counter(&mut self.attempts);
        *attempts += 1;
        match policy.max_attempts {
            Some(max) if *attempts >= max => Err(Error::RetriesExhausted {
                phase: phase.to_string(),
                attempts: *attempts,
            }),
            _ => Ok(()),
        }
    }

    /// Count a failed attempt, then sleep the policy delay.
    fn backoff(
        &mut self,
        phase: &str,
        policy: RetryPolicy,
        counter: impl FnOnce(&mut Attempts) -> &mut u32,
    ) -> Result<()> {
        self.count_failure(phase, policy, counter)?;
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }
        self.clock
            .sleep(policy.delay);
        Ok(())
    }
}
