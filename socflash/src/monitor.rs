//! Serial boot-log monitoring and fastboot triggering.
//!
//! The SoC debug console prints a boot log after every reset. To push the
//! device into fastboot, the monitor repeatedly sends `reset -f` and watches
//! the log:
//!
//! - a reset is sent unconditionally every `reset_interval`;
//! - once a boot indicator shows up (the device is alive but has not reached
//!   fastboot yet) and at least `indicator_reset_gap` has passed since the
//!   previous reset, another reset is sent right away;
//! - when the case-insensitive token `fastboot` appears, the monitor waits
//!   `settle_delay` for trailing output and reports success.
//!
//! Text matching lives in [`BootLogScanner`], which performs no I/O and is
//! independent of how the byte stream is chunked. [`SerialBootMonitor`] owns
//! the port and drives the scanner from a poll loop.

use crate::clock::{Deadline, SharedClock, Ticker};
use crate::error::Result;
use crate::port::Port;
use log::{debug, info, trace, warn};
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Command that forces the SoC to reboot.
pub const RESET_COMMAND: &[u8] = b"reset -f\r\n";

/// Token (matched case-insensitively) that marks fastboot mode.
pub const FASTBOOT_TOKEN: &str = "fastboot";

/// Boot-log substrings showing the device is alive and resettable.
pub const BOOT_INDICATORS: &[&str] = &[
    "QC_IMAGE_VERSION_STRING=",
    "IMAGE_VARIANT_STRING=",
    "OEM_IMAGE_VERSION_STRING=",
    "Boot Interface: UFS",
    "Successfully set the FDE",
    "launch io-sock for NS CDC platform.",
];

/// Timing and matching parameters for one fastboot-detection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Upper bound for the whole wait.
    pub total_timeout: Duration,
    /// Unconditional reset period.
    pub reset_interval: Duration,
    /// Minimum time since the last reset before an indicator-triggered reset.
    pub indicator_reset_gap: Duration,
    /// Delay after the fastboot token before reporting success.
    pub settle_delay: Duration,
    /// Sleep between I/O checks.
    pub poll_interval: Duration,
    /// Silence after which the operator is told to power-cycle the device.
    pub silence_hint_after: Duration,
    /// Bytes written to reset the device.
    pub reset_command: Vec<u8>,
    /// Boot indicators (matched case-sensitively).
    pub indicators: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(60),
            reset_interval: Duration::from_secs(10),
            indicator_reset_gap: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            silence_hint_after: Duration::from_secs(15),
            reset_command: RESET_COMMAND.to_vec(),
            indicators: BOOT_INDICATORS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Why a reset command was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    /// The reset interval elapsed.
    Periodic,
    /// A boot indicator was seen; holds the indicator text.
    Indicator(String),
}

/// What the scanner wants the monitor to do after a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Keep polling.
    Idle,
    /// Send a reset now.
    Reset(ResetReason),
    /// Fastboot token detected.
    Fastboot,
}

/// Result of feeding one chunk to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    /// Decoded text of the chunk (non-ASCII bytes removed).
    pub text: String,
    /// Number of bytes dropped while decoding.
    pub dropped: usize,
    /// Decision for the monitor.
    pub action: ScanAction,
}

/// Final state of a fastboot-detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The fastboot token was seen.
    Fastboot,
    /// The total timeout elapsed first.
    TimedOut,
}

/// Progress notifications emitted while monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent<'a> {
    /// Console text received.
    Data(&'a str),
    /// A reset command was written.
    ResetSent(&'a ResetReason),
    /// No data for a while; the device may need a manual power cycle.
    SilenceHint,
    /// Fastboot token seen; settling before returning.
    FastbootDetected,
}

/// Decode console bytes as ASCII, dropping anything that is not.
///
/// Returns the text and the number of dropped bytes. Each byte is decoded on
/// its own, so the result never depends on chunk boundaries.
pub fn decode_console_bytes(bytes: &[u8]) -> (String, usize) {
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect();
    let dropped = bytes.len() - text.len();
    (text, dropped)
}

/// Pure text-matching state for one monitoring session.
#[derive(Debug, Clone)]
pub struct BootLogScanner {
    buffer: String,
    /// Bytes of `buffer` that have been fully searched.
    scanned: usize,
    reset_ticker: Ticker,
    indicator_reset_gap: Duration,
    indicators: Vec<String>,
    /// Set once any indicator has appeared since the last reset.
    indicator_seen: Option<String>,
    overlap: usize,
}

impl BootLogScanner {
    /// Create a scanner; the first periodic reset is due immediately.
    pub fn new(settings: &MonitorSettings) -> Self {
        let longest = settings
            .indicators
            .iter()
            .map(String::len)
            .chain(std::iter::once(FASTBOOT_TOKEN.len()))
            .max()
            .unwrap_or(0);
        Self {
            buffer: String::new(),
            scanned: 0,
            reset_ticker: Ticker::new(settings.reset_interval),
            indicator_reset_gap: settings.indicator_reset_gap,
            indicators: settings
                .indicators
                .clone(),
            indicator_seen: None,
            overlap: longest.saturating_sub(1),
        }
    }

    /// Whether the periodic reset is due.
    pub fn periodic_reset_due(&self, now: Instant) -> bool {
        self.reset_ticker
            .is_due(now)
    }

    /// Record a reset sent at `now`; all accumulated text is discarded.
    pub fn record_reset(&mut self, now: Instant) {
        self.reset_ticker
            .mark(now);
        self.buffer
            .clear();
        self.scanned = 0;
        self.indicator_seen = None;
    }

    /// Time since the last reset, if any was sent.
    pub fn since_last_reset(&self, now: Instant) -> Option<Duration> {
        self.reset_ticker
            .since_last(now)
    }

    /// Text accumulated since the last reset.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Indicator seen since the last reset, if any.
    pub fn indicator_seen(&self) -> Option<&str> {
        self.indicator_seen
            .as_deref()
    }

    /// Append a chunk and decide what to do next.
    ///
    /// The fastboot token takes priority over an indicator-triggered reset
    /// in the same chunk.
    ///
    /// Limitation: an indicator-triggered reset clears the buffer, including
    /// a partial token at the end of the chunk. A token split across that
    /// chunk and the next one is therefore missed; the device prints it
    /// again after the reset.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Scan {
        let (text, dropped) = decode_console_bytes(bytes);
        if dropped > 0 {
            trace!("Dropped {dropped} undecodable console bytes");
        }
        self.buffer
            .push_str(&text);

        // Only ASCII is ever pushed, so every byte index is a char boundary.
        let from = self
            .scanned
            .saturating_sub(self.overlap);
        let region = &self.buffer[from..];

        let action = if region
            .to_ascii_lowercase()
            .contains(FASTBOOT_TOKEN)
        {
            ScanAction::Fastboot
        } else {
            if self
                .indicator_seen
                .is_none()
            {
                self.indicator_seen = self
                    .indicators
                    .iter()
                    .find(|ind| region.contains(ind.as_str()))
                    .cloned();
            }

            match &self.indicator_seen {
                Some(indicator) if self.indicator_gap_elapsed(now) => {
                    ScanAction::Reset(ResetReason::Indicator(indicator.clone()))
                },
                _ => ScanAction::Idle,
            }
        };

        self.scanned = self
            .buffer
            .len();

        Scan {
            text,
            dropped,
            action,
        }
    }

    fn indicator_gap_elapsed(&self, now: Instant) -> bool {
        self.reset_ticker
            .since_last(now)
            .is_none_or(|since| since >= self.indicator_reset_gap)
    }
}

/// Watches the serial console until the device reaches fastboot.
///
/// The monitor owns its port for one attempt and closes it on every exit
/// path.
pub struct SerialBootMonitor<P: Port> {
    port: P,
    clock: SharedClock,
    settings: MonitorSettings,
}

impl<P: Port> SerialBootMonitor<P> {
    /// Create a monitor over an open port.
    pub fn new(port: P, clock: SharedClock, settings: MonitorSettings) -> Self {
        Self {
            port,
            clock,
            settings,
        }
    }

    /// Run one detection attempt.
    ///
    /// Serial read/write failures end the attempt with an error.
    pub fn wait_for_fastboot_mode(
        mut self,
        observer: &mut dyn FnMut(MonitorEvent<'_>),
    ) -> Result<BootOutcome> {
        let result = self.poll(observer);
        if let Err(e) = self
            .port
            .close()
        {
            warn!("Failed to close {}: {e}", self.port.name());
        }
        result
    }

    fn poll(&mut self, observer: &mut dyn FnMut(MonitorEvent<'_>)) -> Result<BootOutcome> {
        self.port
            .clear_buffers()?;

        let mut scanner = BootLogScanner::new(&self.settings);
        let deadline = Deadline::after(
            self.clock
                .now(),
            self.settings
                .total_timeout,
        );
        // Silence is measured from the last received byte; resets do not count.
        let mut last_activity = self
            .clock
            .now();
        let mut hinted = false;
        let mut buf = [0u8; 1024];

        info!(
            "Waiting for fastboot on {} (timeout {:?})",
            self.port.name(),
            deadline.budget()
        );

        while !deadline.expired(
            self.clock
                .now(),
        ) {
            let now = self
                .clock
                .now();
            if scanner.periodic_reset_due(now) {
                self.send_reset(&mut scanner, &ResetReason::Periodic, observer)?;
            }

            let pending = self
                .port
                .bytes_to_read()?;
            let n = if pending > 0 {
                self.read_chunk(&mut buf[..pending.min(1024)])?
            } else {
                0
            };

            if n > 0 {
                let now = self
                    .clock
                    .now();
                last_activity = now;
                hinted = false;

                let scan = scanner.feed(&buf[..n], now);
                if !scan
                    .text
                    .is_empty()
                {
                    trace!("[LOG] {}", scan.text);
                    observer(MonitorEvent::Data(&scan.text));
                }

                match scan.action {
                    ScanAction::Fastboot => {
                        info!("Fastboot mode detected");
                        observer(MonitorEvent::FastbootDetected);
                        self.clock
                            .sleep(
                                self.settings
                                    .settle_delay,
                            );
                        return Ok(BootOutcome::Fastboot);
                    },
                    ScanAction::Reset(reason) => {
                        self.send_reset(&mut scanner, &reason, observer)?;
                    },
                    ScanAction::Idle => {},
                }
            } else if !hinted
                && now.saturating_duration_since(last_activity)
                    > self
                        .settings
                        .silence_hint_after
            {
                warn!("No console output; set the device to normal mode and power-cycle it");
                observer(MonitorEvent::SilenceHint);
                hinted = true;
            }

            self.clock
                .sleep(
                    self.settings
                        .poll_interval,
                );
        }

        warn!(
            "Fastboot mode not detected within {:?}",
            deadline.budget()
        );
        Ok(BootOutcome::TimedOut)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self
            .port
            .read(buf)
        {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn send_reset(
        &mut self,
        scanner: &mut BootLogScanner,
        reason: &ResetReason,
        observer: &mut dyn FnMut(MonitorEvent<'_>),
    ) -> Result<()> {
        self.port
            .write_all_bytes(
                &self
                    .settings
                    .reset_command,
            )?;
        let now = self
            .clock
            .now();
        scanner.record_reset(now);
        match reason {
            ResetReason::Periodic => debug!("Sent reset command"),
            ResetReason::Indicator(ind) => info!("Boot indicator '{ind}' seen, sent reset command"),
        }
        observer(MonitorEvent::ResetSent(reason));
        Ok(())
    }
}
