//! EDL (emergency download) flashing.
//!
//! The orchestrator only sees the [`Actuator`] capability: given the payload
//! files and the EDL port, configure the vendor tooling and run it to
//! completion. [`FirehoseActuator`] does this with the command-line Sahara and
//! firehose loaders; a GUI-driven implementation can be plugged in instead.

use crate::layout::EdlPayload;
use crate::process::{FlashJob, JobRunner, OutputEvent, PromptPolicy};
use log::{info, warn};
use std::ffi::OsString;
use std::time::Duration;

/// Sahara command id that uploads and executes the programmer image.
const SAHARA_IMAGE_ID: u32 = 13;

/// Everything an actuator needs for one EDL flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdlJobFiles {
    /// Serial endpoint of the device in EDL mode.
    pub port: String,
    /// Payload found in the image layout.
    pub payload: EdlPayload,
}

/// Opaque capability that performs an EDL flash.
pub trait Actuator {
    /// Configure the flashing tool for `files` and run it; `true` on success.
    fn configure_and_launch(&mut self, files: &EdlJobFiles) -> bool;
}

/// Command-line EDL tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdlTools {
    /// `QSaharaServer` executable.
    pub sahara: OsString,
    /// `fh_loader` executable.
    pub fh_loader: OsString,
    /// Target storage (`spinor` for the SAIL NOR flash).
    pub memory_name: String,
    /// Budget for the Sahara upload.
    pub sahara_timeout: Duration,
    /// Budget for the firehose transfer.
    pub loader_timeout: Duration,
}

impl Default for EdlTools {
    fn default() -> Self {
        Self {
            sahara: "QSaharaServer".into(),
            fh_loader: "fh_loader".into(),
            memory_name: "spinor".to_string(),
            sahara_timeout: Duration::from_secs(120),
            loader_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Device path the Qualcomm tools expect: `\\.\COMn` for Windows COM ports.
pub fn tool_port_path(port: &str) -> String {
    if port
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("COM"))
    {
        format!(r"\\.\{port}")
    } else {
        port.to_string()
    }
}

/// Runs Sahara, then the firehose loader, through a [`JobRunner`].
pub struct FirehoseActuator<R> {
    runner: R,
    tools: EdlTools,
}

impl<R: JobRunner> FirehoseActuator<R> {
    /// Create an actuator.
    pub fn new(runner: R, tools: EdlTools) -> Self {
        Self { runner, tools }
    }

    /// The two jobs, in execution order.
    pub fn jobs(&self, files: &EdlJobFiles) -> [FlashJob; 2] {
        let port = tool_port_path(&files.port);
        let payload = &files.payload;

        let sahara = FlashJob::new("sahara", self.tools.sahara.clone())
            .with_args([
                "-p".to_string(),
                port.clone(),
                "-s".to_string(),
                format!("{SAHARA_IMAGE_ID}:{}", payload.firehose.display()),
            ])
            .with_prompt(PromptPolicy::Ignore)
            .with_timeout(self.tools.sahara_timeout);

        let mut manifests = vec![file_name(&payload.rawprogram)];
        if let Some(patch) = &payload.patch {
            manifests.push(file_name(patch));
        }

        let loader = FlashJob::new("fh_loader", self.tools.fh_loader.clone())
            .with_args([
                format!("--port={port}"),
                format!("--sendxml={}", manifests.join(",")),
                format!("--search_path={}", payload.folder.display()),
                "--noprompt".to_string(),
                "--showpercentagecomplete".to_string(),
                format!("--memoryname={}", self.tools.memory_name),
                "--zlpawarehost=1".to_string(),
            ])
            .with_cwd(&payload.folder)
            .with_prompt(PromptPolicy::Ignore)
            .with_timeout(self.tools.loader_timeout);

        [sahara, loader]
    }

    /// The wrapped runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| {
            n.to_string_lossy()
                .into_owned()
        })
        .unwrap_or_default()
}

impl<R: JobRunner> Actuator for FirehoseActuator<R> {
    fn configure_and_launch(&mut self, files: &EdlJobFiles) -> bool {
        for job in self.jobs(files) {
            let mut log_line = |_: OutputEvent, line: &str| info!("[{}] {line}", job.name());
            match self
                .runner
                .run_job(&job, &mut log_line)
            {
                Ok(report) if report.succeeded => {},
                Ok(report) => {
                    warn!(
                        "{} failed (exit code {:?}, timed out: {})",
                        job.name(),
                        report.exit_code,
                        report.timed_out
                    );
                    return false;
                },
                Err(e) => {
                    warn!("{} could not run: {e}", job.name());
                    return false;
                },
            }
        }
        true
    }
}
