//! Supervised execution of external flashing commands.
//!
//! [`ProcessSupervisor`] spawns a [`FlashJob`], merges the child's stdout and
//! stderr into one line stream, classifies every line, answers pause prompts
//! and kills the child when the job's time budget runs out. The outcome is an
//! [`ExitReport`]; deciding whether to retry is left to the caller.

pub mod classify;
pub mod job;

use crate::clock::{Deadline, SharedClock};
use crate::error::{Error, Result};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

pub use classify::{OutputEvent, classify_line, mentions_error};
pub use job::{DEFAULT_JOB_TIMEOUT, FlashJob, PromptPolicy};

/// Silence after which trailing output is no longer awaited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on collecting trailing output after the child exits.
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Supervisor parameters shared by all jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Sleep between checks of the output channel and the child status.
    pub poll_interval: Duration,
    /// Silence after which a warning is logged (the job keeps running).
    pub silence_warning: Duration,
    /// Number of trailing lines kept in the report.
    pub tail_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            silence_warning: Duration::from_secs(60),
            tail_lines: 20,
        }
    }
}

/// Outcome of one supervised run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit status was success, a success keyword was seen (when required)
    /// and the job did not time out.
    pub succeeded: bool,
    /// Exit code, if the child exited normally.
    pub exit_code: Option<i32>,
    /// The child was killed after exceeding its budget.
    pub timed_out: bool,
    /// Whether any success keyword appeared in the output.
    pub keyword_found: bool,
    /// Last lines of output, oldest first.
    pub last_lines: Vec<String>,
    /// Every line that reported an error.
    pub errors: Vec<String>,
}

impl ExitReport {
    /// Turn an unsuccessful report into the matching error.
    pub fn ensure_success(&self, job: &FlashJob) -> Result<()> {
        if self.succeeded {
            Ok(())
        } else if self.timed_out {
            Err(Error::SubprocessTimeout {
                program: job
                    .name()
                    .to_string(),
                timeout: job.timeout(),
            })
        } else {
            Err(Error::ScriptReportedFailure(
                job.name()
                    .to_string(),
            ))
        }
    }
}

/// Something that can run a [`FlashJob`] to completion.
pub trait JobRunner {
    /// Run `job`, passing every classified line to `render`.
    fn run_job(
        &mut self,
        job: &FlashJob,
        render: &mut dyn FnMut(OutputEvent, &str),
    ) -> Result<ExitReport>;
}

/// Runs flashing commands under a time budget.
pub struct ProcessSupervisor {
    clock: SharedClock,
    settings: SupervisorSettings,
}

/// Kills the child unless it has already been reaped.
struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if matches!(self.0.try_wait(), Ok(None)) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

/// Accumulated state of one run.
struct Transcript<'a> {
    job: &'a FlashJob,
    keywords: Vec<String>,
    tail: VecDeque<String>,
    tail_lines: usize,
    report: ExitReport,
}

impl<'a> Transcript<'a> {
    fn new(job: &'a FlashJob, tail_lines: usize) -> Self {
        Self {
            job,
            keywords: job
                .success_keywords()
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
            tail: VecDeque::with_capacity(tail_lines),
            tail_lines,
            report: ExitReport::default(),
        }
    }

    fn record(&mut self, line: &str) -> OutputEvent {
        let event = classify_line(
            line,
            self.job
                .prompt()
                .markers(),
        );

        if mentions_error(line) {
            warn!("{} reported error: {line}", self.job.name());
            self.report
                .errors
                .push(line.to_string());
        }

        if !self.report.keyword_found {
            let lower = line.to_ascii_lowercase();
            self.report.keyword_found = self
                .keywords
                .iter()
                .any(|k| lower.contains(k.as_str()));
        }

        if self.tail_lines > 0 {
            if self.tail.len() == self.tail_lines {
                self.tail
                    .pop_front();
            }
            self.tail
                .push_back(line.to_string());
        }

        event
    }

    fn finish(mut self, status: Option<ExitStatus>) -> ExitReport {
        self.report.exit_code = status.and_then(|s| s.code());
        let keyword_ok = self
            .keywords
            .is_empty()
            || self.report.keyword_found;
        self.report.succeeded = !self.report.timed_out
            && status.is_some_and(|s| s.success())
            && keyword_ok;
        self.report.last_lines = self
            .tail
            .into_iter()
            .collect();
        self.report
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(source: Option<R>, tx: Sender<String>) {
    let Some(source) = source else {
        return;
    };
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if tx
                        .send(line.to_string())
                        .is_err()
                    {
                        break;
                    }
                },
            }
        }
    });
}

impl ProcessSupervisor {
    /// Create a supervisor.
    pub fn new(clock: SharedClock, settings: SupervisorSettings) -> Self {
        Self { clock, settings }
    }

    /// Run `job` to completion or until its budget runs out.
    ///
    /// Only a failure to start the program is returned as an error; every
    /// other outcome is described by the report.
    pub fn run_and_stream(
        &self,
        job: &FlashJob,
        render: &mut dyn FnMut(OutputEvent, &str),
    ) -> Result<ExitReport> {
        let answers = !matches!(job.prompt(), PromptPolicy::Ignore);
        let mut cmd = job.command();
        cmd.stdin(if answers {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        info!("Running {}: {}", job.name(), job.command_line());
        let mut child = cmd
            .spawn()
            .map_err(|source| Error::SubprocessSpawn {
                program: job
                    .program()
                    .to_string_lossy()
                    .into_owned(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        spawn_line_reader(
            child
                .stdout
                .take(),
            tx.clone(),
        );
        spawn_line_reader(
            child
                .stderr
                .take(),
            tx,
        );
        let mut stdin = child
            .stdin
            .take();
        let mut child = KillOnDrop(child);

        let mut transcript = Transcript::new(job, self.settings.tail_lines);
        let deadline = Deadline::after(
            self.clock
                .now(),
            job.timeout(),
        );
        let mut last_output = self
            .clock
            .now();
        let mut silence_warned = false;

        let status = loop {
            let mut got_output = false;
            loop {
                match rx.try_recv() {
                    Ok(line) => {
                        got_output = true;
                        self.handle_line(&mut transcript, &mut stdin, &deadline, &line, render);
                    },
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }

            let now = self
                .clock
                .now();
            if got_output {
                last_output = now;
                silence_warned = false;
            }

            if let Some(status) = child
                .0
                .try_wait()?
            {
                break Some(status);
            }

            if deadline.expired(now) {
                warn!(
                    "{} did not finish within {:?}, killing it",
                    job.name(),
                    job.timeout()
                );
                if let Err(e) = child
                    .0
                    .kill()
                {
                    warn!("Failed to kill {}: {e}", job.name());
                }
                let _ = child
                    .0
                    .wait();
                transcript.report.timed_out = true;
                break None;
            }

            if !silence_warned
                && now.saturating_duration_since(last_output) >= self.settings.silence_warning
            {
                warn!(
                    "No output from {} for {:?}",
                    job.name(),
                    self.settings.silence_warning
                );
                silence_warned = true;
            }

            self.clock
                .sleep(self.settings.poll_interval);
        };

        if !transcript.report.timed_out {
            self.drain_remaining(&rx, &mut transcript, &mut stdin, &deadline, render);
        }

        let report = transcript.finish(status);
        debug!(
            "{} finished: exit code {:?}, succeeded {}",
            job.name(),
            report.exit_code,
            report.succeeded
        );
        Ok(report)
    }

    /// Collect output still buffered after the child exited.
    ///
    /// Descendants that inherited the pipes can keep them open indefinitely,
    /// so this stops at the job deadline, after [`DRAIN_LIMIT`], or after
    /// [`DRAIN_GRACE`] of silence.
    fn drain_remaining(
        &self,
        rx: &Receiver<String>,
        transcript: &mut Transcript<'_>,
        stdin: &mut Option<ChildStdin>,
        deadline: &Deadline,
        render: &mut dyn FnMut(OutputEvent, &str),
    ) {
        let drain = Deadline::after(
            self.clock
                .now(),
            DRAIN_LIMIT,
        );
        loop {
            let now = self
                .clock
                .now();
            if deadline.expired(now) {
                warn!(
                    "Output of {} still open when its budget ran out",
                    transcript
                        .job
                        .name()
                );
                transcript.report.timed_out = true;
                break;
            }
            if drain.expired(now) {
                debug!("Output pipes still open after {DRAIN_LIMIT:?}; not waiting further");
                break;
            }

            let wait = DRAIN_GRACE
                .min(deadline.remaining(now))
                .min(drain.remaining(now));
            match rx.recv_timeout(wait) {
                Ok(line) => self.handle_line(transcript, stdin, deadline, &line, render),
                Err(RecvTimeoutError::Timeout) if wait == DRAIN_GRACE => {
                    debug!("Output pipes still open after exit; not waiting further");
                    break;
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_line(
        &self,
        transcript: &mut Transcript<'_>,
        stdin: &mut Option<ChildStdin>,
        deadline: &Deadline,
        line: &str,
        render: &mut dyn FnMut(OutputEvent, &str),
    ) {
        trace!("[{}] {line}", transcript.job.name());
        let event = transcript.record(line);
        render(event, line);

        if event == OutputEvent::PauseRequest {
            self.answer_prompt(transcript.job, stdin, deadline);
        }
    }

    /// Answer a pause prompt after the job's delay.
    ///
    /// A prompt whose delay would outlast the deadline is left unanswered.
    fn answer_prompt(&self, job: &FlashJob, stdin: &mut Option<ChildStdin>, deadline: &Deadline) {
        let PromptPolicy::Answer {
            delay, response, ..
        } = job.prompt()
        else {
            return;
        };
        let Some(pipe) = stdin.as_mut() else {
            return;
        };

        let remaining = deadline.remaining(
            self.clock
                .now(),
        );
        if *delay >= remaining {
            debug!(
                "Not answering prompt of {}: {remaining:?} left in its budget",
                job.name()
            );
            return;
        }

        self.clock
            .sleep(*delay);
        let written = pipe
            .write_all(response)
            .and_then(|()| pipe.flush());
        match written {
            Ok(()) => debug!("Answered pause prompt of {}", job.name()),
            Err(e) => {
                warn!("Failed to answer prompt of {}: {e}", job.name());
                *stdin = None;
            },
        }
    }
}

impl JobRunner for ProcessSupervisor {
    fn run_job(
        &mut self,
        job: &FlashJob,
        render: &mut dyn FnMut(OutputEvent, &str),
    ) -> Result<ExitReport> {
        self.run_and_stream(job, render)
    }
}
