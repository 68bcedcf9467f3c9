//! Flash job descriptions.

use crate::process::classify::PAUSE_MARKER;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Default overall budget for a flashing command.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How interactive pause prompts are answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPolicy {
    /// Never write to the child's stdin.
    Ignore,
    /// Answer lines containing one of `markers` (case-insensitive).
    Answer {
        /// Substrings identifying a prompt.
        markers: Vec<String>,
        /// Delay before answering.
        delay: Duration,
        /// Bytes written as the answer.
        response: Vec<u8>,
    },
}

impl Default for PromptPolicy {
    /// Answer `pause` with a single newline after one second.
    fn default() -> Self {
        Self::Answer {
            markers: vec![PAUSE_MARKER.to_string()],
            delay: Duration::from_secs(1),
            response: b"\n".to_vec(),
        }
    }
}

impl PromptPolicy {
    /// Markers this policy reacts to.
    pub fn markers(&self) -> &[String] {
        match self {
            Self::Ignore => &[],
            Self::Answer { markers, .. } => markers,
        }
    }
}

/// One flashing phase: what to run, where, and how to judge it.
///
/// Built with the `with_*` methods once the inputs have been validated, then
/// only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    name: String,
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    prompt: PromptPolicy,
    success_keywords: Vec<String>,
    timeout: Duration,
}

impl FlashJob {
    /// Create a job running `program` with no arguments.
    pub fn new(name: impl Into<String>, program: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            prompt: PromptPolicy::default(),
            success_keywords: Vec::new(),
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Create a job for a flashing script, run from the script's directory.
    ///
    /// Windows batch files go through `cmd /C`.
    pub fn script(name: impl Into<String>, script: &Path) -> Self {
        let is_batch = script
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bat") || ext.eq_ignore_ascii_case("cmd"));

        let job = if is_batch {
            Self::new(name, "cmd").with_args(["/C".into(), script.as_os_str().to_owned()])
        } else {
            Self::new(name, script.as_os_str())
        };

        match script.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => job.with_cwd(dir),
            _ => job,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args
            .extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the prompt policy.
    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptPolicy) -> Self {
        self.prompt = prompt;
        self
    }

    /// Require one of these phrases (case-insensitive) in the output.
    #[must_use]
    pub fn with_success_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success_keywords = keywords
            .into_iter()
            .map(Into::into)
            .collect();
        self
    }

    /// Set the overall time budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Job name used in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program to execute.
    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// Program arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory, if any.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd
            .as_deref()
    }

    /// Prompt policy.
    pub fn prompt(&self) -> &PromptPolicy {
        &self.prompt
    }

    /// Success phrases; empty means the exit status alone decides.
    pub fn success_keywords(&self) -> &[String] {
        &self.success_keywords
    }

    /// Overall time budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the command (stdio is configured by the supervisor).
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Command line for display.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_script_runs_through_cmd_in_its_directory() {
        let job = FlashJob::script(
            "fastboot",
            Path::new("/images/flat/fastboot_nscdc_high_blank_flash.bat"),
        );
        assert_eq!(job.program(), "cmd");
        assert_eq!(job.args()[0], "/C");
        assert_eq!(job.cwd(), Some(Path::new("/images/flat")));
        assert_eq!(
            job.command_line(),
            "cmd /C /images/flat/fastboot_nscdc_high_blank_flash.bat"
        );
    }

    #[test]
    fn test_shell_script_runs_directly() {
        let job = FlashJob::script("fastboot", Path::new("/images/flash_all.sh"));
        assert_eq!(job.program(), "/images/flash_all.sh");
        assert!(job.args().is_empty());
    }

    #[test]
    fn test_defaults() {
        let job = FlashJob::new("meter", "rfp-cli");
        assert_eq!(job.timeout(), DEFAULT_JOB_TIMEOUT);
        assert_eq!(job.prompt().markers(), ["pause".to_string()]);
        assert!(job.success_keywords().is_empty());
        assert!(job.cwd().is_none());
        assert!(PromptPolicy::Ignore.markers().is_empty());
    }
}
