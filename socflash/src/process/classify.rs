//! Classification of flashing-tool output lines.
//!
//! Pure functions only; rendering and logging happen in the caller.

/// Substrings marking a progress line (case-sensitive, as printed by fastboot).
pub const PROGRESS_KEYWORDS: &[&str] = &["Sending", "Writing", "OKAY"];

/// Substring marking the end of one flashing step.
pub const COMPLETION_KEYWORD: &str = "OKAY";

/// Case-insensitive substring of an interactive pause prompt.
pub const PAUSE_MARKER: &str = "pause";

/// Case-insensitive substrings of an error report.
pub const ERROR_MARKERS: &[&str] = &["failed", "error"];

/// A classified output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// Transfer or write in progress; rendered in place.
    Progress,
    /// A step finished; rendered in place, then a line break.
    Completion,
    /// The tool waits for a keypress.
    PauseRequest,
    /// The tool reported an error. Does not abort the job.
    ErrorReported,
    /// Anything else.
    Informational,
}

/// Classify one line.
///
/// Progress lines win over pause prompts, which win over error reports, so a
/// line like `Writing 'userdata' FAILED` is still rendered as progress. Use
/// [`mentions_error`] to collect errors independently of the primary class.
pub fn classify_line(line: &str, pause_markers: &[String]) -> OutputEvent {
    if line.contains(COMPLETION_KEYWORD) {
        return OutputEvent::Completion;
    }
    if PROGRESS_KEYWORDS
        .iter()
        .any(|k| line.contains(k))
    {
        return OutputEvent::Progress;
    }

    let lower = line.to_ascii_lowercase();
    if pause_markers
        .iter()
        .any(|m| lower.contains(&m.to_ascii_lowercase()))
    {
        OutputEvent::PauseRequest
    } else if mentions_error(line) {
        OutputEvent::ErrorReported
    } else {
        OutputEvent::Informational
    }
}

/// Whether a line reports an error, whatever its primary class.
pub fn mentions_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ERROR_MARKERS
        .iter()
        .any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause() -> Vec<String> {
        vec![PAUSE_MARKER.to_string()]
    }

    #[test]
    fn test_fastboot_progress_lines() {
        assert_eq!(
            classify_line("Sending 'boot' (1024 KB)...", &pause()),
            OutputEvent::Progress
        );
        assert_eq!(
            classify_line("Writing 'boot'...", &pause()),
            OutputEvent::Progress
        );
        assert_eq!(
            classify_line("OKAY [  0.010s]", &pause()),
            OutputEvent::Completion
        );
    }

    #[test]
    fn test_pause_is_case_insensitive() {
        assert_eq!(
            classify_line("Press any key to continue . . . PAUSE", &pause()),
            OutputEvent::PauseRequest
        );
        assert_eq!(classify_line("pause", &[]), OutputEvent::Informational);
    }

    #[test]
    fn test_error_lines() {
        assert_eq!(
            classify_line("FAILED (remote: 'partition not found')", &pause()),
            OutputEvent::ErrorReported
        );
        assert_eq!(
            classify_line("fastboot: error: no devices", &pause()),
            OutputEvent::ErrorReported
        );
        assert_eq!(
            classify_line("Writing 'userdata' FAILED", &pause()),
            OutputEvent::Progress
        );
        assert!(mentions_error("Writing 'userdata' FAILED"));
    }

    #[test]
    fn test_informational() {
        assert_eq!(
            classify_line("finished. total time: 1.000s", &pause()),
            OutputEvent::Informational
        );
        assert!(!mentions_error("finished. total time: 1.000s"));
    }
}
