//! Operator prompts and tool output rendering.
//!
//! Confirmations go through dialoguer unless the run is non-interactive, in
//! which case every prompt is confirmed and logged. Progress lines from the
//! flashing tools update a single spinner line in place; completions, errors
//! and phase notifications are printed above it.

use {
    crate::{use_fancy_output, was_interrupted},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::{info, warn},
    socflash::{FlashState, Operator, OutputEvent},
    std::{io::IsTerminal, time::Duration},
};

/// How the operator is reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorOptions {
    /// Confirm every prompt automatically.
    pub non_interactive: bool,
    /// Print only warnings and failures.
    pub quiet: bool,
    /// Print informational tool output too.
    pub verbose: bool,
}

/// Operator at the terminal.
pub struct TerminalOperator {
    options: OperatorOptions,
    spinner: ProgressBar,
}

impl TerminalOperator {
    /// Create an operator; the spinner is only drawn on a color terminal.
    pub fn new(options: OperatorOptions) -> Self {
        let spinner = if options.quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new_spinner();
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap(),
            );
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        };
        Self { options, spinner }
    }

    /// Print a line above the spinner (or plainly when there is none).
    fn line(&self, text: &str) {
        if self
            .spinner
            .is_hidden()
        {
            if !self.options.quiet {
                eprintln!("{text}");
            }
        } else {
            self.spinner
                .println(text);
        }
    }

    /// Print a failure above the spinner; shown even with `--quiet`.
    fn failure_line(&self, text: &str) {
        if self
            .spinner
            .is_hidden()
        {
            eprintln!("{text}");
        } else {
            self.spinner
                .println(text);
        }
    }

    fn failure_text(state: FlashState, message: &str) -> String {
        format!(
            "{} {} {message}",
            style("✗").red(),
            style(format!("[{state}]")).bold()
        )
    }

    /// Stop the spinner and clear its line.
    pub fn finish(&self) {
        self.spinner
            .finish_and_clear();
    }

    fn ask(&self, prompt: &str) -> bool {
        if !std::io::stdin().is_terminal() {
            warn!("Cannot prompt without a terminal; rerun with --non-interactive to auto-confirm");
            return false;
        }
        self.spinner
            .suspend(|| {
                Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(prompt)
                    .default(true)
                    .interact()
            })
            .unwrap_or(false)
    }
}

impl Drop for TerminalOperator {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Operator for TerminalOperator {
    fn confirm(&mut self, prompt: &str) -> bool {
        if was_interrupted() {
            return false;
        }
        if self.options.non_interactive {
            info!("{prompt} (confirmed automatically)");
            return true;
        }
        self.ask(prompt)
    }

    fn notify(&mut self, state: FlashState, message: &str) {
        self.spinner
            .set_message("");
        let text = format!(
            "{} {} {message}",
            style("→").cyan(),
            style(format!("[{state}]")).bold()
        );
        self.line(&text);
    }

    fn notify_failure(&mut self, state: FlashState, message: &str) {
        self.spinner
            .set_message("");
        self.failure_line(&Self::failure_text(state, message));
    }

    fn render(&mut self, event: OutputEvent, line: &str) {
        match event {
            OutputEvent::Progress => {
                if self
                    .spinner
                    .is_hidden()
                {
                    self.line(&format!("[PROGRESS] {line}"));
                } else {
                    self.spinner
                        .set_message(line.to_string());
                }
            },
            OutputEvent::Completion => {
                self.spinner
                    .set_message("");
                self.line(&format!("{} {line}", style("✓").green()));
            },
            OutputEvent::ErrorReported => {
                self.line(&format!("{} {line}", style("⚠").yellow()));
            },
            OutputEvent::PauseRequest => {
                self.line(&format!("{} {line}", style("⏎").dim()));
            },
            OutputEvent::Informational => {
                if self.options.verbose {
                    self.line(&format!("{}", style(line).dim()));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_operator(non_interactive: bool) -> TerminalOperator {
        TerminalOperator::new(OperatorOptions {
            non_interactive,
            quiet: true,
            verbose: false,
        })
    }

    #[test]
    fn test_non_interactive_confirms() {
        let mut operator = quiet_operator(true);
        assert!(operator.confirm("Connect the METER board, then continue"));
    }

    #[test]
    fn test_quiet_operator_hides_spinner() {
        let mut operator = quiet_operator(true);
        assert!(
            operator
                .spinner
                .is_hidden()
        );
        // Rendering into a hidden spinner must not panic.
        operator.render(OutputEvent::Progress, "Sending 'boot' (1024 KB)");
        operator.render(OutputEvent::Completion, "OKAY [  0.010s]");
        operator.notify(FlashState::FastbootFlashing, "Flash script completed");
    }

    #[test]
    fn test_failure_text_names_state_and_message() {
        let text = TerminalOperator::failure_text(FlashState::EdlFlashing, "EDL flashing failed");
        assert!(text.contains("EDL flashing failed"));
        assert!(text.contains(&format!("[{}]", FlashState::EdlFlashing)));

        let mut operator = quiet_operator(true);
        operator.notify_failure(FlashState::EdlFlashing, "EDL flashing failed");
    }
}
