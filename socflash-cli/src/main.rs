//! socflash CLI - Command-line tool for flashing infotainment SoCs and
//! their companion MCU boards.
//!
//! ## Features
//!
//! - Full flashing sequence: EDL payload, fastboot script, MCU components
//! - Individual phases (`fastboot`, `trigger`, `verify`, `mcu`)
//! - USB port listing with mode classification
//! - Shell completion generation
//! - TOML configuration and environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod operator;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if spinners and symbols should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a dedicated process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing operator input.
    #[error("{0}")]
    Usage(String),
    /// Missing or unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Aborted by the operator.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// 2 usage, 3 configuration, 130 cancelled, 1 anything else.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<socflash::Error>() {
        Some(socflash::Error::Cancelled) => 130,
        Some(socflash::Error::Config(_)) => 3,
        _ => 1,
    }
}

/// socflash - Flash infotainment SoCs (EDL + fastboot) and companion MCUs.
///
/// Environment variables:
///   SOCFLASH_IMAGES             - Images root directory
///   SOCFLASH_PORT               - Serial console port (skips port scanning)
///   SOCFLASH_NON_INTERACTIVE    - Non-interactive mode (auto-confirm prompts)
#[derive(Parser)]
#[command(name = "socflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Images root directory (overrides `[paths] images`).
    #[arg(short, long, global = true, env = "SOCFLASH_IMAGES", value_name = "DIR")]
    pub(crate) images: Option<PathBuf>,

    /// Serial console port (scanned in the configured range if not given).
    #[arg(short, long, global = true, env = "SOCFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (operator prompts are confirmed automatically).
    #[arg(long, global = true, env = "SOCFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the full sequence: EDL, fastboot, then every MCU component.
    Flash {
        /// Skip the MCU components.
        #[arg(long)]
        skip_mcu: bool,
    },

    /// Trigger fastboot, verify the device and run the flash script.
    Fastboot,

    /// Reset the device over the serial console until it enters fastboot.
    Trigger,

    /// Check that the device is listed by fastboot and finished flashing.
    Verify,

    /// Flash the MCU components only.
    Mcu {
        /// Only flash these components (comma-separated, e.g. METER,IVI).
        #[arg(long, value_delimiter = ',')]
        component: Vec<String>,
    },

    /// List available serial ports with their device mode.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Help, version and usage errors keep clap's own exit codes (0 / 2).
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        let code = exit_code_for(&err);
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    init_logging(cli);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    socflash::set_interrupt_checker(was_interrupted);

    debug!(
        "socflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash { skip_mcu } => commands::flash::cmd_flash(cli, &config, *skip_mcu),
        Commands::Fastboot => commands::flash::cmd_fastboot(cli, &config),
        Commands::Trigger => commands::fastboot::cmd_trigger(cli, &config),
        Commands::Verify => commands::fastboot::cmd_verify(cli, &config),
        Commands::Mcu { component } => commands::flash::cmd_mcu(cli, &config, component),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from(["socflash", "flash"]).unwrap();
        assert!(matches!(cli.command, Commands::Flash { skip_mcu: false }));

        let cli = Cli::try_parse_from(["socflash", "flash", "--skip-mcu"]).unwrap();
        assert!(matches!(cli.command, Commands::Flash { skip_mcu: true }));
    }

    #[test]
    fn test_cli_parse_mcu_components() {
        let cli = Cli::try_parse_from(["socflash", "mcu", "--component", "METER,IVI"]).unwrap();
        match cli.command {
            Commands::Mcu { component } => assert_eq!(component, vec!["METER", "IVI"]),
            _ => panic!("expected mcu"),
        }

        let cli = Cli::try_parse_from(["socflash", "mcu"]).unwrap();
        assert!(matches!(cli.command, Commands::Mcu { component } if component.is_empty()));
    }

    #[test]
    fn test_cli_parse_phase_commands() {
        let parse = |arg: &str| {
            Cli::try_parse_from(["socflash", arg])
                .unwrap()
                .command
        };
        assert!(matches!(parse("fastboot"), Commands::Fastboot));
        assert!(matches!(parse("trigger"), Commands::Trigger));
        assert!(matches!(parse("verify"), Commands::Verify));
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["socflash", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "socflash",
            "--images",
            "/srv/images",
            "-p",
            "COM7",
            "-vv",
            "--non-interactive",
            "--config",
            "bench.toml",
            "trigger",
        ])
        .unwrap();
        assert_eq!(cli.images, Some(PathBuf::from("/srv/images")));
        assert_eq!(cli.port.as_deref(), Some("COM7"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("bench.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["socflash"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code_for(&CliError::Config("x".into()).into()), 3);
        assert_eq!(exit_code_for(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code_for(&socflash::Error::Cancelled.into()), 130);
        assert_eq!(
            exit_code_for(&socflash::Error::BootTimeout(std::time::Duration::from_secs(60)).into()),
            1
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(socflash::Error::Cancelled).context("flashing");
        assert_eq!(exit_code_for(&err), 130);
    }
}
