//! Single fastboot phases: serial trigger and device verification.

use {
    crate::{Cli, config::Config},
    anyhow::Result,
    console::style,
    log::info,
    socflash::{
        BootModeTrigger, BootOutcome, DeviceVerifier, FastbootTool, MonitorEvent, NativePortOpener,
        PortScanner, SerialFastbootTrigger, SharedClock, SystemClock,
    },
    std::io::Write as _,
};

/// Serial fastboot trigger configured from the CLI and config file.
///
/// With `-v` the raw console output is echoed to stderr.
pub(crate) fn serial_trigger(
    cli: &Cli,
    config: &Config,
    clock: SharedClock,
) -> SerialFastbootTrigger<NativePortOpener> {
    let echo = cli.verbose > 0 && !cli.quiet;
    let trigger = SerialFastbootTrigger::new(
        PortScanner::new(NativePortOpener),
        config.port_range(),
        clock,
        config.monitor_settings(),
    )
    .with_observer(move |event| {
        if let MonitorEvent::Data(text) = event {
            if echo {
                eprint!("{text}");
                std::io::stderr()
                    .flush()
                    .ok();
            }
        }
    });

    match &cli.port {
        Some(port) => trigger.with_port(port),
        None => trigger,
    }
}

/// Fastboot verifier configured from the config file.
pub(crate) fn fastboot_verifier(config: &Config, clock: SharedClock) -> DeviceVerifier<FastbootTool> {
    DeviceVerifier::new(
        FastbootTool::new(config.fastboot_tool(), clock.clone()),
        clock,
        config.verifier_settings(),
    )
}

/// Trigger command implementation.
pub(crate) fn cmd_trigger(cli: &Cli, config: &Config) -> Result<()> {
    let settings = config.monitor_settings();
    let mut trigger = serial_trigger(cli, config, SystemClock::shared());

    if !cli.quiet {
        eprintln!(
            "{} Resetting the device until the bootloader reports fastboot (up to {}s)",
            style("⏳").yellow(),
            settings
                .total_timeout
                .as_secs()
        );
    }

    match trigger.trigger_fastboot()? {
        BootOutcome::Fastboot => {
            info!("Fastboot mode triggered");
            if !cli.quiet {
                eprintln!("{} Device is in fastboot mode", style("✓").green());
            }
            Ok(())
        },
        BootOutcome::TimedOut => Err(socflash::Error::BootTimeout(settings.total_timeout).into()),
    }
}

/// Verify command implementation.
pub(crate) fn cmd_verify(cli: &Cli, config: &Config) -> Result<()> {
    let settings = config.verifier_settings();
    let mut verifier = fastboot_verifier(config, SystemClock::shared());

    if verifier.verify_device_ready() {
        if !cli.quiet {
            eprintln!("{} Fastboot device verified", style("✓").green());
        }
        Ok(())
    } else {
        Err(socflash::Error::VerificationExhausted {
            attempts: settings.max_attempts,
        }
        .into())
    }
}
