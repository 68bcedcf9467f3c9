//! Orchestrated runs: `flash`, `fastboot` and `mcu`.

use {
    crate::{
        Cli, CliError,
        commands::fastboot::{fastboot_verifier, serial_trigger},
        config::Config,
        operator::{OperatorOptions, TerminalOperator},
    },
    anyhow::{Context, Result},
    console::style,
    log::debug,
    socflash::{
        Collaborators, ComponentSpec, FirehoseActuator, FlashJob, FlashOrchestrator, FlashPlan,
        ImageLayout, NativeUsbProbe, ProcessSupervisor, PromptPolicy, SupervisorSettings,
        SystemClock, layout,
    },
    std::path::Path,
};

fn open_layout(cli: &Cli, config: &Config) -> Result<ImageLayout> {
    let root = config.images_root(cli.images.as_deref())?;
    ImageLayout::open(&root, config.edl_folder())
        .with_context(|| format!("Invalid images directory {}", root.display()))
}

/// Job running the fastboot flash script found under the images root.
fn fastboot_job(image_layout: &ImageLayout, config: &Config) -> Result<FlashJob> {
    let script = image_layout.find_fastboot_script(&config.fastboot_scripts())?;
    Ok(FlashJob::script("fastboot flash", &script)
        .with_success_keywords(
            config
                .fastboot
                .success_keywords
                .clone(),
        )
        .with_timeout(config.fastboot_timeout()))
}

/// Keep the components named in `filter` (all when empty), in configured order.
fn select_components(specs: Vec<ComponentSpec>, filter: &[String]) -> Result<Vec<ComponentSpec>> {
    if let Some(unknown) = filter.iter().find(|name| {
        !specs
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(name))
    }) {
        let known: Vec<&str> = specs
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        return Err(CliError::Usage(format!(
            "Unknown component '{unknown}' (configured: {})",
            known.join(", ")
        ))
        .into());
    }

    Ok(specs
        .into_iter()
        .filter(|s| {
            filter.is_empty()
                || filter
                    .iter()
                    .any(|name| s.name.eq_ignore_ascii_case(name))
        })
        .collect())
}

/// One programmer job per component, images resolved up front.
fn component_jobs(
    images_root: &Path,
    tools_root: &Path,
    specs: &[ComponentSpec],
) -> Result<Vec<FlashJob>> {
    if specs.is_empty() {
        return Ok(Vec::new());
    }

    let programmer = layout::find_programmer(tools_root, layout::RFP_PROGRAMMER)?;
    specs
        .iter()
        .map(|spec| {
            let image = ImageLayout::find_component_image(images_root, spec)?;
            debug!("{} image: {}", spec.name, image.display());
            Ok(FlashJob::new(spec.name.clone(), programmer.as_os_str())
                .with_args(spec.args_for(&image))
                .with_prompt(PromptPolicy::Ignore))
        })
        .collect()
}

fn describe_plan(plan: &FlashPlan) {
    let phase = |enabled: bool, text: &str| {
        let mark = if enabled {
            style("•").green()
        } else {
            style("-").dim()
        };
        eprintln!("    {mark} {text}");
    };

    eprintln!("{} Flash plan:", style("ℹ").blue());
    match &plan.edl {
        Some(payload) => phase(true, &format!("EDL payload from {}", payload.folder.display())),
        None => phase(false, "EDL (no payload, skipped)"),
    }
    match &plan.fastboot {
        Some(job) => phase(true, &format!("fastboot: {}", job.command_line())),
        None => phase(false, "fastboot (skipped)"),
    }
    for job in &plan.components {
        phase(true, &format!("MCU {}", job.name()));
    }
}

/// Drive `plan` to completion with the native collaborators.
fn run_plan(cli: &Cli, config: &Config, plan: FlashPlan) -> Result<()> {
    if !cli.quiet {
        describe_plan(&plan);
    }

    let clock = SystemClock::shared();
    let mut probe = NativeUsbProbe;
    let mut actuator = FirehoseActuator::new(
        ProcessSupervisor::new(clock.clone(), SupervisorSettings::default()),
        config.edl_tools(),
    );
    let mut trigger = serial_trigger(cli, config, clock.clone());
    let mut verifier = fastboot_verifier(config, clock.clone());
    let mut runner = ProcessSupervisor::new(clock.clone(), SupervisorSettings::default());
    let mut operator = TerminalOperator::new(OperatorOptions {
        non_interactive: cli.non_interactive,
        quiet: cli.quiet,
        verbose: cli.verbose > 0,
    });

    let mut orchestrator = FlashOrchestrator::new(
        plan,
        config.orchestrator_settings(),
        clock,
        Collaborators {
            probe: &mut probe,
            actuator: &mut actuator,
            trigger: &mut trigger,
            verifier: &mut verifier,
            runner: &mut runner,
            operator: &mut operator,
        },
    );
    let result = orchestrator.run();
    let stopped_at = orchestrator.state();
    drop(orchestrator);
    operator.finish();

    result.with_context(|| format!("Stopped during {stopped_at}"))?;

    if !cli.quiet {
        eprintln!("\n{} All phases completed", style("🎉").green().bold());
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, skip_mcu: bool) -> Result<()> {
    let image_layout = open_layout(cli, config)?;
    let edl = image_layout.edl_payload()?;
    let fastboot = fastboot_job(&image_layout, config)?;

    let components = if skip_mcu {
        Vec::new()
    } else {
        component_jobs(
            image_layout.root(),
            &config.tools_root(image_layout.root()),
            &config.components(),
        )?
    };

    run_plan(
        cli,
        config,
        FlashPlan {
            edl,
            fastboot: Some(fastboot),
            components,
        },
    )
}

/// Fastboot command implementation.
pub(crate) fn cmd_fastboot(cli: &Cli, config: &Config) -> Result<()> {
    let image_layout = open_layout(cli, config)?;
    let fastboot = fastboot_job(&image_layout, config)?;
    run_plan(
        cli,
        config,
        FlashPlan {
            fastboot: Some(fastboot),
            ..FlashPlan::default()
        },
    )
}

/// MCU command implementation.
pub(crate) fn cmd_mcu(cli: &Cli, config: &Config, filter: &[String]) -> Result<()> {
    let image_layout = open_layout(cli, config)?;
    let specs = select_components(config.components(), filter)?;
    let components = component_jobs(
        image_layout.root(),
        &config.tools_root(image_layout.root()),
        &specs,
    )?;
    run_plan(
        cli,
        config,
        FlashPlan {
            components,
            ..FlashPlan::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        path
    }

    fn names(specs: &[ComponentSpec]) -> Vec<&str> {
        specs
            .iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    #[test]
    fn test_select_components() {
        let all = select_components(ComponentSpec::defaults(), &[]).unwrap();
        assert_eq!(names(&all), vec!["METER", "IVI"]);

        let ivi = select_components(ComponentSpec::defaults(), &["ivi".to_string()]).unwrap();
        assert_eq!(names(&ivi), vec!["IVI"]);

        // Configured order wins over the filter order.
        let both =
            select_components(ComponentSpec::defaults(), &["IVI".to_string(), "METER".to_string()])
                .unwrap();
        assert_eq!(names(&both), vec!["METER", "IVI"]);
    }

    #[test]
    fn test_unknown_component_is_usage_error() {
        let err = select_components(ComponentSpec::defaults(), &["GATEWAY".to_string()]).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 2);
        assert!(err.to_string().contains("GATEWAY"));
    }

    #[test]
    fn test_component_jobs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let rfp = touch(root, "tools/rfp/rfp-cli");
        let meter = touch(root, "mcu/NCDCMETER_1.0.s19");
        touch(root, "mcu/NCDCIVI_VHSM_1.0.s19");
        let ivi = touch(root, "mcu/NCDCIVI_1.0.s19");

        let jobs = component_jobs(root, root, &ComponentSpec::defaults()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name(), "METER");
        assert_eq!(jobs[0].program(), rfp.as_os_str());
        assert!(
            jobs[0]
                .command_line()
                .contains(&meter.display().to_string())
        );
        assert!(
            jobs[1]
                .command_line()
                .contains(&ivi.display().to_string())
        );
        assert_eq!(jobs[1].prompt(), &PromptPolicy::Ignore);
    }

    #[test]
    fn test_component_jobs_need_programmer() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "mcu/NCDCMETER_1.0.s19");
        assert!(component_jobs(dir.path(), dir.path(), &ComponentSpec::defaults()).is_err());
        assert!(
            component_jobs(dir.path(), dir.path(), &[])
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_fastboot_job_runs_from_script_dir() {
        let dir = TempDir::new().unwrap();
        let script = touch(dir.path(), "release/flash/fastboot_nscdc_std_blank_flash.bat");
        let image_layout = ImageLayout::open(dir.path(), "sail_nor").unwrap();

        let job = fastboot_job(&image_layout, &Config::default()).unwrap();
        assert_eq!(job.cwd(), script.parent());
        assert_eq!(job.timeout(), socflash::process::DEFAULT_JOB_TIMEOUT);
        assert!(job.success_keywords().is_empty());
    }

    #[test]
    fn test_fastboot_job_missing_script() {
        let dir = TempDir::new().unwrap();
        let image_layout = ImageLayout::open(dir.path(), "sail_nor").unwrap();
        let err = fastboot_job(&image_layout, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("flash script"));
    }
}
