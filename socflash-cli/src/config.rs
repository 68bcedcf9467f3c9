//! Configuration file support for socflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SOCFLASH_*)
//! 3. Local config file (./socflash.toml)
//! 4. Global config file (~/.config/socflash/config.toml)
//!
//! `--config PATH` replaces 3 and 4 with a single file.

use {
    crate::CliError,
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    socflash::{
        ComponentSpec, EdlTools, MonitorSettings, OrchestratorSettings, PortRange, RetryPolicy,
        VerifierSettings, layout,
    },
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "socflash.toml";

/// Image and tool locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Images root directory.
    pub images: Option<PathBuf>,
    /// Directory searched for the MCU flash programmer (defaults to the images root).
    pub tools: Option<PathBuf>,
    /// Name of the EDL payload folder inside the images root.
    pub edl_folder: Option<String>,
}

/// Serial console settings for the fastboot trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSection {
    /// Port name prefix (e.g. "COM" or "/dev/ttyUSB").
    pub prefix: Option<String>,
    /// First port number scanned.
    pub first: Option<u32>,
    /// Last port number scanned.
    pub last: Option<u32>,
    /// Seconds to wait for the fastboot token.
    pub boot_timeout_secs: Option<u64>,
    /// Seconds between periodic resets.
    pub reset_interval_secs: Option<u64>,
    /// Reset command; `\r\n` is appended.
    pub reset_command: Option<String>,
}

/// Fastboot tool and flash script settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FastbootSection {
    /// `fastboot` executable.
    pub tool: Option<PathBuf>,
    /// Flash script names, in order of preference.
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Output keywords required for the script to count as successful.
    #[serde(default)]
    pub success_keywords: Vec<String>,
    /// Overall budget for the flash script, in seconds.
    pub timeout_secs: Option<u64>,
    /// Verification attempts.
    pub verify_attempts: Option<u32>,
}

/// EDL tool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdlSection {
    /// `QSaharaServer` executable.
    pub sahara: Option<PathBuf>,
    /// `fh_loader` executable.
    pub fh_loader: Option<PathBuf>,
    /// Target storage name.
    pub memory_name: Option<String>,
}

/// Retry delays and caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    /// Seconds between retries of a failed phase.
    pub delay_secs: Option<u64>,
    /// Seconds between USB polls while waiting for the device.
    pub poll_secs: Option<u64>,
    /// Attempt cap while waiting for the device.
    pub device_max_attempts: Option<u32>,
    /// Attempt cap for EDL flashing.
    pub edl_max_attempts: Option<u32>,
    /// Attempt cap for the fastboot phases.
    pub fastboot_max_attempts: Option<u32>,
    /// Attempt cap per MCU component.
    pub component_max_attempts: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Paths.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Serial console.
    #[serde(default)]
    pub serial: SerialSection,
    /// Fastboot.
    #[serde(default)]
    pub fastboot: FastbootSection,
    /// EDL tools.
    #[serde(default)]
    pub edl: EdlSection,
    /// Retry behaviour.
    #[serde(default)]
    pub retry: RetrySection,
    /// MCU components in flashing order; empty means the built-in list.
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentSpec>,
}

fn pick<T>(slot: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *slot = other;
    }
}

fn pick_list<T>(slot: &mut Vec<T>, other: Vec<T>) {
    if !other.is_empty() {
        *slot = other;
    }
}

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// A missing file is a configuration error; an unparsable one warns and
    /// falls back to defaults like the implicit files do.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Err(CliError::Config(format!("Config file not found: {}", path.display())).into());
        }
        Ok(Self::load_from_file(path).unwrap_or_else(|| {
            warn!("Using default configuration");
            Self::default()
        }))
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn parse(path: &Path, content: &str) -> Option<Self> {
        match toml::from_str(content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "socflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        pick(&mut self.paths.images, other.paths.images);
        pick(&mut self.paths.tools, other.paths.tools);
        pick(&mut self.paths.edl_folder, other.paths.edl_folder);

        pick(&mut self.serial.prefix, other.serial.prefix);
        pick(&mut self.serial.first, other.serial.first);
        pick(&mut self.serial.last, other.serial.last);
        pick(&mut self.serial.boot_timeout_secs, other.serial.boot_timeout_secs);
        pick(&mut self.serial.reset_interval_secs, other.serial.reset_interval_secs);
        pick(&mut self.serial.reset_command, other.serial.reset_command);

        pick(&mut self.fastboot.tool, other.fastboot.tool);
        pick_list(&mut self.fastboot.scripts, other.fastboot.scripts);
        pick_list(&mut self.fastboot.success_keywords, other.fastboot.success_keywords);
        pick(&mut self.fastboot.timeout_secs, other.fastboot.timeout_secs);
        pick(&mut self.fastboot.verify_attempts, other.fastboot.verify_attempts);

        pick(&mut self.edl.sahara, other.edl.sahara);
        pick(&mut self.edl.fh_loader, other.edl.fh_loader);
        pick(&mut self.edl.memory_name, other.edl.memory_name);

        pick(&mut self.retry.delay_secs, other.retry.delay_secs);
        pick(&mut self.retry.poll_secs, other.retry.poll_secs);
        pick(&mut self.retry.device_max_attempts, other.retry.device_max_attempts);
        pick(&mut self.retry.edl_max_attempts, other.retry.edl_max_attempts);
        pick(&mut self.retry.fastboot_max_attempts, other.retry.fastboot_max_attempts);
        pick(&mut self.retry.component_max_attempts, other.retry.component_max_attempts);

        pick_list(&mut self.components, other.components);
    }

    /// Images root: the CLI/env value, else `[paths] images`.
    pub fn images_root(&self, cli_value: Option<&Path>) -> anyhow::Result<PathBuf> {
        cli_value
            .map(Path::to_path_buf)
            .or_else(|| {
                self.paths
                    .images
                    .clone()
            })
            .ok_or_else(|| {
                CliError::Config(
                    "No images directory configured; pass --images or set [paths] images".to_string(),
                )
                .into()
            })
    }

    /// Directory searched for the MCU programmer.
    pub fn tools_root(&self, images_root: &Path) -> PathBuf {
        self.paths
            .tools
            .clone()
            .unwrap_or_else(|| images_root.to_path_buf())
    }

    /// Name of the EDL payload folder.
    pub fn edl_folder(&self) -> &str {
        self.paths
            .edl_folder
            .as_deref()
            .unwrap_or(layout::DEFAULT_EDL_FOLDER)
    }

    /// Serial port range scanned for the console.
    pub fn port_range(&self) -> PortRange {
        let default = PortRange::default();
        PortRange::new(
            self.serial
                .prefix
                .clone()
                .unwrap_or(default.prefix),
            self.serial
                .first
                .unwrap_or(default.first),
            self.serial
                .last
                .unwrap_or(default.last),
        )
    }

    /// Serial boot monitor settings.
    pub fn monitor_settings(&self) -> MonitorSettings {
        let mut settings = MonitorSettings::default();
        if let Some(timeout) = secs(self.serial.boot_timeout_secs) {
            settings.total_timeout = timeout;
        }
        if let Some(interval) = secs(self.serial.reset_interval_secs) {
            settings.reset_interval = interval;
        }
        if let Some(command) = &self.serial.reset_command {
            settings.reset_command = format!("{}\r\n", command.trim_end()).into_bytes();
        }
        settings
    }

    /// `fastboot` executable.
    pub fn fastboot_tool(&self) -> PathBuf {
        self.fastboot
            .tool
            .clone()
            .unwrap_or_else(|| PathBuf::from("fastboot"))
    }

    /// Flash script names, in order of preference.
    pub fn fastboot_scripts(&self) -> Vec<String> {
        if self
            .fastboot
            .scripts
            .is_empty()
        {
            layout::FASTBOOT_SCRIPTS
                .iter()
                .map(ToString::to_string)
                .collect()
        } else {
            self.fastboot
                .scripts
                .clone()
        }
    }

    /// Flash script budget.
    pub fn fastboot_timeout(&self) -> Duration {
        secs(self.fastboot.timeout_secs).unwrap_or(socflash::process::DEFAULT_JOB_TIMEOUT)
    }

    /// Fastboot verification settings.
    pub fn verifier_settings(&self) -> VerifierSettings {
        let mut settings = VerifierSettings::default();
        if let Some(attempts) = self.fastboot.verify_attempts {
            settings.max_attempts = attempts.max(1);
        }
        settings
    }

    /// Command-line EDL tools.
    pub fn edl_tools(&self) -> EdlTools {
        let mut tools = EdlTools::default();
        if let Some(sahara) = &self.edl.sahara {
            tools.sahara = sahara.as_os_str().to_owned();
        }
        if let Some(fh_loader) = &self.edl.fh_loader {
            tools.fh_loader = fh_loader.as_os_str().to_owned();
        }
        if let Some(memory) = &self.edl.memory_name {
            tools.memory_name.clone_from(memory);
        }
        tools
    }

    /// Retry policies for the orchestrator.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let defaults = OrchestratorSettings::default();
        let policy = |base: RetryPolicy, delay: Option<u64>, cap: Option<u32>| {
            let policy = RetryPolicy::unbounded(secs(delay).unwrap_or(base.delay));
            match cap {
                Some(max) => policy.with_max_attempts(max),
                None => policy,
            }
        };
        let retry = &self.retry;
        OrchestratorSettings {
            device_poll: policy(defaults.device_poll, retry.poll_secs, retry.device_max_attempts),
            edl_retry: policy(defaults.edl_retry, retry.delay_secs, retry.edl_max_attempts),
            fastboot_retry: policy(
                defaults.fastboot_retry,
                retry.delay_secs,
                retry.fastboot_max_attempts,
            ),
            component_retry: policy(
                defaults.component_retry,
                retry.delay_secs,
                retry.component_max_attempts,
            ),
            post_trigger_delay: defaults.post_trigger_delay,
        }
    }

    /// MCU components in flashing order.
    pub fn components(&self) -> Vec<ComponentSpec> {
        if self
            .components
            .is_empty()
        {
            ComponentSpec::defaults()
        } else {
            self.components
                .clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(content: &str) -> Config {
        Config::parse(Path::new("test.toml"), content).unwrap()
    }

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.paths.images.is_none());
        assert_eq!(config.edl_folder(), "sail_nor");
        assert_eq!(config.fastboot_tool(), PathBuf::from("fastboot"));
        assert_eq!(config.fastboot_scripts().len(), 2);
        assert_eq!(config.verifier_settings(), VerifierSettings::default());
        assert_eq!(config.monitor_settings(), MonitorSettings::default());
        assert_eq!(config.components(), ComponentSpec::defaults());
        assert_eq!(config.orchestrator_settings(), OrchestratorSettings::default());
    }

    #[test]
    fn test_images_root_priority() {
        let mut config = Config::default();
        assert!(config.images_root(None).is_err());

        config.paths.images = Some(PathBuf::from("/from/config"));
        assert_eq!(config.images_root(None).unwrap(), PathBuf::from("/from/config"));
        assert_eq!(
            config
                .images_root(Some(Path::new("/from/cli")))
                .unwrap(),
            PathBuf::from("/from/cli")
        );
    }

    #[test]
    fn test_missing_images_root_is_config_error() {
        let err = Config::default()
            .images_root(None)
            .unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 3);
    }

    #[test]
    fn test_tools_root_defaults_to_images() {
        let mut config = Config::default();
        assert_eq!(config.tools_root(Path::new("/img")), PathBuf::from("/img"));
        config.paths.tools = Some(PathBuf::from("/opt/renesas"));
        assert_eq!(config.tools_root(Path::new("/img")), PathBuf::from("/opt/renesas"));
    }

    // ---- Parsing ----

    #[test]
    fn test_parse_full_config() {
        let config = parse(
            r#"
[paths]
images = "D:/release/images"
edl_folder = "nor"

[serial]
prefix = "COM"
first = 3
last = 9
boot_timeout_secs = 90
reset_command = "reset -f"

[fastboot]
scripts = ["flash_all.bat"]
success_keywords = ["finished. total time"]
verify_attempts = 5

[edl]
memory_name = "ufs"

[retry]
delay_secs = 2
fastboot_max_attempts = 4

[[component]]
name = "METER"
extension = "s19"
include = ["NCDCMETER"]
args = ["-file", "{image}"]
"#,
        );

        assert_eq!(config.edl_folder(), "nor");
        assert_eq!(config.port_range(), PortRange::new("COM", 3, 9));
        let monitor = config.monitor_settings();
        assert_eq!(monitor.total_timeout, Duration::from_secs(90));
        assert_eq!(monitor.reset_command, b"reset -f\r\n");
        assert_eq!(config.fastboot_scripts(), vec!["flash_all.bat"]);
        assert_eq!(config.verifier_settings().max_attempts, 5);
        assert_eq!(config.edl_tools().memory_name, "ufs");

        let retry = config.orchestrator_settings();
        assert_eq!(retry.fastboot_retry.delay, Duration::from_secs(2));
        assert_eq!(retry.fastboot_retry.max_attempts, Some(4));
        assert_eq!(retry.component_retry.max_attempts, None);
        assert_eq!(retry.device_poll, OrchestratorSettings::default().device_poll);

        let components = config.components();
        assert_eq!(components.len(), 1);
        assert!(components[0].exclude.is_empty());
        assert_eq!(components[0].args_for(Path::new("a.s19")), vec!["-file", "a.s19"]);
    }

    #[test]
    fn test_partial_serial_range_keeps_defaults() {
        let config = parse("[serial]\nlast = 4\n");
        let range = config.port_range();
        assert_eq!(range.last, 4);
        assert_eq!(range.prefix, PortRange::default().prefix);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(Config::parse(Path::new("bad.toml"), "invalid toml [[[").is_none());
    }

    // ---- Merge ----

    #[test]
    fn test_merge_overrides_set_values_only() {
        let mut base = parse("[paths]\nimages = \"/a\"\ntools = \"/t\"\n[fastboot]\nscripts = [\"x.bat\"]\n");
        base.merge(parse("[paths]\nimages = \"/b\"\n"));

        assert_eq!(base.paths.images, Some(PathBuf::from("/b")));
        assert_eq!(base.paths.tools, Some(PathBuf::from("/t")));
        assert_eq!(base.fastboot_scripts(), vec!["x.bat"]);
    }

    // ---- File loading ----

    #[test]
    fn test_load_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[paths]\nimages = \"/bench/images\"").unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.paths.images, Some(PathBuf::from("/bench/images")));
    }

    #[test]
    fn test_load_from_missing_path_is_config_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/socflash.toml")).unwrap_err();
        assert_eq!(crate::exit_code_for(&err), 3);
    }

    #[test]
    fn test_load_from_unparsable_path_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml [[[").unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert!(config.paths.images.is_none());
    }
}
