use std::{env, fs, path::PathBuf, time::Duration};

use crate::prelude::*;
use nestify::nest;
use serde::{Deserialize, Serialize};

nest! {
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]*
    #[serde(rename_all = "kebab-case", default)]*
    /// Configuration for pst.
    ///
    /// Read once at startup from `~/.config/pst/config.yaml` (following the XDG Base Directory
    /// Specification), overridden by command line flags, then handed to every component that
    /// needs it. Every key is optional.
    pub struct PstConfig {
        pub tracer: pub struct TracerConfig {
            /// The tracing program, invoked as `<program> -e <script>`
            pub program: String,
            /// Value of `BPFTRACE_STRLEN`
            pub strlen: usize,
            /// Run the tracer through `sudo` when not root
            pub sudo: bool,
            /// Capacity of each tracer event channel
            pub channel_capacity: usize,
        },
        pub ui: pub struct UiConfig {
            /// Quiet period after the last selection change before the detail panes refresh
            pub debounce_ms: u64,
            /// `-o` argument of `ps` for the info pane
            pub ps_args: String,
            /// Where to write diagnostics when pst crashes
            pub crash_dump_path: PathBuf,
            /// Log file used when logging is enabled
            pub log_file: PathBuf,
        },
        pub cache: pub struct CacheConfig {
            /// How often exited processes are dropped from the caches, 0 disables reaping
            pub reap_interval_secs: u64,
            /// Maximum number of opens remembered per process, 0 means unbounded
            pub open_log_capacity: usize,
        },
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: "bpftrace".into(),
            strlen: proctrace::programs::DEFAULT_STRLEN,
            sudo: true,
            channel_capacity: 500,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            ps_args: "pid,ppid,%cpu,%mem,lstart,user,command".into(),
            crash_dump_path: PathBuf::from("crashdump.txt"),
            log_file: PathBuf::from("pst.log"),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 30,
            open_log_capacity: 1024,
        }
    }
}

impl Default for PstConfig {
    fn default() -> Self {
        Self {
            tracer: TracerConfig::default(),
            ui: UiConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Values given on the command line, they take precedence over the configuration file
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub tracer_program: Option<String>,
    pub debounce_ms: Option<u64>,
    pub no_sudo: bool,
}

/// Get the path to the configuration file, following the XDG Base Directory Specification
/// at https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
///
/// If config_name is None, returns ~/.config/pst/config.yaml (default)
/// If config_name is Some, returns ~/.config/pst/{config_name}.yaml
fn get_configuration_file_path(config_name: Option<&str>) -> PathBuf {
    let config_dir = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from(".config"))
        });
    let config_dir = config_dir.join("pst");

    match config_name {
        Some(name) => config_dir.join(format!("{name}.yaml")),
        None => config_dir.join("config.yaml"),
    }
}

impl PstConfig {
    /// Load the configuration. If it does not exist, return a default configuration.
    pub fn load_with_override(
        config_name: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<Self> {
        let config_path = get_configuration_file_path(config_name);

        let mut config = match fs::read(&config_path) {
            Ok(config_str) => {
                let config: PstConfig = serde_yaml::from_slice(&config_str).context(format!(
                    "Failed to parse pst config at {}",
                    config_path.display()
                ))?;
                debug!("Config loaded from {}", config_path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                PstConfig::default()
            }
            Err(e) => bail!("Failed to load config: {e}"),
        };

        if let Some(program) = &overrides.tracer_program {
            config.tracer.program = program.clone();
        }
        if let Some(debounce_ms) = overrides.debounce_ms {
            config.ui.debounce_ms = debounce_ms;
        }
        if overrides.no_sudo {
            config.tracer.sudo = false;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.tracer.channel_capacity > 0,
            "tracer.channel-capacity must be greater than 0"
        );
        ensure!(self.tracer.strlen > 0, "tracer.strlen must be greater than 0");
        ensure!(!self.ui.ps_args.is_empty(), "ui.ps-args must not be empty");
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.ui.debounce_ms)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.cache.reap_interval_secs > 0)
            .then(|| Duration::from_secs(self.cache.reap_interval_secs))
    }
}
