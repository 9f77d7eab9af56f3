use crate::{
    config::{ConfigOverrides, PstConfig},
    crash::install_crash_hook,
    local_logger::init_local_logger,
    prelude::*,
};
use clap::{
    Parser,
    builder::{Styles, styling},
};

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Yellow.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Live process dashboard fed by kernel tracers",
    styles = create_styles()
)]
pub struct Cli {
    /// Only list processes whose command contains this text
    #[arg(long = "proc", default_value = "")]
    pub filter: String,

    /// Write logs to the configured log file
    #[arg(long)]
    pub log: bool,

    /// The configuration name to use
    /// If provided, the configuration will be loaded from ~/.config/pst/{config-name}.yaml
    /// Otherwise, loads from ~/.config/pst/config.yaml
    #[arg(long, env = "PST_CONFIG_NAME")]
    pub config_name: Option<String>,

    /// Quiet period before the details of a newly selected process are loaded
    #[arg(long, env = "PST_DEBOUNCE_MS")]
    pub debounce_ms: Option<u64>,

    /// The tracer program to run, bpftrace by default
    #[arg(long, env = "PST_TRACER")]
    pub tracer: Option<String>,

    /// Run the tracer without sudo
    #[arg(long)]
    pub no_sudo: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            tracer_program: self.tracer.clone(),
            debounce_ms: self.debounce_ms,
            no_sudo: self.no_sudo,
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = PstConfig::load_with_override(cli.config_name.as_deref(), &cli.overrides())?;

    init_local_logger(cli.log.then_some(config.ui.log_file.as_path()))?;
    install_crash_hook(config.ui.crash_dump_path.clone());
    info!("pst {} starting", crate::VERSION);

    run_dashboard(config, cli.filter).await
}

#[cfg(target_os = "linux")]
async fn run_dashboard(config: PstConfig, filter: String) -> Result<()> {
    use crate::helpers::sudo::{is_root_user, validate_sudo_access};
    use crate::inspect::DetailLoader;
    use crate::proc_table::{ProcFs, ProcessTable};
    use crate::sources::Sources;
    use std::sync::Arc;

    if config.tracer.sudo && !is_root_user() {
        validate_sudo_access()?;
    }

    let table: Arc<dyn ProcessTable> = Arc::new(ProcFs);
    let sources = Arc::new(Sources::start(&config, Arc::clone(&table))?);
    let loader = DetailLoader::new(
        Arc::clone(&sources),
        table,
        config.ui.ps_args.clone(),
    );

    // Run on its own task so that a panic in the dashboard still stops the tracers
    let ui = tokio::spawn({
        let sources = Arc::clone(&sources);
        async move { crate::ui::run(sources, loader, &config, filter).await }
    });
    let result = match ui.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!(
            "The dashboard crashed, see the crash dump for details"
        )),
        Err(e) => Err(e).context("The dashboard task failed"),
    };

    sources.shutdown().await;
    result
}

#[cfg(not(target_os = "linux"))]
async fn run_dashboard(_config: PstConfig, _filter: String) -> Result<()> {
    bail!("pst relies on /proc and bpftrace, only Linux is supported")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = temp_env::with_vars_unset(
            ["PST_CONFIG_NAME", "PST_DEBOUNCE_MS", "PST_TRACER"],
            || Cli::parse_from(["pst"]),
        );
        assert_eq!(cli.filter, "");
        assert!(!cli.log);
        assert!(cli.config_name.is_none());

        let overrides = cli.overrides();
        assert!(overrides.tracer_program.is_none());
        assert!(overrides.debounce_ms.is_none());
        assert!(!overrides.no_sudo);
    }

    #[test]
    fn test_flags_become_overrides() {
        let cli = temp_env::with_vars_unset(
            ["PST_CONFIG_NAME", "PST_DEBOUNCE_MS", "PST_TRACER"],
            || {
                Cli::parse_from([
                    "pst",
                    "--proc",
                    "nginx",
                    "--log",
                    "--debounce-ms",
                    "100",
                    "--tracer",
                    "/opt/bpftrace",
                    "--no-sudo",
                ])
            },
        );
        assert_eq!(cli.filter, "nginx");
        assert!(cli.log);

        let overrides = cli.overrides();
        assert_eq!(overrides.tracer_program.as_deref(), Some("/opt/bpftrace"));
        assert_eq!(overrides.debounce_ms, Some(100));
        assert!(overrides.no_sudo);
    }

    #[test]
    fn test_config_name_from_env() {
        let cli = temp_env::with_var("PST_CONFIG_NAME", Some("work"), || {
            Cli::parse_from(["pst"])
        });
        assert_eq!(cli.config_name.as_deref(), Some("work"));
    }
}
