//! Serverack: start servers, wait for their ports, run a command, clean up.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with an optional `serverack.toml`, and hands the
//! resulting servers and target command to the `Orchestrator`. The process
//! exits with the target command's exit code, or with a sentinel when the
//! servers could not be brought up.

mod config;
mod error;
mod orchestrator;
mod output;
mod policy;
mod probe;
mod process;
mod report;
mod signal;
mod supervisor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::LaunchError;
use crate::orchestrator::{Orchestrator, OrchestratorOptions, DEFAULT_HOST, DEFAULT_SERVER_TIMEOUT};
use crate::output::DEFAULT_MAX_LINES;
use crate::policy::AllowlistPolicy;
use crate::probe::{ReadinessProbe, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::process::ServerSpec;
use crate::report::OrchestrationResult;
use crate::supervisor::{ProcessSupervisor, DEFAULT_GRACE_PERIOD};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "serverack",
    version,
    about = "Run a command against one or more servers, then stop them",
    styles = help_styles(),
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Server command (can be repeated; must match --port count).
    #[arg(long = "server", value_name = "CMD")]
    servers: Vec<String>,
    /// Port for each server, in the same order as --server.
    #[arg(long = "port", value_name = "PORT")]
    ports: Vec<u16>,
    /// Seconds each server gets to accept connections (default: 30).
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Host to probe for readiness (default: localhost).
    #[arg(long)]
    host: Option<String>,
    /// Time a server gets to exit after SIGTERM before it is killed (ms).
    #[arg(long, value_name = "MS")]
    grace_ms: Option<u64>,
    /// Interval between readiness probes (ms).
    #[arg(long, value_name = "MS")]
    poll_ms: Option<u64>,
    /// Additional executable permitted in server commands (can be repeated).
    #[arg(long, value_name = "EXE")]
    allow: Vec<String>,
    /// Path to serverack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any serverack.toml in the current directory.
    #[arg(long, conflicts_with = "config")]
    no_config: bool,
    /// Write a JSON report of the run to PATH ("-" for stderr).
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
    /// Command to run once all servers are ready: -- <cmd> [args...]
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    let code = run(&cli).await;
    std::process::exit(code);
}

fn init_logging(quiet: bool) {
    let default = if quiet {
        "serverack=warn"
    } else {
        "serverack=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

async fn run(cli: &Cli) -> i32 {
    let settings = match RunSettings::load(cli) {
        Ok(settings) => settings,
        Err(err) => {
            let err = LaunchError::Configuration(format!("{:#}", err));
            error!("{}", err);
            let result = OrchestrationResult::rejected(&err, &[]);
            emit_report(cli.report.as_deref(), &result);
            return result.exit_code;
        }
    };

    let policy = AllowlistPolicy::default().with_additional(settings.allow.iter().cloned());
    let orchestrator = Orchestrator::new(
        policy,
        ProcessSupervisor::new(settings.max_lines),
        ReadinessProbe::new(settings.poll_interval, DEFAULT_CONNECT_TIMEOUT),
        OrchestratorOptions {
            host: settings.host.clone(),
            grace_period: settings.grace_period,
        },
    );
    let result = orchestrator
        .run(&settings.specs, &settings.command, settings.timeout)
        .await;
    debug!(
        exit_code = result.exit_code,
        failure = ?result.failure_kind(),
        warnings = result.warnings.len(),
        "run finished"
    );
    emit_report(settings.report.as_deref(), &result);
    result.exit_code
}

// A report that cannot be written is logged; it never changes the exit code.
fn emit_report(path: Option<&Path>, result: &OrchestrationResult) {
    if let Some(path) = path {
        if let Err(err) = result.write_json(path) {
            error!("{:#}", err);
        }
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("serverack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    specs: Vec<ServerSpec>,
    command: Vec<String>,
    timeout: Duration,
    host: String,
    grace_period: Duration,
    poll_interval: Duration,
    allow: Vec<String>,
    max_lines: usize,
    report: Option<PathBuf>,
}

impl RunSettings {
    fn load(cli: &Cli) -> Result<Self> {
        let config = if cli.no_config {
            Config::default()
        } else {
            match cli.config.clone().or_else(default_config_path) {
                Some(path) => config::load_config(&path)?,
                None => Config::default(),
            }
        };
        Self::from_cli(cli, config)
    }

    fn from_cli(cli: &Cli, config: Config) -> Result<Self> {
        let mut specs = config
            .servers
            .iter()
            .map(|server| ServerSpec::new(server.command.clone(), server.port))
            .collect::<Result<Vec<_>, _>>()?;
        specs.extend(ServerSpec::pair(&cli.servers, &cli.ports)?);
        if specs.is_empty() {
            return Err(LaunchError::Configuration(
                "no servers specified (use --server CMD --port PORT)".into(),
            )
            .into());
        }

        let mut command = cli.command.clone();
        if command.first().map(String::as_str) == Some("--") {
            command.remove(0);
        }
        if command.is_empty() {
            return Err(LaunchError::Configuration("no command specified to run".into()).into());
        }

        let timeout = cli
            .timeout
            .or(config.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SERVER_TIMEOUT);
        let host = cli
            .host
            .clone()
            .or(config.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let grace_period = cli
            .grace_ms
            .or(config.grace_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD);
        let poll_interval = cli
            .poll_ms
            .or(config.poll_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(LaunchError::Configuration(
                "poll interval must be greater than 0ms".into(),
            )
            .into());
        }
        let mut allow = config.allow.unwrap_or_default();
        allow.extend(cli.allow.iter().cloned());

        Ok(Self {
            specs,
            command,
            timeout,
            host,
            grace_period,
            poll_interval,
            allow,
            max_lines: config.max_lines.unwrap_or(DEFAULT_MAX_LINES),
            report: cli.report.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("serverack").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn pairs_servers_with_ports_in_order() {
        let cli = parse(&[
            "--server",
            "cd backend && python server.py",
            "--port",
            "3000",
            "--server",
            "cd frontend && npm run dev",
            "--port",
            "5173",
            "--",
            "python",
            "test.py",
        ]);
        let settings = RunSettings::from_cli(&cli, Config::default()).unwrap();
        assert_eq!(settings.specs.len(), 2);
        assert_eq!(settings.specs[0].port(), 3000);
        assert_eq!(settings.specs[1].command(), "cd frontend && npm run dev");
        assert_eq!(settings.command, vec!["python", "test.py"]);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let cli = parse(&[
            "--server", "npm start", "--server", "npm run api", "--port", "3000", "--", "true",
        ]);
        let err = RunSettings::from_cli(&cli, Config::default()).unwrap_err();
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn missing_command_is_rejected() {
        let cli = parse(&["--server", "npm start", "--port", "3000"]);
        let err = RunSettings::from_cli(&cli, Config::default()).unwrap_err();
        assert!(err.to_string().contains("no command specified"));
    }

    #[test]
    fn cli_values_override_config() {
        let config: Config = toml::from_str(
            r#"
timeout_secs = 90
host = "127.0.0.1"
grace_ms = 250
allow = ["bundle"]

[[server]]
command = "bundle exec rails server"
port = 3000
"#,
        )
        .unwrap();
        let cli = parse(&[
            "--server", "npm start", "--port", "5173", "--timeout", "10", "--allow", "rails",
            "--", "npx", "playwright", "test",
        ]);
        let settings = RunSettings::from_cli(&cli, config).unwrap();
        assert_eq!(settings.specs.len(), 2);
        assert_eq!(settings.specs[0].command(), "bundle exec rails server");
        assert_eq!(settings.specs[1].port(), 5173);
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.grace_period, Duration::from_millis(250));
        assert_eq!(settings.allow, vec!["bundle", "rails"]);
        assert_eq!(settings.command, vec!["npx", "playwright", "test"]);
    }

    #[test]
    fn zero_port_is_a_configuration_error() {
        let cli = parse(&["--server", "npm start", "--port", "0", "--", "true"]);
        assert!(RunSettings::from_cli(&cli, Config::default()).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cli = parse(&[
            "--server", "npm start", "--port", "3000", "--poll-ms", "0", "--", "true",
        ]);
        let err = RunSettings::from_cli(&cli, Config::default()).unwrap_err();
        assert!(err.to_string().contains("poll interval"));

        let config: Config = toml::from_str("poll_ms = 0").unwrap();
        let cli = parse(&["--server", "npm start", "--port", "3000", "--", "true"]);
        assert!(RunSettings::from_cli(&cli, config).is_err());
    }
}
