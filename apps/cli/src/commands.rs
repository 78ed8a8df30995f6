//! CLI command definitions, routing, and tracing setup.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use importer_core::{ImportSource, JobController};
use importer_shared::{AppConfig, JobConfig, RunReport, init_config, load_config, load_config_from};
use importer_simulated::SimulatedSource;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Importer: recurring, single-flight, multi-step supplier imports.
#[derive(Parser)]
#[command(
    name = "importer",
    version,
    about = "Run the recurring supplier import job against a simulated source.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start the background job and control it from stdin.
    ///
    /// Type `e` to enqueue an import, `s` to start, `c` to stop, `q` to quit.
    Run {
        /// Config file to use instead of ~/.multistep-importer/importer.toml.
        #[arg(long, env = "IMPORTER_CONFIG")]
        config: Option<PathBuf>,

        /// Seconds between periodic imports.
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Maximum concurrent downloads per run.
        #[arg(long)]
        downloads: Option<usize>,

        /// Maximum concurrent parses per run.
        #[arg(long)]
        parsings: Option<usize>,

        /// Exit after this many seconds.
        #[arg(long, default_value = "300")]
        duration_secs: u64,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show {
        /// Config file to read instead of the default location.
        #[arg(long, env = "IMPORTER_CONFIG")]
        config: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
///
/// Logs go to stderr so stdout carries only run reports.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "importer=info",
        1 => "importer=debug",
        _ => "importer=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let log_format = cli.log_format;
    match cli.command {
        Command::Run {
            config,
            interval_secs,
            downloads,
            parsings,
            duration_secs,
        } => {
            let overrides = Overrides {
                interval_secs,
                downloads,
                parsings,
            };
            let app = resolve_config(config.as_deref(), &overrides)?;
            cmd_run(&app, Duration::from_secs(duration_secs), log_format).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show { config } => cmd_config_show(config.as_deref()).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

/// CLI flags that take precedence over the config file.
#[derive(Debug, Default)]
struct Overrides {
    interval_secs: Option<u64>,
    downloads: Option<usize>,
    parsings: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(secs) = self.interval_secs {
            config.job.import_interval_secs = secs;
        }
        if let Some(n) = self.downloads {
            config.job.max_concurrent_downloads = n;
        }
        if let Some(n) = self.parsings {
            config.job.max_concurrent_parsings = n;
        }
    }
}

fn resolve_config(path: Option<&Path>, overrides: &Overrides) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    overrides.apply(&mut config);
    Ok(config)
}

// ---------------------------------------------------------------------------
// Stdin control
// ---------------------------------------------------------------------------

/// One line of keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Enqueue,
    Start,
    Stop,
    Quit,
}

impl FromStr for Control {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e" | "enqueue" => Ok(Self::Enqueue),
            "s" | "start" => Ok(Self::Start),
            "c" | "stop" => Ok(Self::Stop),
            "q" | "quit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{other}' (e, s, c, q)")),
        }
    }
}

/// Forward parsed stdin lines until stdin closes or the receiver is gone.
///
/// Reads on a plain thread: a blocking stdin read cannot be cancelled and
/// must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Control> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Control>() {
                Ok(control) => {
                    if tx.send(control).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{e}"),
            }
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(app: &AppConfig, duration: Duration, log_format: LogFormat) -> Result<()> {
    let job_config = JobConfig::try_from(app)?;
    let source: Arc<dyn ImportSource> = Arc::new(SimulatedSource::new(&app.simulation));
    let job = JobController::new(&job_config, source);
    let mut reports = job.subscribe_reports();
    let mut controls = spawn_stdin_reader();

    info!(
        interval_secs = job_config.import_interval.as_secs(),
        downloads = job_config.max_concurrent_downloads,
        parsings = job_config.max_concurrent_parsings,
        suppliers = app.simulation.supplier_count,
        duration_secs = duration.as_secs(),
        "starting importer (e = enqueue, s = start, c = stop, q = quit)"
    );
    job.start();

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut controls_open = true;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("run duration elapsed");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))?;
                info!("interrupted");
                break;
            }
            report = reports.recv() => match report {
                Ok(report) => print_report(&report, log_format)?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "report output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            control = controls.recv(), if controls_open => match control {
                Some(Control::Enqueue) => {
                    let id = job.enqueue_import();
                    info!(run_id = %id, "import enqueued");
                }
                Some(Control::Start) => {
                    if !job.start() {
                        info!("job is already running");
                    }
                }
                Some(Control::Stop) => job.stop().await,
                Some(Control::Quit) => break,
                None => controls_open = false,
            },
        }
    }

    job.stop().await;

    // Print reports of runs that ended during shutdown.
    while let Ok(report) = reports.try_recv() {
        print_report(&report, log_format)?;
    }
    Ok(())
}

fn print_report(report: &RunReport, log_format: LogFormat) -> Result<()> {
    match log_format {
        LogFormat::Json => println!("{}", serde_json::to_string(report)?),
        LogFormat::Text => println!("{}", format_report(report)),
    }
    Ok(())
}

/// One-line human summary of a finished run.
fn format_report(report: &RunReport) -> String {
    let head = format!("run {:>4} ({}) {}", report.id, report.origin, report.state);
    if report.is_completed() {
        let took = (report.finished_at - report.started_at)
            .to_std()
            .unwrap_or_default();
        format!(
            "{head}: {} records in {:.1}s",
            report.records_saved,
            took.as_secs_f64()
        )
    } else {
        format!("{head}: {}", report.error.as_deref().unwrap_or("cancelled"))
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path, &Overrides::default())?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
