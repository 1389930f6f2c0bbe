use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use vdapulse::alert::Notifier;
use vdapulse::config::TargetReloader;
use vdapulse::dashboard::{run_dashboard, ThresholdBook};
use vdapulse::report::{build_report, discover_logs, read_samples, render_report, ReportError, ReportFilter};
use vdapulse::writer::DEFAULT_PREFIX;
use vdapulse::{
    api, utils, Aggregator, CheckKind, Collector, LogOutput, LogWriter, MonitorConfig, NetworkProbe, ScheduleSettings,
    Scheduler, Target,
};

const RELOAD_EVERY: Duration = Duration::from_secs(10);
const NOTIFIER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vdapulse", version, about = "TCP/DNS reachability prober with rolling health stats")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Minimum log level (RUST_LOG directives still apply)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe targets continuously (default)
    Run(RunArgs),
    /// Summarize a CSV log
    Report(ReportArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Seconds between probe cycles
    #[arg(long)]
    interval: Option<u64>,
    /// Per-probe timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Maximum probes in flight
    #[arg(long)]
    concurrency: Option<usize>,
    /// Write every sample to this file (disables daily rotation)
    #[arg(long, conflicts_with = "csv_dir")]
    csv: Option<PathBuf>,
    /// Directory for daily rotated logs
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    /// Serve rolling stats over HTTP on this port
    #[arg(long)]
    api_port: Option<u16>,
    /// Show the live terminal table
    #[arg(long)]
    dashboard: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrency = concurrency;
        }
        if let Some(path) = &self.csv {
            config.output = LogOutput::Fixed { path: path.clone() };
        }
        if let Some(dir) = &self.csv_dir {
            config.output = match std::mem::take(&mut config.output) {
                LogOutput::Rotating { prefix, suffix, .. } => LogOutput::Rotating { dir: dir.clone(), prefix, suffix },
                LogOutput::Fixed { .. } => {
                    LogOutput::Rotating { dir: dir.clone(), prefix: DEFAULT_PREFIX.to_string(), suffix: None }
                }
            };
        }
        if self.api_port.is_some() {
            config.api_port = self.api_port;
        }
    }
}

#[derive(Args)]
struct ReportArgs {
    /// Explicit CSV file; otherwise the newest matching log in --dir
    #[arg(long)]
    csv: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    dir: PathBuf,
    /// UTC date of the log to read (YYYY-MM-DD)
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,
    #[arg(long)]
    suffix: Option<String>,
    /// Only samples from the last N minutes
    #[arg(long)]
    minutes: Option<i64>,
    /// Only one port or query type
    #[arg(long)]
    check: Option<CheckKind>,
    /// Only these endpoints (repeatable)
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,
    /// Only these destination addresses, e.g. DNS resolvers (repeatable)
    #[arg(long = "dst", visible_alias = "resolver")]
    destinations: Vec<IpAddr>,
    /// Number of offending routes to list
    #[arg(long, default_value_t = 10)]
    top: usize,
    #[arg(long, default_value_t = 99.0)]
    ok_threshold: f64,
    #[arg(long, default_value_t = 50.0)]
    p95_threshold_ms: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ansi = utils::setup_console();
    colored::control::set_override(ansi);
    let command = cli.command.unwrap_or_else(|| Command::Run(RunArgs::default()));

    // The dashboard owns stdout; only warnings and errors reach stderr meanwhile.
    let level = match &command {
        Command::Run(args) if args.dashboard => cli.log_level.min(Level::WARN),
        _ => cli.log_level,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();

    match command {
        Command::Run(args) => run(&cli.config, args, ansi).await,
        Command::Report(args) => report(args),
    }
}

async fn run(config_path: &Path, args: RunArgs, ansi: bool) -> Result<()> {
    let mut config =
        MonitorConfig::load(config_path).with_context(|| format!("Failed to load {}", config_path.display()))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let targets = config.build_targets().context("Failed to build target list")?;
    if let LogOutput::Rotating { suffix: suffix @ None, .. } = &mut config.output {
        *suffix = MonitorConfig::shared_tcp_port(&targets).map(|port| port.to_string());
    }
    info!(targets = targets.len(), output = ?config.output, "Configuration loaded");

    let cancel = CancellationToken::new();
    let (targets_tx, targets_rx) = watch::channel(Arc::<[Target]>::from(targets));
    let aggregator = Arc::new(Aggregator::new(config.window_capacity));

    let (alert_tx, notifier) = match config.webhook_url.clone() {
        Some(url) => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(tokio::spawn(Notifier::new(url).run(rx))))
        }
        None => (None, None),
    };

    let writer = LogWriter::new(config.output.clone())
        .with_fsync(config.fsync)
        .with_degraded_after(config.degraded_after);
    let collector = Collector::spawn(writer, Arc::clone(&aggregator), alert_tx);

    let settings = ScheduleSettings {
        interval: config.interval(),
        timeout: config.timeout(),
        max_concurrency: config.max_concurrency,
        retries: config.retries,
    };
    let scheduler = Scheduler::new(NetworkProbe::new(), targets_rx, settings)?;
    let scheduler_task = {
        let sink = collector.sender();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            scheduler
                .run(cancel, move |sample| {
                    let _ = sink.send(sample);
                })
                .await
        })
    };

    let reloader = tokio::spawn(TargetReloader::new(config.clone()).watch(targets_tx, RELOAD_EVERY, cancel.clone()));

    if let Some(port) = config.api_port {
        let aggregator = Arc::clone(&aggregator);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_server(port, aggregator, cancel).await {
                error!("Stats API failed: {}", e);
            }
        });
    }

    if args.dashboard {
        if ansi {
            tokio::spawn(run_dashboard(Arc::clone(&aggregator), config.dashboard.clone(), cancel.clone()));
        } else {
            warn!("Terminal does not support ANSI escapes; dashboard disabled");
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received. Finishing in-flight probes...");
    cancel.cancel();

    match scheduler_task.await {
        Ok(ticks) => info!(ticks, "Scheduler finished"),
        Err(e) => error!("Scheduler task failed: {}", e),
    }
    let _ = reloader.await;
    let processed = collector.shutdown().await;
    info!(samples = processed, "Log closed");

    if let Some(notifier) = notifier {
        if tokio::time::timeout(NOTIFIER_DRAIN, notifier).await.is_err() {
            warn!("Pending alerts dropped at shutdown");
        }
    }
    Ok(())
}

fn report(args: ReportArgs) -> Result<()> {
    let path = match &args.csv {
        Some(path) => path.clone(),
        None => pick_log(&args)?,
    };
    info!(path = %path.display(), "Reading samples");

    let loaded = read_samples(&path)?;
    if loaded.skipped > 0 {
        warn!(skipped = loaded.skipped, "Some rows could not be parsed");
    }

    let filter = ReportFilter {
        since: args.minutes.map(|m| Utc::now() - chrono::Duration::minutes(m)),
        check: args.check,
        endpoints: args.endpoints.clone(),
        destinations: args.destinations.clone(),
    };
    let report = match build_report(&loaded.samples, &filter) {
        Ok(report) => report,
        Err(ReportError::NoSamples) => bail!("No samples in the selected window; widen --minutes or check --date"),
        Err(e) => return Err(e.into()),
    };

    let book = ThresholdBook::global(args.ok_threshold, args.p95_threshold_ms);
    println!("Dataset: {}", path.display());
    print!("{}", render_report(&report, &book, args.top));
    Ok(())
}

fn pick_log(args: &ReportArgs) -> Result<PathBuf> {
    let logs = discover_logs(&args.dir, &args.prefix)?;
    logs.into_iter()
        .filter(|log| args.date.is_none_or(|date| log.date == date))
        .find(|log| args.suffix.is_none() || log.suffix == args.suffix)
        .map(|log| log.path)
        .ok_or_else(|| ReportError::NoLogs { dir: args.dir.clone(), prefix: args.prefix.clone() }.into())
}
