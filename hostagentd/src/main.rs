use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use hostagentd::config::{self, AgentConfig, MetadataIdentitySource};
use hostagentd::events::EventLog;
use hostagentd::health::HealthProbe;
use hostagentd::listener::{Listener, StatusCell, WorkCounters};
use hostagentd::processor::RequestProcessor;
use hostagentd::provision::NoopProvisioner;
use hostagentd::tasks::{standard_registry, HttpConfigFetcher, TaskContext};
use hostagentd::AGENT_VERSION;

#[derive(Parser, Debug)]
#[command(name = "hostagentd", version, about = "Host-resident deployment agent")]
struct Cli {
    /// Directory holding the control and task channel sockets.
    #[arg(long, default_value = "/tmp/hostagent")]
    channel_dir: PathBuf,

    /// Deployment id; the control socket is named `<id>.sock`.
    #[arg(long, default_value = "hostagent")]
    deployment_id: String,

    /// Optional local configuration document, used until the control
    /// plane delivers the bootstrap configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Event log location.
    #[arg(long, default_value = "/var/log/hostagentd/events.jsonl")]
    events: PathBuf,

    /// Host metadata endpoint used to reverify identity.
    #[arg(long, default_value = "http://169.254.169.254/latest/meta-data")]
    metadata_url: String,

    /// Seconds between maintenance passes.
    #[arg(long, default_value_t = 60)]
    maintenance_interval: u64,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.debug { "debug" } else { "info" })
        .with_writer(std::io::stderr)
        .init();

    info!(version = AGENT_VERSION, "starting host agent");

    if let Some(parent) = cli.events.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let events = Arc::new(EventLog::open(&cli.events)?);

    let initial = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            AgentConfig::new(&raw)?
        }
        None => AgentConfig::default(),
    };
    let config = config::shared(initial);

    let provisioner = Arc::new(NoopProvisioner);
    let fetcher = Arc::new(HttpConfigFetcher::new());
    let ctx = TaskContext::new(
        config.clone(),
        events.clone(),
        provisioner.clone(),
        fetcher.clone(),
    );
    let registry = standard_registry(ctx);

    let processor = Arc::new(RequestProcessor::new(
        registry,
        config.clone(),
        Arc::new(MetadataIdentitySource::new(&cli.metadata_url)),
        provisioner,
        events.clone(),
    ));

    let listener = Listener {
        channel_dir: cli.channel_dir,
        control_name: format!("{}.sock", cli.deployment_id),
        processor,
        config: config.clone(),
        events: events.clone(),
        probe: Arc::new(HealthProbe::new(config, events.clone())),
        fetcher,
        counters: Arc::new(WorkCounters::default()),
        status: Arc::new(StatusCell::default()),
        maintenance_interval: Duration::from_secs(cli.maintenance_interval),
    };

    tokio::select! {
        result = listener.run() => {
            result?;
            info!("control loop finished, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, exiting");
        }
    }

    events.milestone("agent", "agent stopped")?;
    Ok(())
}
