//! Smoke-test control plane for a single agent.
//!
//! Binds the control socket, waits for an agent to connect, delivers a
//! bootstrap configuration, then runs one command and prints the reply.
//! Start this first, then start `hostagentd` pointed at the same
//! channel directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostagent_proto::envelope::HostIdentity;
use hostagentd_client::{ControlPlane, DEFAULT_CHANNEL_DIR};
use serde_json::{Map, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hostagent-ctl", version, about = "Drive a host agent over its local channels")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CHANNEL_DIR)]
    channel_dir: PathBuf,

    #[arg(long, default_value = "hostagent")]
    deployment_id: String,

    /// Bootstrap configuration document to deliver to the agent.
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    instance_id: String,

    #[arg(long)]
    reservation_id: String,

    /// Send the shutdown sentinel after the command completes.
    #[arg(long)]
    shutdown: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an unencrypted shortcut command.
    Shortcut { command: String },
    /// Run a named task with key=value parameters.
    Task {
        name: String,
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let bootstrap = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("cannot read {}", cli.config.display()))?;
    let identity = HostIdentity::new(cli.instance_id, cli.reservation_id);

    let mut plane = ControlPlane::bind(&cli.channel_dir, &cli.deployment_id, identity)?;
    info!("waiting for the agent to connect");
    plane.accept_agent(&bootstrap).await?;

    match cli.command {
        Command::Shortcut { command } => {
            let reply = plane.shortcut(&command).await?;
            println!("{reply}");
        }
        Command::Task { name, params } => {
            let params: Map<String, Value> = params
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let reply = plane.run_task(&name, Value::Object(params)).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    if cli.shutdown {
        plane.shutdown().await?;
    }
    Ok(())
}
