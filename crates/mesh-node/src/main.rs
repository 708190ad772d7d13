//! mesh-node - a single participant of the gossip mesh.
//!
//! Listens for peers, dials the ones given on the command line, prints every
//! mesh event and turns stdin lines into broadcasts or direct messages.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mesh_p2p::{Mesh, MeshConfig, MeshEvent, MeshHandle, NodeId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "mesh_node=info,mesh_p2p=info";

#[derive(Parser)]
#[command(name = "mesh-node")]
#[command(about = "Flood-gossip mesh participant")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and gossip lines from stdin
    Run {
        /// Path to a TOML config file
        #[arg(short, long, env = "MESH_CONFIG")]
        config: Option<PathBuf>,

        /// Port to listen on (0 picks a free one)
        #[arg(short, long, env = "MESH_PORT", default_value_t = 7000)]
        port: u16,

        /// Peer to dial, as HOST:PORT (repeatable)
        #[arg(long = "peer", value_name = "HOST:PORT")]
        peers: Vec<String>,

        /// Fixed node id (overrides the config file)
        #[arg(long, env = "MESH_NODE_ID")]
        node_id: Option<String>,
    },

    /// Write a default config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "mesh.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Peers,
    Direct { node: NodeId, text: String },
    Broadcast(String),
    Quit,
    Usage(&'static str),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line.split_once(char::is_whitespace) {
        _ if line == "/peers" => Input::Peers,
        _ if line == "/quit" => Input::Quit,
        Some(("/dm", rest)) => match rest.trim().split_once(char::is_whitespace) {
            Some((node, text)) if !text.trim().is_empty() => Input::Direct {
                node: NodeId::from(node),
                text: text.trim().to_string(),
            },
            _ => Input::Usage("usage: /dm <node> <text>"),
        },
        None if line == "/dm" => Input::Usage("usage: /dm <node> <text>"),
        _ => Input::Broadcast(line.to_string()),
    }
}

fn parse_peer(peer: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .with_context(|| format!("peer '{peer}' must be HOST:PORT"))?;
    if host.is_empty() {
        anyhow::bail!("peer '{peer}' has an empty host");
    }
    let port = port
        .parse()
        .with_context(|| format!("peer '{peer}' has an invalid port"))?;
    Ok((host.to_string(), port))
}

fn load_config(path: Option<&Path>, node_id: Option<String>) -> anyhow::Result<MeshConfig> {
    let mut config = match path {
        Some(path) => MeshConfig::from_file(path)?,
        None => MeshConfig::default(),
    };
    if let Some(node_id) = node_id {
        config = config.with_node_id(node_id);
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER)?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Commands::Run {
            config,
            port,
            peers,
            node_id,
        } => {
            let config = load_config(config.as_deref(), node_id)?;
            run_node(config, port, &peers).await?;
        }
        Commands::InitConfig { output, force } => {
            init_config(&output, force)?;
            println!("Wrote default config to {}", output.display());
        }
    }

    Ok(())
}

async fn run_node(config: MeshConfig, port: u16, peers: &[String]) -> anyhow::Result<()> {
    let mesh = Mesh::spawn(config)?;
    let mut events = mesh.subscribe();

    let listener = mesh.listen(port).await?;
    info!(node_id = %mesh.id(), addr = %listener.local_addr(), "mesh node started");
    println!("node {} listening on {}", mesh.id(), listener.local_addr());

    for peer in peers {
        let (host, port) = parse_peer(peer)?;
        match mesh.connect(&host, port).await {
            Ok(handle) => info!(peer = %peer, connection_id = %handle.connection_id(), "dialed peer"),
            Err(e) => warn!(peer = %peer, error = %e, "failed to dial peer"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                if !handle_input(&mesh, parse_input(&line)).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    mesh.shutdown().await;
    Ok(())
}

/// Applies one input line. Returns false when the user asked to quit.
async fn handle_input(mesh: &MeshHandle, input: Input) -> anyhow::Result<bool> {
    match input {
        Input::Empty => {}
        Input::Quit => return Ok(false),
        Input::Usage(usage) => println!("{usage}"),
        Input::Peers => {
            let neighbors = mesh.neighbors().await?;
            if neighbors.is_empty() {
                println!("no peers");
            }
            for node in neighbors {
                println!("  {node}");
            }
        }
        Input::Direct { node, text } => {
            let id = mesh.direct(node, serde_json::Value::String(text)).await?;
            info!(message_id = %id, "sent direct message");
        }
        Input::Broadcast(text) => {
            let id = mesh.broadcast(serde_json::Value::String(text)).await?;
            info!(message_id = %id, "sent broadcast");
        }
    }
    Ok(true)
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::NodeConnected { node_id } => println!("+ {node_id}"),
        MeshEvent::NodeDisconnected { node_id } => println!("- {node_id}"),
        MeshEvent::Broadcast { message, origin } => println!("[{origin}] {}", render(message)),
        MeshEvent::Direct { origin, message } => println!("[{origin} -> me] {}", render(message)),
    }
}

fn render(message: &serde_json::Value) -> String {
    match message {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    let toml = MeshConfig::default().to_toml()?;
    std::fs::write(output, toml)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}
