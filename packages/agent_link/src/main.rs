use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Instrument, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use agent_link::config::{DEFAULT_CONFIG_FILE, FileConfig, load_config};
use agent_link::{AnyTransport, ConnectionState, Frame, LinkConfig, Role, Transport};

#[derive(Parser)]
#[command(name = "link")]
#[command(about = "Exchange frames with a peer over a resilient WebSocket link")]
#[command(version)]
struct Cli {
    /// Config file (TOML); missing files are ignored
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for a peer
    Host(HostArgs),
    /// Dial an external server
    Connect(ConnectArgs),
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Args)]
struct HostArgs {
    /// Address to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (0 for automatic)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct ConnectArgs {
    /// Server host, optionally with `:port`
    #[arg(long)]
    host: Option<String>,

    /// Server port, appended to the host
    #[arg(short, long)]
    port: Option<u16>,

    /// Endpoint path
    #[arg(long)]
    path: Option<String>,

    #[arg(long)]
    simulation_id: Option<String>,

    /// Cursor to start reading from
    #[arg(long)]
    read_index: Option<u64>,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct SessionArgs {
    /// Seconds between stats log lines (0 disables)
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&file_config).context("failed to render config")?;
            print!("{rendered}");
            Ok(())
        }
        Commands::Host(args) => {
            file_config.role = Role::Hosting;
            if let Some(host) = args.host {
                file_config.hosting.host = host;
            }
            if let Some(port) = args.port {
                file_config.hosting.port = port;
            }
            run_session(LinkConfig::from_file(&file_config), args.session).await
        }
        Commands::Connect(args) => {
            file_config.role = Role::Connecting;
            if let Some(host) = args.host {
                file_config.connecting.host = host;
            }
            if args.port.is_some() {
                file_config.connecting.port = args.port;
            }
            if let Some(path) = args.path {
                file_config.connecting.path = path;
            }
            if let Some(simulation_id) = args.simulation_id {
                file_config.connecting.simulation_id = simulation_id;
            }
            if let Some(read_index) = args.read_index {
                file_config.connecting.read_index = read_index;
            }
            run_session(LinkConfig::from_file(&file_config), args.session).await
        }
    }
}

/// Logs go to stderr; stdout carries received frames.
fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "agent_link=debug,link=debug,warn"
    } else {
        "agent_link=info,link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_session(config: LinkConfig, args: SessionArgs) -> Result<()> {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("session", id = %session_id, role = ?config.role);
    async move {
        let transport = AnyTransport::from_config(&config).context("invalid configuration")?;
        transport.set_message_handler(print_frame);

        transport
            .start()
            .await
            .context("failed to start transport")?;
        info!(
            endpoint = %transport.endpoint().unwrap_or_default(),
            "link is up, reading frames from stdin"
        );

        let outcome = pump(&transport, args.stats_interval).await;

        transport.stop().await;
        match serde_json::to_string(&transport.stats()) {
            Ok(stats) => info!(%stats, "final stats"),
            Err(e) => warn!(error = %e, "failed to serialize stats"),
        }
        outcome
    }
    .instrument(span)
    .await
}

/// Forward stdin lines to the peer until the session ends.
async fn pump(transport: &AnyTransport, stats_interval: u64) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let stats_enabled = stats_interval > 0;
    let period = Duration::from_secs(stats_interval.max(1));
    let mut stats_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.is_empty() => {}
                    Some(line) => {
                        if let Err(e) = transport.send(Frame::Text(line)).await {
                            warn!(error = %e, "send raised an overflow alarm");
                        }
                    }
                    None => {
                        info!("stdin closed, shutting down");
                        return Ok(());
                    }
                }
            }
            _ = stats_tick.tick(), if stats_enabled => {
                match serde_json::to_string(&transport.stats()) {
                    Ok(stats) => info!(%stats, "transport stats"),
                    Err(e) => warn!(error = %e, "failed to serialize stats"),
                }
            }
            failed = transport.core().wait_for_state(
                |state| state == ConnectionState::Failed,
                Duration::from_secs(3600),
            ) => {
                if failed {
                    bail!("transport failed after exhausting reconnection attempts");
                }
            }
        }
    }
}

fn print_frame(frame: Frame) {
    match frame {
        Frame::Text(text) => println!("{text}"),
        Frame::Binary(bytes) => println!("<{} bytes binary>", bytes.len()),
    }
}
