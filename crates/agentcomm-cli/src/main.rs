// ABOUTME: Command-line entry point for agent message streaming.
// ABOUTME: Opens a session from config and flags, then streams, sends, or sends unary.

use std::path::PathBuf;
use std::time::Duration;

use agentcomm_client::{MessageBody, Session, SessionConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

#[derive(Parser)]
#[command(name = "agentcomm")]
#[command(about = "Send and receive agent messages over the agent communication service")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Channel to send and receive on (overrides config)
    #[arg(long, global = true, env = "AGENTCOMM_CHANNEL_ID")]
    channel_id: Option<String>,

    /// Use the regional endpoint instead of the zonal one
    #[arg(long, global = true)]
    regional: bool,

    /// Endpoint override (e.g., http://localhost:8080)
    #[arg(long, global = true, env = "AGENTCOMM_ENDPOINT")]
    endpoint: Option<String>,

    /// Milliseconds to wait for each message response
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Log session internals
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send each stdin line and print every received message
    Stream,

    /// Send one message over the stream and wait for its acknowledgement
    Send {
        /// Message text
        text: String,
    },

    /// Send one message over the unary RPC
    SendUnary {
        /// Message text
        text: String,
    },
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("agentcomm").join("config.toml");
    path.exists().then_some(path)
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(channel_id) = &cli.channel_id {
        config.channel_id = channel_id.clone();
    }
    if cli.regional {
        config.regional = true;
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_response_timeout(Duration::from_millis(timeout_ms));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    // The binary's own crate is `agentcomm`.
    agentcomm_log::init_for(&[env!("CARGO_CRATE_NAME"), "agentcomm_client"], level);

    let config = load_config(&cli)?;
    let session = Session::connect(config)
        .await
        .context("failed to open session")?;
    tracing::info!(
        resource_id = session.resource_id(),
        channel_id = session.channel_id(),
        "session open"
    );

    let result = match cli.command {
        Commands::Stream => run_stream(&session).await,
        Commands::Send { text } => session
            .send(MessageBody::text(text))
            .await
            .context("send failed"),
        Commands::SendUnary { text } => {
            let reply = session
                .send_unary(MessageBody::text(text))
                .await
                .context("unary send failed")?;
            if let Some(text) = reply.as_ref().and_then(MessageBody::as_text) {
                println!("{}", text);
            }
            Ok(())
        }
    };

    session.close();
    result
}

async fn run_stream(session: &Session) -> Result<()> {
    let receiver = session.clone();
    let printer = tokio::spawn(async move {
        loop {
            match receiver.receive().await {
                Ok(body) => match body.as_text() {
                    Some(text) => println!("{}", text),
                    None => println!("{:?}", body),
                },
                Err(err) => return err,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        if let Err(err) = session.send(MessageBody::text(line)).await {
            if err.is_terminal() {
                return Err(err).context("session closed");
            }
            tracing::warn!(error = %err, "send failed");
        }
    }

    // stdin is done; keep printing until the session ends.
    let err = printer.await.context("receiver task failed")?;
    Err(err).context("session closed")
}
