mod client;

use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "whisper", about = "Whisper: end-to-end encrypted one-time secrets", version)]
struct Cli {
    /// Whisper server URL (default: http://localhost:8080 or $WHISPER_SERVER)
    #[arg(long, env = "WHISPER_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Whisper HTTP server
    Serve {
        /// Port to listen on (default: $WHISPER_PORT or 8080)
        #[arg(long, env = "WHISPER_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $WHISPER_HOST or 0.0.0.0)
        #[arg(long, env = "WHISPER_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Storage backend: memory, redb or redis ($WHISPER_STORE)
        #[arg(long, env = "WHISPER_STORE")]
        store: Option<String>,
    },
    /// Encrypt a secret locally and print a one-time link
    Send {
        /// Secret text; read from stdin when omitted
        text: Option<String>,
        /// TTL duration e.g. 1h, 30m, 7d
        #[arg(long)]
        ttl: Option<String>,
        /// Number of views before the secret is burned
        #[arg(long)]
        views: Option<u32>,
    },
    /// Fetch and decrypt a secret from its link (consumes one view)
    Open {
        /// Full link including the #key fragment
        link: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WHISPER_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host, store } => cmd_serve(host, port, store).await,
        Commands::Send { text, ttl, views } => {
            cmd_send(&cli.server, text, ttl.as_deref(), views).await
        }
        Commands::Open { link } => cmd_open(&link).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, store: Option<String>) -> Result<()> {
    let defaults = whisper_server::ServerConfig::default();
    let cfg = whisper_server::ServerConfig {
        host,
        port,
        store: store.or(defaults.store),
        ..defaults
    };
    whisper_server::run(cfg).await
}

async fn cmd_send(
    server: &str,
    text: Option<String>,
    ttl: Option<&str>,
    views: Option<u32>,
) -> Result<()> {
    let ttl_seconds = ttl.map(parse_duration).transpose()?;

    let plaintext = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read secret from stdin")?;
            buf.trim_end_matches(['\r', '\n']).to_owned()
        }
    };
    if plaintext.is_empty() {
        anyhow::bail!("refusing to send an empty secret");
    }

    let link = client::send_secret(server, &plaintext, ttl_seconds, views).await?;
    println!("{link}");
    Ok(())
}

async fn cmd_open(link: &str) -> Result<()> {
    let plaintext = client::open_secret(link).await?;
    println!("{plaintext}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}
