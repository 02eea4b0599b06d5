use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use frame_sync::config::FileConfig;
use frame_sync::logging::{init_logging, DebugLevel};
use frame_sync::session::ChangeOrigin;
use frame_sync::{
    create_embedded_session, server, Diff, FrameContext, FramePeer, HostState, Negotiator,
    Session, SessionConfig, SessionRegistry, WsChannel,
};

#[derive(Parser)]
#[command(name = "frame-sync")]
#[command(about = "Keep an embedded app's state in sync with its host", version)]
#[command(after_help = "Examples:
  frame-sync serve --port 3000 --meta '{\"room\":\"abc\"}'
  frame-sync counter --url ws://localhost:3000/ws --increments 5
  frame-sync counter            (host and app in one process)")]
struct Cli {
    /// Config file (.toml or .json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a WebSocket host that apps can negotiate sessions with
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Metadata handed to every app in the Init reply (JSON)
        #[arg(short, long)]
        meta: Option<String>,
    },

    /// Run the counter app
    Counter {
        /// Host to connect to; runs an in-process host when omitted
        #[arg(short, long, value_name = "URL")]
        url: Option<String>,

        #[arg(short = 'n', long, default_value = "3")]
        increments: u32,

        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Give up if the host has not answered by then
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    if cli.debug {
        file.logging.level = DebugLevel::Log;
    }
    init_logging(&file.logging)?;

    match cli.command {
        Commands::Serve { port, meta } => {
            let port = port.unwrap_or(file.host.port);
            let meta = match meta {
                Some(raw) => serde_json::from_str(&raw).context("--meta is not valid JSON")?,
                None => file.host.meta.clone(),
            };
            let host = match file.host.state.clone() {
                Some(state) => HostState::with_state(meta, state),
                None => HostState::new(meta),
            };

            println!(
                "{}",
                format!("🌐 Starting host on port {}...", port).cyan().bold()
            );
            server::start(port, Arc::new(host)).await?;
        }

        Commands::Counter {
            url,
            increments,
            interval_ms,
            timeout_ms,
        } => {
            let mut config = file.session_config();
            if let Some(ms) = timeout_ms {
                config = config.with_handshake_timeout(Duration::from_millis(ms));
            }
            run_counter(
                url,
                config,
                file.host.meta.clone(),
                increments,
                Duration::from_millis(interval_ms),
            )
            .await?;
        }
    }

    Ok(())
}

async fn run_counter(
    url: Option<String>,
    config: SessionConfig,
    meta: Value,
    increments: u32,
    interval: Duration,
) -> Result<()> {
    // The in-process host has to outlive the session
    let (session, _peer) = match url {
        Some(url) => {
            println!("{} {}", "🔌 Connecting to".cyan(), url.bright_blue());
            let channel = WsChannel::connect(&url).await?;
            let negotiator = Negotiator::new(
                Arc::new(channel),
                Arc::new(SessionRegistry::new()),
                config,
            );
            (negotiator.connect().await?, None)
        }
        None => {
            println!("{}", "🧩 Running host and app in one process".cyan());
            let host = FrameContext::top_level();
            let app = host.embed();
            let peer = FramePeer::spawn(&host, &app, Arc::new(HostState::new(meta)));
            (create_embedded_session(&app, config).await?, Some(peer))
        }
    };

    println!(
        "{} Session {} (meta: {})",
        "✓".green(),
        session.id().to_string().bright_yellow(),
        session.meta()
    );

    let mut changes = session.subscribe();
    let renderer = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                let marker = match change.origin {
                    ChangeOrigin::Local => "→".bright_white(),
                    ChangeOrigin::Remote => "←".bright_magenta(),
                };
                println!("{} count: {}", marker, count_of(&session).to_string().bold());
            }
        })
    };

    let state = session.ensure_state(Diff::new().with("count", 0));
    println!(
        "  count: {}",
        state.get("count").cloned().unwrap_or(Value::Null)
    );

    for _ in 0..increments {
        tokio::time::sleep(interval).await;
        session.set_state(Diff::new().with("count", count_of(&session) + 1));
    }

    // Let the last notifications render
    tokio::time::sleep(Duration::from_millis(50)).await;
    renderer.abort();

    println!(
        "{} Final count: {}",
        "✓".green(),
        count_of(&session).to_string().bright_green()
    );
    Ok(())
}

fn count_of(session: &Session) -> i64 {
    session
        .get("count")
        .and_then(|value| value.as_i64())
        .unwrap_or(0)
}
