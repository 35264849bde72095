//! Remote Pub/Sub CLI
//!
//! Talks to a broker over one session.
//!
//! ## Usage
//!
//! ```bash
//! # Publish a value
//! remote-pubsub put demo/example/a "hello"
//!
//! # Follow everything under demo/
//! remote-pubsub sub 'demo/**'
//!
//! # Query, giving up locally after 5 seconds
//! remote-pubsub get 'demo/example/*' --timeout-ms 5000
//!
//! # Use a config file, overriding its endpoint
//! remote-pubsub --config session.toml --endpoint wss/broker.example:443 sub 'demo/**'
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use remote_pubsub::{
    CancellationToken, GetOptions, Handler, PutOptions, Received, Reply, Session, SessionConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-pubsub")]
#[command(about = "Client for a remote pub/sub broker")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker endpoint, e.g. ws/127.0.0.1:10000
    #[arg(long, env = "REMOTE_PUBSUB_ENDPOINT")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a value
    Put { key_expr: String, value: String },

    /// Publish a deletion
    Delete { key_expr: String },

    /// Print samples until interrupted
    Sub {
        key_expr: String,

        /// Samples buffered before new ones are dropped
        #[arg(long, default_value_t = 256)]
        capacity: usize,
    },

    /// Query and print replies
    Get {
        key_expr: String,

        #[arg(long, default_value = "")]
        parameters: String,

        /// Stop waiting for replies after this long
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("remote_pubsub=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    let session = Session::open(&config)
        .await
        .with_context(|| format!("Failed to open session to {}", config.endpoint))?;

    let result = run(&session, args.command).await;
    session.close();
    result
}

async fn run(session: &Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { key_expr, value } => {
            session.put(&key_expr, value, PutOptions::default()).await?;
            info!(key_expr = %key_expr, "Published");
        }
        Command::Delete { key_expr } => {
            session.delete(&key_expr, PutOptions::default()).await?;
            info!(key_expr = %key_expr, "Deleted");
        }
        Command::Sub { key_expr, capacity } => {
            let subscriber = session
                .declare_subscriber(&key_expr, Handler::Fifo(capacity))
                .await?;
            info!(key_expr = %key_expr, id = %subscriber.id(), "Subscribed, Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = subscriber.recv() => match received {
                        Received::Value(sample) => println!(
                            "{} {} {}",
                            sample.kind.as_str(),
                            sample.key_expr,
                            sample.payload_str()
                        ),
                        Received::Malformed(reason) => warn!(reason = %reason, "Malformed sample"),
                        Received::NotYetAvailable => {}
                        Received::Disconnected => break,
                    },
                }
            }
            subscriber.undeclare().await?;
        }
        Command::Get {
            key_expr,
            parameters,
            timeout_ms,
        } => {
            let token = CancellationToken::new();
            if let Some(ms) = timeout_ms {
                token.cancel_after(Duration::from_millis(ms));
            }
            let options = GetOptions::with_parameters(parameters).cancellation(token);
            let replies = session
                .get(&key_expr, options, Handler::default())
                .await?
                .context("Channel handler yields a receiver")?;

            loop {
                match replies.receive().await {
                    Received::Value(Reply::Ok(sample)) => {
                        println!("{} {}", sample.key_expr, sample.payload_str())
                    }
                    Received::Value(Reply::Err(err)) => {
                        println!("error: {}", String::from_utf8_lossy(&err.payload))
                    }
                    Received::Malformed(reason) => warn!(reason = %reason, "Malformed reply"),
                    Received::NotYetAvailable => {}
                    Received::Disconnected => break,
                }
            }
        }
    }
    Ok(())
}
