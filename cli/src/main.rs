//! chainwatch CLI: follow a transaction until it is confirmed.
//!
//! ```text
//! chainwatch watch   --url <URL> --tx <HASH> [--confirmations N] [--timeout SECS] [--poll-ms MS] [--json]
//! chainwatch receipt --url <URL> --tx <HASH> [--json]
//! ```
//!
//! `ws://` and `wss://` URLs use the WebSocket provider and the push
//! strategy; anything else uses HTTP and polling.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use chainwatch_core::{
    ConfirmationEvent, Confirmed, ObserveError, ObserverConfig, Provider, TransactionObserver,
};
use chainwatch_http::{HttpProvider, HttpProviderConfig};
use chainwatch_ws::{WsProvider, WsProviderConfig};

mod logging;

use logging::LogConfig;

#[derive(Parser)]
#[command(
    name = "chainwatch",
    about = "Watch a transaction until it is buried under N confirmations",
    long_about = "
chainwatch follows a transaction over JSON-RPC and counts confirmations,
accepting a block only when its parent hash links it to the last one.

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter, overrides --log-level and the config file
",
    version
)]
struct Cli {
    /// JSON config file with `observer`, `http`, `ws` and `log` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a transaction until it reaches the confirmation target
    Watch {
        /// Node URL (http(s):// or ws(s)://)
        #[arg(long)]
        url: String,
        /// Transaction hash
        #[arg(long)]
        tx: String,
        /// Confirmations required on top of the containing block
        #[arg(long)]
        confirmations: Option<u64>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Poll interval for HTTP providers
        #[arg(long)]
        poll_ms: Option<u64>,
        /// Give up after this many new blocks without a receipt (0 disables)
        #[arg(long)]
        block_timeout: Option<u64>,
        /// Print events and the outcome as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check once whether a receipt exists
    Receipt {
        /// Node URL (http(s):// or ws(s)://)
        #[arg(long)]
        url: String,
        /// Transaction hash
        #[arg(long)]
        tx: String,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Optional config file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    observer: ObserverConfig,
    http: HttpProviderConfig,
    ws: WsProviderConfig,
    log: LogConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    config.log.json |= cli.log_json;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Watch {
            url,
            tx,
            confirmations,
            timeout,
            poll_ms,
            block_timeout,
            json,
        } => {
            let observer = &mut config.observer;
            if let Some(n) = confirmations {
                observer.block_confirmations = n;
            }
            if let Some(secs) = timeout {
                observer.timeout_ms = secs.saturating_mul(1_000);
            }
            if let Some(ms) = poll_ms {
                observer.poll_interval_ms = ms;
            }
            if let Some(n) = block_timeout {
                observer.block_timeout = (n > 0).then_some(n);
            }
            watch(&url, &tx, &config, json).await
        }
        Commands::Receipt { url, tx, json } => {
            config.observer.block_confirmations = 0;
            watch(&url, &tx, &config, json).await
        }
    }
}

async fn connect(url: &str, config: &FileConfig) -> Result<Arc<dyn Provider>> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        let provider = WsProvider::connect(url, config.ws.clone())
            .await
            .with_context(|| format!("connecting to {url}"))?;
        Ok(Arc::new(provider))
    } else {
        Ok(Arc::new(HttpProvider::new(url, config.http.clone())?))
    }
}

async fn watch(url: &str, tx: &str, config: &FileConfig, json: bool) -> Result<()> {
    let provider = connect(url, config).await?;
    let observer = TransactionObserver::new(provider, config.observer.clone());
    let required = config.observer.block_confirmations;
    let mut observation = observer.observe(tx);

    loop {
        tokio::select! {
            event = observation.next() => match event {
                Some(event) => print_event(&event, required, json),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(tx, "interrupted");
                observation.cancel();
                break;
            }
        }
    }

    match observation.outcome().await {
        Ok(done) => {
            print_confirmed(&done, json);
            Ok(())
        }
        Err(e) => {
            print_failure(&e, json);
            bail!(e)
        }
    }
}

fn print_event(event: &ConfirmationEvent, required: u64, json: bool) {
    if json {
        println!(
            "{}",
            json!({
                "event": "confirmation",
                "transactionHash": event.receipt.transaction_hash,
                "blockNumber": event.receipt.block_number,
                "confirmations": event.confirmations,
                "required": required,
                "checks": event.confirmation_checks,
            })
        );
        return;
    }
    match event.receipt.block_number {
        Some(block) if event.confirmations == 0 => {
            println!("mined in block {block} (status: {})", event.receipt.status)
        }
        _ => println!(
            "confirmation {}/{required} (check {})",
            event.confirmations, event.confirmation_checks
        ),
    }
}

fn print_confirmed(done: &Confirmed, json: bool) {
    if json {
        println!(
            "{}",
            json!({
                "event": "confirmed",
                "receipt": done.receipt,
                "confirmations": done.confirmations,
                "checks": done.confirmation_checks,
            })
        );
    } else {
        println!(
            "confirmed: {} confirmations after {} checks, status {}",
            done.confirmations, done.confirmation_checks, done.receipt.status
        );
    }
}

fn print_failure(err: &ObserveError, json: bool) {
    if !json {
        return;
    }
    let progress = err.progress();
    println!(
        "{}",
        json!({
            "event": "error",
            "error": err.to_string(),
            "timeout": err.is_timeout(),
            "receipt": progress.receipt,
            "confirmations": progress.confirmations,
            "checks": progress.confirmation_checks,
        })
    );
}
