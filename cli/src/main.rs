// blelink-cli — loopback demo, wire inspection and settings for blelink
//
// Runs both link roles in-process over the loopback bridges, so the whole
// framing / flow-control / reassembly path can be exercised without a radio.

mod config;
mod demo;

use anyhow::{Context, Result};
use blelink_core::message::{JsonCodec, PayloadCodec};
use blelink_core::transport::ble::{frame, OperationKind};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "blelink")]
#[command(about = "blelink — JSON messages over BLE characteristics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peripheral and a central against each other in memory
    Demo {
        /// JSON message to exchange
        #[arg(short, long)]
        message: Option<String>,
        /// Override the configured MTU
        #[arg(long)]
        mtu: Option<usize>,
    },
    /// Show the wire chunks a JSON message frames into
    Frame {
        json: String,
        #[arg(long)]
        mtu: Option<usize>,
        #[arg(short, long, value_enum, default_value_t = KindArg::Write)]
        kind: KindArg,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Write,
    Indicate,
    Read,
}

impl From<KindArg> for OperationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Write => OperationKind::Write,
            KindArg::Indicate => OperationKind::Indicate,
            KindArg::Read => OperationKind::ReadResponse,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { message, mtu } => cmd_demo(message, mtu).await,
        Commands::Frame { json, mtu, kind } => cmd_frame(json, mtu, kind),
        Commands::Config { action } => cmd_config(action),
    }
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON: {}", text))
}

async fn cmd_demo(message: Option<String>, mtu: Option<usize>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(mtu) = mtu {
        config.apply("mtu", &mtu.to_string())?;
    }

    let message = match message {
        Some(text) => parse_json(&text)?,
        None => serde_json::json!({
            "cmd": "unlock",
            "user": "demo",
            "note": "long enough to need several chunks"
        }),
    };

    demo::run(&config, message).await
}

fn cmd_frame(json: String, mtu: Option<usize>, kind: KindArg) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(mtu) = mtu {
        config.apply("mtu", &mtu.to_string())?;
    }

    let value = parse_json(&json)?;
    let bytes = JsonCodec.encode(&value).context("Failed to encode message")?;
    let chunks = frame(
        &bytes,
        config.link.max_chunk_size(),
        kind.into(),
        config.link.queue_capacity,
    )
    .context("Failed to frame message")?;

    println!(
        "{} {} bytes → {} chunks (MTU {})",
        "Frame".bold(),
        bytes.len(),
        chunks.len(),
        config.link.mtu
    );
    println!();

    for (i, chunk) in chunks.iter().enumerate() {
        let status = format!("{:02x}", chunk.status());
        let marker = if chunk.eot { "EOT".bright_green() } else { "   ".normal() };
        println!(
            "  {:>3}  {}  {}  {}",
            i,
            status.bright_yellow(),
            marker,
            hex::encode(&chunk.payload).dimmed()
        );
    }

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
