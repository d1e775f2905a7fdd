//! Nudge Harvester CLI
//!
//! Collects productivity labels next to desktop activity samples.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use nudge_harvester::{
    collector::Backend,
    config::Config,
    engine::{self, RunOptions},
    protocol::{send_token, Token},
    stable_hash,
    transparency::TransparencyLog,
    PRIVACY_DECLARATION, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nudge-harvester")]
#[command(version = VERSION)]
#[command(about = "Collect productivity labels from desktop activity", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start sampling and prompting
    Start {
        /// Minutes between prompts
        #[arg(long)]
        interval: Option<u64>,

        /// Let the decision service fire or hold back prompts
        #[arg(long)]
        ml: bool,

        /// Minimum prediction confidence for the gate to act
        #[arg(long)]
        threshold: Option<f64>,

        /// Do not launch the inference and trainer processes
        #[arg(long)]
        no_services: bool,
    },

    /// Answer the pending prompt
    Label {
        #[arg(value_enum)]
        answer: Answer,
    },

    /// Ask a running harvester for a snapshot
    Snap,

    /// Print the stable hash of an application name
    Hash { name: String },

    /// Show collection statistics
    Status,

    /// Show configuration
    Config,

    /// Display privacy declaration
    Privacy,
}

#[derive(Clone, Copy, ValueEnum)]
enum Answer {
    Yes,
    No,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            interval,
            ml,
            threshold,
            no_services,
        } => cmd_start(interval, ml, threshold, no_services).await,
        Commands::Label { answer } => {
            let token = match answer {
                Answer::Yes => Token::Yes,
                Answer::No => Token::No,
            };
            cmd_send(token).await
        }
        Commands::Snap => cmd_send(Token::Snap).await,
        Commands::Hash { name } => {
            println!("{}", stable_hash(&name));
            Ok(())
        }
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
            Ok(())
        }
    }
}

async fn cmd_start(
    interval: Option<u64>,
    ml: bool,
    threshold: Option<f64>,
    no_services: bool,
) -> anyhow::Result<()> {
    let mut config = Config::load().context("Could not load configuration")?;

    if let Some(minutes) = interval {
        config.interval_minutes = minutes;
    }
    if ml {
        config.ml_enabled = true;
    }
    if let Some(threshold) = threshold {
        config.confidence_threshold = threshold;
    }
    if let Err(e) = config.validate() {
        bail!("{e}");
    }

    println!("Nudge Harvester v{VERSION}");
    println!();
    println!("  Interval: {} min", config.interval_minutes);
    println!(
        "  ML assistance: {}",
        if config.ml_enabled {
            format!("enabled (threshold {:.2})", config.confidence_threshold)
        } else {
            "disabled".to_string()
        }
    );
    println!("  Responses: udp://{}", config.listen_addr);
    println!("  Log file: {}", config.log_path.display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let cancel = CancellationToken::new();
    ctrlc_handler(cancel.clone())?;

    let stats = engine::run(
        config,
        RunOptions {
            start_services: !no_services,
        },
        cancel,
    )
    .await?;

    println!();
    println!("{}", stats.summary());
    Ok(())
}

async fn cmd_send(token: Token) -> anyhow::Result<()> {
    let config = Config::load().context("Could not load configuration")?;
    send_token(config.listen_addr, token)
        .await
        .with_context(|| format!("Could not send {token} to {}", config.listen_addr))?;
    println!("Sent {token} to udp://{}", config.listen_addr);
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Nudge Harvester Status");
    println!("======================");
    println!();
    println!("Activity backend: {}", Backend::detect());
    println!(
        "ML assistance: {}",
        if config.ml_enabled { "enabled" } else { "disabled" }
    );
    println!("Log file: {}", config.log_path.display());
    println!();

    let stats_path = config.stats_path();
    if stats_path.exists() {
        let log = TransparencyLog::with_persistence(stats_path);
        let stats = log.stats();
        println!("Cumulative Statistics:");
        println!("  Snapshots requested: {}", stats.snapshots_requested);
        println!("  Labeled productive: {}", stats.labels_productive);
        println!("  Labeled not productive: {}", stats.labels_unproductive);
        println!("  Timed out: {}", stats.timeouts);
        println!("  Discarded: {}", stats.discarded);
        println!(
            "  Rows written: {} ({} failed)",
            stats.rows_written, stats.persist_failures
        );
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().context("Could not load configuration")?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .context("Error setting Ctrl+C handler")
}
