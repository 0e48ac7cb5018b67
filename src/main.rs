mod cmd;
mod format;
mod progress;

use clap::{Parser, Subcommand};
use std::process;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(version)]
#[command(about = "Chat with one local model shared by many conversations", long_about = None)]
struct Cli {
    /// Log debug output (overrides HEARTH_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported models and whether their files are present
    #[command(alias = "ls")]
    Models,
    /// Start an interactive chat
    Chat {
        model: String,
        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },
    /// Show generations interrupted by a crash, optionally resolving them
    Recover {
        #[arg(long, conflicts_with = "dismiss")]
        resume: bool,
        #[arg(long)]
        dismiss: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = hearth::EnvConfig::from_env();
    init_tracing(cli.verbose, config.log_level.as_deref());

    let result = match cli.command {
        Commands::Models => cmd::models(&config),
        Commands::Chat { model, conversation } => cmd::chat(&config, &model, conversation).await,
        Commands::Recover { resume, dismiss } => cmd::recover(&config, resume, dismiss).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, level: Option<&str>) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        level
            .and_then(|l| l.parse().ok())
            .unwrap_or(tracing::Level::WARN)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
