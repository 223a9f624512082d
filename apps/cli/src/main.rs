//! tubeq CLI - Command-line download queue
//!
//! Queue video and playlist downloads, then drain the queue with
//! `tubeq run` while a yt-dlp compatible tool does the transfers.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubeq_core::Storage;

/// tubeq - Download queue for yt-dlp
#[derive(Parser)]
#[command(name = "tubeq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for tubeq
    #[arg(long, env = "TUBEQ_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a video or playlist
    Add {
        /// URL to download
        url: String,

        /// Format selector passed to the tool
        #[arg(short, long)]
        format: Option<String>,

        /// Playlist items to download, e.g. "1,3,5"
        #[arg(short, long, value_delimiter = ',')]
        items: Vec<u32>,

        /// Format for a single playlist item, e.g. "3=bestaudio" (repeatable)
        #[arg(long = "item-format", value_name = "INDEX=FORMAT")]
        item_formats: Vec<String>,

        /// Output template relative to the download directory
        #[arg(short, long)]
        template: Option<String>,

        /// Run the queue right away
        #[arg(short = 'n', long)]
        now: bool,
    },

    /// List jobs
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show job info
    Info {
        /// Job ID or unique ID prefix
        id: String,
    },

    /// Cancel a pending job
    Cancel {
        /// Job ID or unique ID prefix
        id: String,
    },

    /// Remove every job
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Download everything pending, then exit
    Run {
        /// Override the concurrency limit for this run
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("warn,tubeq_core=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "tubeq", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("tubeq"))
            .unwrap_or_else(|| PathBuf::from(".tubeq"))
    });

    let storage = Storage::new(data_dir).await?;

    match cli.command {
        Commands::Add {
            url,
            format,
            items,
            item_formats,
            template,
            now,
        } => {
            let request = commands::build_request(url, format, items, item_formats, template)?;
            commands::add_job(&storage, request, now, cli.output).await?
        }

        Commands::List { status, all } => {
            commands::list_jobs(&storage, status, all, cli.output).await?
        }

        Commands::Info { id } => commands::show_info(&storage, &id, cli.output).await?,

        Commands::Cancel { id } => commands::cancel_job(&storage, &id, cli.output).await?,

        Commands::Clear { yes } => commands::clear_jobs(&storage, yes).await?,

        Commands::Run { max_concurrent } => {
            commands::run_queue(&storage, max_concurrent, cli.output).await?
        }

        Commands::Config { action } => {
            commands::config_action(&storage, action, cli.output).await?
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
