//! prefboxctl: Command-line interface for prefbox settings stores.
//!
//! Reads, writes, imports and watches the settings of a local database.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prefbox::{Config, SettingsService};

/// Command-line interface for prefbox settings stores.
#[derive(Parser)]
#[command(name = "prefboxctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value of one setting
    Get {
        /// Setting key
        key: String,
    },
    /// Create or overwrite a setting
    Set {
        /// Setting key
        key: String,
        /// Value (string sets are comma separated)
        value: String,
        /// Value type: bool, float32, int32, int64, string, string-set, opaque
        #[arg(short = 't', long = "type", default_value = "string")]
        value_type: String,
    },
    /// Remove one setting
    Remove {
        /// Setting key
        key: String,
    },
    /// Remove every setting
    Clear,
    /// List every setting
    List,
    /// Bulk insert settings from a JSON file of {"key","type","value"} entries
    Import {
        /// Path to the JSON file
        file: String,
    },
    /// Print added, changed and removed settings until Ctrl+C
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let service = SettingsService::open(&cli.config).with_context(|| {
        format!(
            "failed to open settings store at {}",
            cli.config.database_path().display()
        )
    })?;

    match cli.command {
        Commands::Get { key } => commands::settings::get(&service, &key, cli.output)?,
        Commands::Set {
            key,
            value,
            value_type,
        } => commands::settings::set(&service, &key, &value, &value_type, cli.output)?,
        Commands::Remove { key } => commands::settings::remove(&service, &key, cli.output)?,
        Commands::Clear => commands::settings::clear(&service, cli.output)?,
        Commands::List => commands::settings::list(&service, cli.output)?,
        Commands::Import { file } => commands::import::run(&service, &file, cli.output)?,
        Commands::Watch { interval_ms } => {
            commands::watch::run(&service, interval_ms, cli.output).await?;
        }
    }

    Ok(())
}
