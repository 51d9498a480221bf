use std::fs;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use bnbria::orchestrator::IngestionOrchestrator;
use bnbria::scrape::{ScraperClient, ScraperConfig};
use bnbria::store::{CanonicalStore, MemoryStore};
use bnbria::types::IngestionStatus;

const TOKEN_ENV_VAR: &str = "BNBRIA_API_TOKEN";

#[derive(Parser)]
#[command(name = "bnbria")]
#[command(about = "Ingest and normalize short-term rental listings", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a listing: scrape it, poll until the record is terminal and
    /// print the canonical document
    Ingest {
        #[arg(help = "Listing locator (URL or platform id)")]
        locator: String,

        #[arg(
            short = 't',
            long = "token",
            help = "Bearer token for the scraping service (falls back to BNBRIA_API_TOKEN)"
        )]
        token: Option<String>,

        #[arg(
            long,
            default_value = "3",
            help = "Seconds between status polls",
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        poll_interval: u64,

        #[arg(
            long,
            default_value = "180",
            help = "Give up after this many seconds in a non-terminal state",
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        max_wait: u64,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "text",
            help = "Output format"
        )]
        format: OutputFormat,
    },
    /// Re-run normalization over a saved raw payload file
    Normalize {
        #[arg(help = "Path to a JSON file holding a raw scrape payload")]
        file: String,

        #[arg(
            short = 'o',
            long = "output",
            value_enum,
            default_value = "json",
            help = "Output format"
        )]
        format: OutputFormat,
    },
}

fn serialize_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

fn resolve_token(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
        .unwrap_or_else(|| {
            log::error!(
                "No scraping service token given (use --token or {})",
                TOKEN_ENV_VAR
            );
            process::exit(1);
        })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.clone().into())
        .init();

    match cli.command {
        Commands::Ingest {
            locator,
            token,
            poll_interval,
            max_wait,
            format,
        } => {
            let scraper = ScraperClient::new(ScraperConfig::new(resolve_token(token)))
                .unwrap_or_else(|e| {
                    log::error!("Error creating scraper client: {}", e);
                    process::exit(1);
                });

            let store = Arc::new(MemoryStore::new());
            let orchestrator = IngestionOrchestrator::new(
                store.clone(),
                store.clone(),
                Arc::new(scraper),
            );

            let record_id = orchestrator
                .start_ingestion(&locator)
                .await
                .unwrap_or_else(|e| {
                    log::error!("Error starting ingestion: {}", e);
                    process::exit(1);
                });
            log::info!("Started ingestion {} for '{}'", record_id, locator);

            let mut waited = 0u64;
            let record = loop {
                let record = orchestrator.poll_status(&record_id).await.unwrap_or_else(|e| {
                    log::error!("Error polling record {}: {}", record_id, e);
                    process::exit(1);
                });
                if record.status.is_terminal() {
                    break record;
                }
                if waited >= max_wait {
                    log::error!(
                        "Record {} still {} after {}s, giving up",
                        record_id,
                        record.status,
                        waited
                    );
                    process::exit(1);
                }
                log::info!("Record {} is {}, polling again...", record_id, record.status);
                tokio::time::sleep(Duration::from_secs(poll_interval)).await;
                waited += poll_interval;
            };

            if record.status == IngestionStatus::Failed {
                log::error!(
                    "Ingestion failed: {}",
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
                process::exit(1);
            }

            let doc = store
                .get(&locator)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| {
                    log::error!(
                        "Scrape succeeded but no canonical document was produced for '{}'",
                        locator
                    );
                    process::exit(1);
                });

            match format {
                OutputFormat::Json => serialize_json(&doc),
                OutputFormat::Text => println!("{}", doc),
            }
        }

        Commands::Normalize { file, format } => {
            let raw_text = fs::read_to_string(&file).unwrap_or_else(|e| {
                log::error!("Error reading {}: {}", file, e);
                process::exit(1);
            });
            let raw: serde_json::Value = serde_json::from_str(&raw_text).unwrap_or_else(|e| {
                log::error!("{} is not valid JSON: {}", file, e);
                process::exit(1);
            });

            let doc = bnbria::normalize(&raw).unwrap_or_else(|e| {
                log::error!("Normalization failed: {}", e);
                process::exit(1);
            });

            match format {
                OutputFormat::Json => serialize_json(&doc),
                OutputFormat::Text => println!("{}", doc),
            }
        }
    }
}
