mod aggregator;
mod config;
mod error;
mod models;
mod service;
mod source;
mod storage;

use aggregator::{LogObserver, MetricsAggregator};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::{db_path, ensure_initialized, load_config, AppConfig};
use error::AppError;
use models::{MetricsQuery, RequestDetail, SnapshotDocument, TokenStats};
use service::{MetricsResponse, MetricsService};
use source::{JsonSnapshotFile, SnapshotSource};
use std::fs;
use std::path::PathBuf;
use storage::Storage;

#[derive(Debug, Parser)]
#[command(name = "proxy-metrics")]
#[command(about = "Token and request metrics for a multi-provider API proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Record {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        tokens: i64,
        #[arg(long, default_value_t = 0)]
        input: i64,
        #[arg(long, default_value_t = 0)]
        output: i64,
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long, default_value = "")]
        source: String,
        #[arg(long)]
        failed: bool,
    },
    Import {
        file: PathBuf,
    },
    Export,
    Metrics {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Raw query string, e.g. "from=...&model=gpt-4o". Flags take precedence.
        #[arg(long)]
        query: Option<String>,
        /// Read usage from an export file instead of the local store.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn init_logging(cfg: &AppConfig) {
    let env = env_logger::Env::default().default_filter_or(cfg.log_level.as_str());
    let _ = env_logger::Builder::from_env(env).try_init();
}

fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>, AppError> {
    match raw {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| AppError::Validation("invalid 'timestamp' format".into())),
    }
}

fn build_query(
    from: Option<String>,
    to: Option<String>,
    model: Option<String>,
    raw: Option<&str>,
) -> MetricsQuery {
    let base = raw.map(MetricsQuery::from_query_string).unwrap_or_default();
    MetricsQuery {
        from: from.or(base.from),
        to: to.or(base.to),
        model: model.or(base.model),
    }
}

fn serve<S: SnapshotSource>(source: S, cfg: &AppConfig, query: &MetricsQuery) -> MetricsResponse {
    let aggregator = if cfg.log_reports {
        MetricsAggregator::with_observer(Box::new(LogObserver))
    } else {
        MetricsAggregator::new()
    };
    MetricsService::new(source, aggregator).respond(query)
}

fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let cfg = load_config()?;
    init_logging(&cfg);

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized proxy-metrics config and data directories.");
        }
        Commands::Record {
            provider,
            model,
            tokens,
            input,
            output,
            timestamp,
            source,
            failed,
        } => {
            ensure_initialized()?;
            let detail = RequestDetail {
                timestamp: parse_timestamp(timestamp.as_deref())?,
                source,
                tokens: TokenStats {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: tokens,
                    ..TokenStats::default()
                },
                failed,
            };
            let storage = Storage::open(&db_path(&cfg)?)?;
            storage.record(&provider, &model, &detail)?;
            log::info!("recorded {tokens} tokens for {provider}/{model}");
        }
        Commands::Import { file } => {
            ensure_initialized()?;
            let raw = fs::read_to_string(&file)?;
            let doc: SnapshotDocument = serde_json::from_str(&raw)?;
            let snapshot = doc.into_snapshot();
            log::debug!("import document holds {} details", snapshot.detail_count());
            let mut storage = Storage::open(&db_path(&cfg)?)?;
            let inserted = storage.import_snapshot(&snapshot)?;
            println!("Imported {} usage details from {}", inserted, file.display());
        }
        Commands::Export => {
            ensure_initialized()?;
            let storage = Storage::open(&db_path(&cfg)?)?;
            println!("{}", storage.export_json()?);
        }
        Commands::Metrics {
            from,
            to,
            model,
            query,
            snapshot,
        } => {
            let query = build_query(from, to, model, query.as_deref());
            let response = match snapshot {
                Some(path) => serve(JsonSnapshotFile::new(path), &cfg, &query),
                None => {
                    ensure_initialized()?;
                    serve(Storage::open(&db_path(&cfg)?)?, &cfg, &query)
                }
            };

            println!("{}", serde_json::to_string_pretty(&response.body)?);
            if response.is_client_error() {
                std::process::exit(2);
            }
            if !response.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
