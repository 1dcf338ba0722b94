use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use promptgate::cache::MemoryCache;
use promptgate::llm::TokenUsage;
use promptgate::storage::sqlite::SqliteStorage;
use promptgate::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "promptgate")]
#[command(about = "Prompt execution gateway with metering, webhooks and cost reports", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,

    /// Print monthly cost reports as JSON
    Report {
        /// User whose calls are reported
        #[arg(long)]
        user: String,

        /// First month, YYYY-MM
        #[arg(long)]
        from: String,

        /// Last month, YYYY-MM
        #[arg(long)]
        to: String,

        /// Include months that failed to aggregate
        #[arg(long)]
        status: bool,
    },

    /// Estimate the cost of a call
    Cost {
        #[arg(long)]
        model: String,

        /// Call time, YYYY-MM-DD or RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,

        #[arg(long, default_value_t = 0)]
        prompt_tokens: u32,

        #[arg(long, default_value_t = 0)]
        completion_tokens: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::discover(cli.config.as_deref())?;

    // Initialize logging
    init_logging(&config.logging.level, &config.logging.format)?;

    match cli.command {
        Some(Commands::Serve) | None => {
            promptgate::run(config).await?;
        }
        Some(Commands::Report {
            user,
            from,
            to,
            status,
        }) => {
            let storage = SqliteStorage::new(&config.storage.path).await?;
            let cache = Arc::new(MemoryCache::new(config.cache.max_entries));
            let reports = promptgate::report_service(storage, cache, &config);

            let output = if status {
                serde_json::to_string_pretty(&reports.reports_with_status(&user, &from, &to).await?)?
            } else {
                serde_json::to_string_pretty(&reports.reports(&user, &from, &to).await?)?
            };
            println!("{}", output);
        }
        Some(Commands::Cost {
            model,
            at,
            prompt_tokens,
            completion_tokens,
        }) => {
            let pricing = promptgate::load_pricing(&config)?;
            let at = match at {
                Some(value) => parse_instant(&value)?,
                None => Utc::now(),
            };
            let usage = TokenUsage::new(prompt_tokens, completion_tokens);
            let rates = pricing.cost(&model, at)?;

            let output = serde_json::json!({
                "model": model,
                "at": at,
                "effectiveFrom": rates.effective_from,
                "promptTokens": usage.prompt,
                "completionTokens": usage.completion,
                "costCents": rates.total(&usage),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD or RFC 3339", value))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // Logs go to stderr so report and cost output stays pipeable.
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            // Default to pretty
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
