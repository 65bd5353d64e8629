//! Tabsight command line
//!
//! Loads a workbook, a CSV file or a directory of CSV files and answers
//! questions about it with an OpenAI-compatible model.
//!
//! ```text
//! tabsight [--config config.yaml] <source> [query ...]
//! ```
//!
//! Without query arguments, queries are read from stdin, one per line.
//! Every outcome is printed to stdout as JSON.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use tabsight_agent::history;
use tabsight_agent::llm::OpenAiModel;
use tabsight_agent::{logging, Analyst, Config, Session};

#[derive(Parser)]
#[command(name = "tabsight")]
#[command(about = "Answer questions about spreadsheet data with a language model")]
#[command(version)]
struct Cli {
    /// Workbook (.xlsx, .xls, .ods), CSV file or directory of CSV files
    source: PathBuf,

    /// Questions to answer; read from stdin, one per line, when omitted
    queries: Vec<String>,

    /// Settings file
    #[arg(long, short = 'c', env = "TABSIGHT_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

async fn answer(analyst: &Analyst, session: &Session, query: &str) -> Result<(), Box<dyn std::error::Error>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(());
    }

    let output = match analyst.analyze(session, query).await {
        Ok(outcome) => serde_json::to_string_pretty(&outcome)?,
        Err(err) => {
            tracing::error!(error = %err, query = %query, "Analysis failed");
            serde_json::to_string_pretty(&serde_json::json!({
                "kind": "error",
                "query": query,
                "error": err.to_string(),
            }))?
        }
    };
    println!("{}", output);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)?;
    config.apply_logging_env();
    logging::init();

    let api_key = Config::get_openai_api_key()?;
    info!(
        model = %config.llm.model,
        thinking_model = %config.llm.thinking_model,
        max_attempts = config.analysis.max_attempts,
        "Starting tabsight"
    );

    let model = Arc::new(OpenAiModel::new(&api_key, &config.llm));
    let store = history::open_store(&config.history)?;
    let analyst = Analyst::new(model, &config).with_history(store);
    info!(
        database = config.history.database.as_deref().unwrap_or("memory"),
        "History store ready"
    );

    let session = analyst.load_dataset(&cli.source).await?;
    analyst.semantic_map(&session).await?;

    if cli.queries.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            answer(&analyst, &session, &line).await?;
        }
    } else {
        for query in &cli.queries {
            answer(&analyst, &session, query).await?;
        }
    }

    analyst.flush().await;
    Ok(())
}
