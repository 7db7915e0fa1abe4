//! CLI binary for asking the SQL agent questions.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sqlagent_agent::{AgentConfig, AgentLoop, LlmQueryGenerator};
use sqlagent_exec::{DbConfig, QueryExecutor, QueryLimits, RunLog};
use sqlagent_llm::{CostTrackingMiddleware, LlmClient, LoggingMiddleware, RetryPolicy};

#[derive(Parser)]
#[command(name = "sqlagent", version, about = "Answer questions about a database with generated SQL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question with a read-only query
    Ask {
        /// The question to answer
        question: String,

        /// File with the schema description (default: introspect the database)
        #[arg(long)]
        schema_file: Option<PathBuf>,

        /// Maximum generate/execute attempts
        #[arg(long, default_value = "4")]
        max_iterations: u32,

        /// Consecutive identical error kinds that abort the run
        #[arg(long, default_value = "2")]
        max_repeat_errors: u32,

        /// Maximum rows kept from a result
        #[arg(long, default_value = "5")]
        max_rows: usize,

        /// Statement timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Model used for generation
        #[arg(long, default_value = "gemini-2.5-flash")]
        model: String,

        /// LLM provider
        #[arg(long, default_value = "gemini")]
        provider: String,

        /// Sampling temperature (default: provider's own)
        #[arg(long)]
        temperature: Option<f32>,

        /// Retries for rate-limited, timed-out or 5xx LLM calls
        #[arg(long, default_value = "2")]
        llm_retries: u32,

        /// SQLite file to record the run in
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print every attempt instead of only the outcome
        #[arg(long)]
        report: bool,
    },

    /// Check that the configured database is reachable
    Health,

    /// Show recorded runs
    History {
        /// SQLite history file
        db: PathBuf,

        /// Number of runs to list
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Show the steps of one run instead
        #[arg(long)]
        run: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask {
            question,
            schema_file,
            max_iterations,
            max_repeat_errors,
            max_rows,
            timeout_ms,
            model,
            provider,
            temperature,
            llm_retries,
            history,
            report,
        } => {
            let config = AgentConfig {
                max_iterations,
                max_repeat_errors,
                model,
                provider,
            };
            let limits = QueryLimits {
                statement_timeout_ms: timeout_ms,
                max_rows,
            };
            let llm = LlmSettings {
                temperature,
                retry: RetryPolicy {
                    max_retries: llm_retries,
                    ..RetryPolicy::default()
                },
            };
            let succeeded = cmd_ask(
                &question,
                schema_file.as_deref(),
                config,
                limits,
                llm,
                history.as_deref(),
                report,
            )
            .await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Health => {
            cmd_health().await?;
        }
        Commands::History { db, limit, run } => {
            cmd_history(&db, limit, run.as_deref()).await?;
        }
    }

    Ok(())
}

/// Generation knobs that stay outside `AgentConfig`.
struct LlmSettings {
    temperature: Option<f32>,
    retry: RetryPolicy,
}

async fn cmd_ask(
    question: &str,
    schema_file: Option<&Path>,
    config: AgentConfig,
    limits: QueryLimits,
    llm: LlmSettings,
    history: Option<&Path>,
    print_report: bool,
) -> anyhow::Result<bool> {
    limits.validate()?;
    let db = DbConfig::from_env()?;
    tracing::debug!(?db, "Database configuration");
    let backend = db.connect_backend()?;

    let schema = match schema_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading schema file {}", path.display()))?,
        None => backend
            .describe_schema()
            .await
            .map_err(|e| anyhow::anyhow!("schema introspection failed: {e}"))?,
    };
    if schema.trim().is_empty() {
        anyhow::bail!("Schema description is empty; pass --schema-file or point at a populated database");
    }

    let cost = CostTrackingMiddleware::new();
    let client = LlmClient::for_provider(&config.provider)?
        .with_retry_policy(llm.retry)
        .with_middleware(LoggingMiddleware)
        .with_middleware(cost.clone());
    let mut generator =
        LlmQueryGenerator::new(client, config.model.clone()).with_provider(config.provider.clone());
    if let Some(temperature) = llm.temperature {
        generator = generator.with_temperature(temperature);
    }

    let executor = QueryExecutor::new(backend, limits);
    let agent = AgentLoop::new(Box::new(generator), executor, schema, config)?;

    let (report, error) = match agent.run_report(question).await {
        Ok(report) => (report, None),
        Err(failure) => (*failure.report, Some(failure.error)),
    };
    tracing::info!(
        run_id = %report.run_id,
        iterations = report.iterations(),
        input_tokens = cost.total_input_tokens(),
        output_tokens = cost.total_output_tokens(),
        "Run finished"
    );

    if let Some(path) = history {
        let log = RunLog::open(path).await?;
        log.save(&report).await?;
    }

    let output = if print_report {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string_pretty(&report.outcome)?
    };
    println!("{output}");

    if let Some(error) = error {
        return Err(error.into());
    }
    Ok(report.outcome.is_success())
}

async fn cmd_health() -> anyhow::Result<()> {
    let db = DbConfig::from_env()?;
    let backend = db.connect_backend()?;
    match backend.ping().await {
        Ok(()) => {
            println!("{}", serde_json::json!({ "status": "ok", "backend": backend.name() }));
            Ok(())
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::json!({ "status": "error", "backend": backend.name(), "message": e.to_string() })
            );
            std::process::exit(1);
        }
    }
}

async fn cmd_history(db: &Path, limit: u32, run: Option<&str>) -> anyhow::Result<()> {
    if !db.exists() {
        anyhow::bail!("History file not found: {}", db.display());
    }
    let log = RunLog::open(db).await?;
    let output = match run {
        Some(run_id) => serde_json::to_string_pretty(&log.steps(run_id).await?)?,
        None => serde_json::to_string_pretty(&log.recent_runs(limit).await?)?,
    };
    println!("{output}");
    Ok(())
}
