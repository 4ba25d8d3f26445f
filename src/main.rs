use batchforge::checkpoint::{CheckpointStore, read_record};
use batchforge::llm::{ApiClient, HttpApiClient, MockApiClient, RawReply};
use batchforge::metrics::{RunSummary, format_duration};
use batchforge::orchestrator::Orchestrator;
use batchforge::shutdown::ShutdownController;
use batchforge::storage::{DocumentStore, MemoryStore, SqliteStore};
use batchforge::template::{ContentTypeConfig, TemplateHandler};
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(verbose: bool, level: Option<&str>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    let level = level
        .and_then(|l| log::LevelFilter::from_str(l).ok())
        .unwrap_or(log::LevelFilter::Info);
    builder.filter_level(level).parse_default_env();

    if verbose {
        builder.target(env_logger::Target::Stderr).init();
        return Ok(());
    }

    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("batchforge")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("batchforge.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Run {
            content_type,
            limit,
            dry_run,
        } => handle_run_command(content_type, *limit, *dry_run, config).await,
        Commands::Status { content_type } => handle_status_command(content_type, config).await,
        Commands::Reset {
            content_type,
            failed_only,
        } => handle_reset_command(content_type, *failed_only, config).await,
    }
}

async fn handle_run_command(content_type: &str, limit: Option<u64>, dry_run: bool, config: &Config) -> Result<()> {
    let content = config.content_type(content_type)?.clone();
    info!("Running content type '{}' (limit: {:?}, dry run: {})", content.name, limit, dry_run);

    let handler = TemplateHandler::new(content.clone(), &config.llm.model, &config.llm.parameters);

    let mut engine_config = config.engine.clone();
    if let Some(limit) = limit {
        engine_config.max_items = Some(limit);
    }

    let store = Arc::new(
        SqliteStore::open(&config.store.path, &config.store.table)
            .with_context(|| format!("Failed to open store at {}", config.store.path.display()))?,
    );

    let shutdown = ShutdownController::new();
    let signals = shutdown.listen_for_signals();

    let summary = if dry_run {
        println!("{}", "Dry run: mock API, nothing written to the store".yellow());
        let checkpoint_path = std::env::temp_dir().join(format!("batchforge-dry-run-{}.json", content.name));
        remove_scratch_checkpoint(&checkpoint_path);

        let query = content.work_query();
        let snapshot = store.find_pending(&query).await.context("Failed to read pending documents")?;
        let scratch = Arc::new(MemoryStore::with_documents(
            snapshot.into_iter().map(|item| (item.id, item.payload)),
        ));
        let reply = dry_run_reply(&content);
        let api = Arc::new(MockApiClient::new(move |_| Ok(RawReply::new(reply.clone()))));

        let summary = execute(engine_config, scratch, api, handler, &checkpoint_path, shutdown.clone()).await;
        remove_scratch_checkpoint(&checkpoint_path);
        summary?
    } else {
        let api = Arc::new(
            HttpApiClient::from_env(
                config.llm.endpoint.clone(),
                &config.llm.api_key_env,
                config.engine.request_timeout(),
            )
            .context("Failed to create API client")?,
        );
        let checkpoint_path = config.checkpoint_path(&content.name);
        execute(engine_config, store, api, handler, &checkpoint_path, shutdown.clone()).await?
    };

    signals.abort();
    print_summary(&summary);
    Ok(())
}

fn remove_scratch_checkpoint(path: &Path) {
    if let Err(e) = CheckpointStore::delete(path) {
        log::warn!("Failed to remove dry-run checkpoint {}: {}", path.display(), e);
    }
}

async fn execute<S, C>(
    engine_config: batchforge::orchestrator::EngineConfig,
    store: Arc<S>,
    api: Arc<C>,
    handler: TemplateHandler,
    checkpoint_path: &Path,
    shutdown: ShutdownController,
) -> Result<RunSummary>
where
    S: DocumentStore + 'static,
    C: ApiClient + 'static,
{
    let checkpoint = Arc::new(
        CheckpointStore::load(checkpoint_path, engine_config.checkpoint_interval)
            .with_context(|| format!("Failed to load checkpoint {}", checkpoint_path.display()))?,
    );
    let query = handler.content().work_query();

    let mut orchestrator = Orchestrator::new(
        engine_config,
        store,
        api,
        Arc::new(handler),
        checkpoint,
        shutdown,
        query,
    )
    .context("Failed to build engine")?;

    orchestrator.run().await.context("Run aborted")
}

/// A reply that satisfies the content type's own rules
fn dry_run_reply(content: &ContentTypeConfig) -> String {
    let mut reply = serde_json::Map::new();
    for output in &content.outputs {
        let counted = content
            .expected_count
            .as_ref()
            .filter(|rule| rule.reply_key == output.reply_key);
        let ranged = content.ranges.iter().find(|rule| rule.reply_key == output.reply_key);

        let value = match (counted, ranged) {
            (Some(rule), _) => Value::Array(vec![json!("dry-run"); rule.count]),
            (None, Some(rule)) => json!(rule.min.or(rule.max).unwrap_or(0.0)),
            (None, None) => json!("dry-run"),
        };
        reply.insert(output.reply_key.clone(), value);
    }
    Value::Object(reply).to_string()
}

fn print_summary(summary: &RunSummary) {
    let heading = if summary.was_cancelled {
        "Run interrupted".yellow().bold()
    } else {
        "Run complete".green().bold()
    };
    println!("{}", heading);
    println!("  {:<18} {}", "Selected:", summary.selected);
    println!("  {:<18} {}", "Succeeded:", summary.succeeded.to_string().green());
    println!("  {:<18} {}", "Failed:", format_count(summary.failed));
    println!("  {:<18} {}", "Persisted:", summary.persisted);
    if summary.persist_failures > 0 {
        println!("  {:<18} {}", "Write failures:", summary.persist_failures.to_string().red());
    }
    if summary.cancelled > 0 {
        println!("  {:<18} {}", "Unfinished:", summary.cancelled.to_string().yellow());
    }
    println!("  {:<18} {}", "Throttle events:", summary.throttle_events);
    println!("  {:<18} {:.1}%", "Success rate:", summary.success_rate);
    println!("  {:<18} {:.2} items/s", "Throughput:", summary.throughput);
    println!("  {:<18} {}", "Elapsed:", format_duration(summary.elapsed));
    if !summary.checkpoint_flushed {
        println!("{}", "Warning: final checkpoint write failed; finished items may be reprocessed".red());
    }
}

fn format_count(n: u64) -> ColoredString {
    if n > 0 { n.to_string().red() } else { n.to_string().normal() }
}

async fn handle_status_command(content_type: &str, config: &Config) -> Result<()> {
    let content = config.content_type(content_type)?;
    let path = config.checkpoint_path(&content.name);
    info!("Showing status for '{}' from {}", content.name, path.display());

    println!("{} {}", "Status for:".green(), content.name);
    let record = read_record(&path).context("Failed to read checkpoint")?;
    let processed: Vec<String> = match &record {
        Some(record) => {
            println!("  {:<18} {}", "Processed:", record.processed_ids.len());
            println!("  {:<18} {}", "Failed:", format_count(record.failed_ids.len() as u64));
            println!("  {:<18} {}", "Started:", record.stats.start_time.to_rfc3339());
            println!("  {:<18} {}", "Last checkpoint:", record.timestamp.to_rfc3339());
            println!(
                "  {:<18} {} ok / {} failed",
                "Outcomes:", record.stats.success_count, record.stats.failure_count
            );
            record.processed_ids.iter().cloned().collect()
        }
        None => {
            println!("  {}", "No checkpoint yet".dimmed());
            Vec::new()
        }
    };

    if config.store.path.exists() {
        let store = SqliteStore::open(&config.store.path, &config.store.table).context("Failed to open store")?;
        let pending = store
            .count_pending(&content.work_query().excluding(processed))
            .await
            .context("Failed to count pending documents")?;
        println!("  {:<18} {}", "Pending:", pending);
    }
    Ok(())
}

async fn handle_reset_command(content_type: &str, failed_only: bool, config: &Config) -> Result<()> {
    let content = config.content_type(content_type)?;
    let path = config.checkpoint_path(&content.name);

    if failed_only {
        let store = CheckpointStore::load(&path, config.engine.checkpoint_interval).context("Failed to load checkpoint")?;
        let cleared = store.clear_failed();
        store.persist().await.context("Failed to write checkpoint")?;
        info!("Cleared {} failures from {}", cleared, path.display());
        println!("{} cleared {} failed ids for {}", "Reset:".green(), cleared, content.name);
    } else if CheckpointStore::delete(&path).context("Failed to delete checkpoint")? {
        info!("Deleted checkpoint {}", path.display());
        println!("{} deleted checkpoint for {}", "Reset:".green(), content.name);
    } else {
        println!("{} no checkpoint for {}", "Reset:".yellow(), content.name);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the level is known
    setup_logging(cli.is_verbose(), config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchforge::domain::{ResponseValidator, WorkItem};

    fn content(yaml: &str) -> ContentTypeConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_dry_run_reply_satisfies_rules() {
        let content = content(
            r#"
name: tags
prompt_template: "Tag {{title}}"
outputs:
  - reply_key: tags
    target: ai_tags
  - reply_key: score
    target: ai_score
expected_count:
  reply_key: tags
  count: 2
ranges:
  - reply_key: score
    min: 1
    max: 10
"#,
        );
        let reply = dry_run_reply(&content);
        let handler = TemplateHandler::new(content, "m", &serde_json::Map::new());
        let item = WorkItem::new("a", json!({"title": "x"}));

        let result = handler.validate(&RawReply::new(reply), &item).unwrap();
        assert_eq!(result.update_fields["ai_tags"], json!(["dry-run", "dry-run"]));
        assert_eq!(result.update_fields["ai_score"], json!(1.0));
    }

    #[test]
    fn test_scratch_checkpoint_removal_survives_io_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("batchforge-dry-run-tags.json");
        fs::create_dir(&blocker).unwrap();

        assert!(CheckpointStore::delete(&blocker).is_err());
        remove_scratch_checkpoint(&blocker);
        assert!(blocker.is_dir());

        let file = dir.path().join("scratch.json");
        fs::write(&file, "{}").unwrap();
        remove_scratch_checkpoint(&file);
        assert!(!file.exists());
    }
}
