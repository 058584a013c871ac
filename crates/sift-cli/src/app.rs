//! The `sift` application.
//!
//! [`SiftApp`] owns the loaded configuration and builds the store,
//! provider, health monitor, sync services, and search service that each
//! command needs.

use std::sync::Arc;

use chrono::Utc;
use sift_core::{
    ContentSource, EmbeddingJob, Error, JobStatus, JobType, MemoryContentSource, Result, priority,
};
use sift_embed::{EmbeddingProvider, create_provider};
use sift_search::{HitSource, HybridSearchService, SearchOptions, SearchResponse};
use sift_store::{CancelOutcome, EnqueueOutcome, JobStore, RedbStore};
use sift_sync::{
    EmbeddingService, HealthMonitor, JobProcessor, ProcessStats, ProcessorSettings, SyncContext,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{CliArgs, Command, EntityArgs, SourceArgs};
use crate::config::SiftConfig;
use crate::config_handlers;
use crate::content_dir::DirectoryContentSource;

/// Initialise tracing-based logging.
///
/// Uses `RUST_LOG` if set, otherwise a level chosen from the verbosity flags.
pub fn init_logging(verbose: bool, quiet: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if quiet {
        EnvFilter::new("warn")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    // Ignore error if a subscriber is already set (e.g. in tests).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Parse-level entry point: logging, config commands, then everything that
/// needs a loaded configuration.
pub async fn run(args: CliArgs) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    match args.command {
        Some(Command::Config(cmd)) => {
            config_handlers::handle_config_command(args.config.as_deref(), cmd.command)
        }
        Some(command) => {
            let app = SiftApp::new(SiftConfig::load(args.config.as_deref())?);
            app.execute(command).await
        }
        None => {
            println!("sift {} - use --help for usage", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ============================================================================
// SiftApp
// ============================================================================

/// The store, provider, and monitor shared by one command invocation.
struct Runtime {
    store: Arc<RedbStore>,
    provider: Arc<dyn EmbeddingProvider>,
    monitor: Arc<HealthMonitor>,
}

/// A configured `sift` application.
pub struct SiftApp {
    config: SiftConfig,
}

impl SiftApp {
    /// Create an application from a validated configuration.
    pub fn new(config: SiftConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    /// Run one non-config command.
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Config(_) => Err(Error::invalid_state(
                "config commands are handled before the application is built",
            )),
            Command::Enqueue { entity, priority } => self.cmd_enqueue(entity, priority).await,
            Command::Status { entity, json } => self.cmd_status(entity, json).await,
            Command::Jobs { status, limit } => self.cmd_jobs(status, limit).await,
            Command::Cancel { entity } => self.cmd_cancel(entity).await,
            Command::Health { probe } => self.cmd_health(probe).await,
            Command::Stats { json } => self.cmd_stats(json).await,
            Command::Sync { source, full } => self.cmd_sync(source, full).await,
            Command::Run { source, once } => self.cmd_run(source, once).await,
            Command::Search {
                source,
                query,
                limit,
                json,
            } => self.cmd_search(source, &query, limit, json).await,
        }
    }

    // ------------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------------

    async fn runtime(&self) -> Result<Runtime> {
        let path = self.config.database_path()?;
        let store = Arc::new(RedbStore::open(&path)?);

        if let Some(retention) = self.config.store.retention() {
            let pruned = store.prune_terminal(Utc::now() - retention).await?;
            if pruned > 0 {
                info!(pruned, "Pruned finished jobs past retention");
            }
        }

        let provider = create_provider(&self.config.provider)?;
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&provider),
            store.clone(),
            self.config.health.clone(),
        ));
        Ok(Runtime {
            store,
            provider,
            monitor,
        })
    }

    fn context(&self, rt: &Runtime, content: Arc<dyn ContentSource>) -> SyncContext {
        SyncContext::new(
            rt.store.clone(),
            rt.store.clone(),
            content,
            Arc::clone(&rt.provider),
            Arc::clone(&rt.monitor),
        )
    }

    /// A service for commands that never read entity content.
    fn service(&self, rt: &Runtime) -> EmbeddingService {
        let ctx = self.context(rt, Arc::new(MemoryContentSource::new()));
        EmbeddingService::new(ctx, self.config.retry.max_retries)
    }

    fn processor(&self, ctx: SyncContext) -> Result<JobProcessor> {
        let settings = ProcessorSettings {
            jobs: self.config.jobs.clone(),
            retry: self.config.retry.clone(),
            chunking: self.config.chunking.clone(),
            embed_batch_size: self.config.provider.batch_size,
        };
        JobProcessor::new(ctx, settings)
    }

    // ------------------------------------------------------------------------
    // Job commands
    // ------------------------------------------------------------------------

    async fn cmd_enqueue(&self, entity: EntityArgs, priority: Option<i32>) -> Result<()> {
        let rt = self.runtime().await?;
        let outcome = self
            .service(&rt)
            .enqueue_embedding_job(
                entity.entity_type,
                &entity.entity_id,
                priority.unwrap_or(priority::USER),
            )
            .await?;
        match outcome {
            EnqueueOutcome::Created(job) => {
                println!("Queued job {} for {} (priority {})", job.id, job.key, job.priority);
            }
            EnqueueOutcome::Merged(job) => {
                println!(
                    "Merged into job {} for {} ({}, priority {})",
                    job.id, job.key, job.status, job.priority
                );
            }
        }
        Ok(())
    }

    async fn cmd_status(&self, entity: EntityArgs, json: bool) -> Result<()> {
        let rt = self.runtime().await?;
        let job = self
            .service(&rt)
            .get_job_status(entity.entity_type, &entity.entity_id)
            .await?;
        let Some(job) = job else {
            return Err(Error::not_found(format!(
                "no job for {} #{}",
                entity.entity_type, entity.entity_id
            )));
        };
        if json {
            println!("{}", to_json(&job)?);
        } else {
            print_job_detail(&job);
        }
        Ok(())
    }

    async fn cmd_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<()> {
        let rt = self.runtime().await?;
        let jobs = rt.store.list_jobs(status, limit).await?;
        if jobs.is_empty() {
            println!("No jobs.");
            return Ok(());
        }
        println!(
            "{:>6}  {:<13}  {:>4}  {:>7}  ENTITY",
            "ID", "STATUS", "PRI", "RETRIES"
        );
        for job in &jobs {
            println!(
                "{:>6}  {:<13}  {:>4}  {:>3}/{:<3}  {}",
                job.id,
                job.status.as_str(),
                job.priority,
                job.retry_count,
                job.max_retries,
                job.key
            );
        }
        Ok(())
    }

    async fn cmd_cancel(&self, entity: EntityArgs) -> Result<()> {
        let rt = self.runtime().await?;
        let outcome = self
            .service(&rt)
            .cancel_job(entity.entity_type, &entity.entity_id)
            .await?;
        match outcome {
            CancelOutcome::Cancelled(job) => println!("Cancelled job {} for {}", job.id, job.key),
            CancelOutcome::Deferred(job) => println!(
                "Job {} for {} is running; it will be cancelled if it is requeued",
                job.id, job.key
            ),
            CancelOutcome::NotFound => println!(
                "No active job for {} #{}",
                entity.entity_type, entity.entity_id
            ),
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Provider and store commands
    // ------------------------------------------------------------------------

    async fn cmd_health(&self, probe: bool) -> Result<()> {
        let rt = self.runtime().await?;
        let rows = if probe {
            vec![rt.monitor.probe().await]
        } else {
            self.service(&rt).get_provider_health().await?
        };
        if rows.is_empty() {
            println!("No health checks recorded. Run `sift health --probe`.");
            return Ok(());
        }
        for row in rows {
            let state = if row.is_available {
                "available"
            } else {
                "unavailable"
            };
            let checked = row
                .last_check_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!("{}: {state} (last check {checked})", row.provider);
            if row.consecutive_failures > 0 {
                println!("  consecutive failures: {}", row.consecutive_failures);
            }
            if let Some(error) = &row.last_error {
                println!("  last error: {error}");
            }
        }
        Ok(())
    }

    async fn cmd_stats(&self, json: bool) -> Result<()> {
        let rt = self.runtime().await?;
        let stats = self.service(&rt).stats().await?;
        if json {
            println!("{}", to_json(&stats)?);
            return Ok(());
        }
        println!("Provider: {} (model {})", stats.provider, stats.model);
        println!(
            "Jobs: {} pending, {} in progress, {} retry pending, {} completed, {} failed, {} cancelled",
            stats.jobs.pending,
            stats.jobs.in_progress,
            stats.jobs.retry_pending,
            stats.jobs.completed,
            stats.jobs.failed,
            stats.jobs.cancelled
        );
        println!(
            "Chunks: {} across {} entities",
            stats.chunks.chunks, stats.chunks.entities
        );
        for (model, entities) in &stats.chunks.models {
            println!("  {model}: {entities} entities");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Content commands
    // ------------------------------------------------------------------------

    async fn cmd_sync(&self, source: SourceArgs, full: bool) -> Result<()> {
        let rt = self.runtime().await?;
        let content = Arc::new(DirectoryContentSource::new(&source.dir, source.entity_type)?);
        let service = EmbeddingService::new(
            self.context(&rt, content),
            self.config.retry.max_retries,
        );
        let job_type = if full {
            JobType::FullSync
        } else {
            JobType::Incremental
        };
        let summary = service
            .sync_corpus(Some(source.entity_type), job_type)
            .await?;
        println!(
            "Listed {} entities: {} queued, {} merged, {} already fresh",
            summary.listed, summary.created, summary.merged, summary.fresh
        );
        Ok(())
    }

    async fn cmd_run(&self, source: SourceArgs, once: bool) -> Result<()> {
        let rt = self.runtime().await?;
        let content = Arc::new(DirectoryContentSource::new(&source.dir, source.entity_type)?);
        let processor = self.processor(self.context(&rt, content))?;

        if once {
            let recovered = rt.store.recover_in_flight(Utc::now()).await?;
            if recovered > 0 {
                info!(recovered, "Recovered interrupted jobs");
            }
            let stats = processor.run_once().await?;
            print_process_stats(&stats);
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor_task = tokio::spawn(Arc::clone(&rt.monitor).run(shutdown_rx.clone()));
        let mut processor_task = tokio::spawn(Arc::new(processor).run(shutdown_rx));
        println!("Processing jobs from {} (Ctrl-C to stop)", source.dir.display());

        let joined = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                (&mut processor_task).await
            }
            joined = &mut processor_task => {
                let _ = shutdown_tx.send(true);
                joined
            }
        };
        let _ = monitor_task.await;

        let stats =
            joined.map_err(|e| Error::invalid_state(format!("processor task failed: {e}")))??;
        print_process_stats(&stats);
        Ok(())
    }

    async fn cmd_search(
        &self,
        source: SourceArgs,
        query: &str,
        limit: Option<usize>,
        json: bool,
    ) -> Result<()> {
        let rt = self.runtime().await?;
        let keyword = Arc::new(DirectoryContentSource::new(&source.dir, source.entity_type)?);
        let search = HybridSearchService::new(
            Arc::clone(&rt.provider),
            rt.store.clone(),
            keyword,
            self.config.search.clone(),
        )?;
        let options = SearchOptions {
            limit,
            entity_type: Some(source.entity_type),
            ..SearchOptions::default()
        };
        let response = search.search(query, &options).await?;
        if json {
            println!("{}", to_json(&response)?);
        } else {
            print_search_response(&response);
        }
        Ok(())
    }
}

// ============================================================================
// Output helpers
// ============================================================================

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn print_job_detail(job: &EmbeddingJob) {
    println!("Job {}: {}", job.id, job.key);
    println!("  status:   {}", job.status);
    println!("  type:     {:?}", job.job_type);
    println!("  priority: {}", job.priority);
    println!("  retries:  {}/{}", job.retry_count, job.max_retries);
    println!("  provider: {} ({})", job.provider, job.model);
    if let Some(at) = job.next_retry_at {
        println!("  next try: {}", at.to_rfc3339());
    }
    if job.paused_for_unavailability {
        println!("  paused until the provider is available");
    }
    if let Some(error) = &job.last_error {
        println!("  error:    {error}");
    }
}

fn print_process_stats(stats: &ProcessStats) {
    println!(
        "Claimed {}: {} embedded ({} chunks), {} skipped, {} removed, {} retried, {} paused, {} failed, {} cancelled",
        stats.claimed,
        stats.embedded,
        stats.chunks,
        stats.skipped,
        stats.removed,
        stats.retried,
        stats.paused,
        stats.failed,
        stats.cancelled
    );
    if stats.provider_unavailable {
        println!("Stopped early: provider unavailable");
    }
}

fn print_search_response(response: &SearchResponse) {
    if response.partial {
        let sides: Vec<String> = response.degraded.iter().map(|s| s.to_string()).collect();
        eprintln!("warning: partial results ({} unavailable)", sides.join(", "));
    }
    if response.hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in response.hits.iter().enumerate() {
        let source = match hit.source() {
            HitSource::Keyword => "keyword",
            HitSource::Vector => "vector",
            HitSource::Hybrid => "hybrid",
        };
        print!("{:>3}. {}  {:.5} [{source}]", i + 1, hit.key, hit.score);
        if let Some(similarity) = hit.similarity {
            print!(" sim {similarity:.3}");
        }
        println!();
        if let Some(snippet) = &hit.snippet {
            let line = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
            let short: String = line.chars().take(100).collect();
            println!("     {short}");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sift_core::{EntityKey, EntityType};
    use sift_embed::ProviderKind;
    use sift_store::VectorStore;

    fn app(dir: &std::path::Path) -> SiftApp {
        let mut config = SiftConfig::default();
        config.provider.kind = ProviderKind::Mock;
        config.provider.call_retries = 0;
        config.store.path = Some(dir.join("sift.redb"));
        SiftApp::new(config)
    }

    fn docs(dir: &std::path::Path) -> SourceArgs {
        let docs = dir.join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("ownership.md"), "Ownership moves values between bindings.")
            .unwrap();
        std::fs::write(docs.join("traits.md"), "Traits describe shared behaviour.").unwrap();
        SourceArgs {
            dir: docs,
            entity_type: EntityType::Documentation,
        }
    }

    fn open(dir: &std::path::Path) -> RedbStore {
        RedbStore::open(dir.join("sift.redb")).unwrap()
    }

    #[tokio::test]
    async fn test_sync_run_once_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let source = docs(dir.path());

        app.execute(Command::Sync {
            source: source.clone(),
            full: false,
        })
        .await
        .unwrap();
        app.execute(Command::Run {
            source: source.clone(),
            once: true,
        })
        .await
        .unwrap();

        {
            let store = open(dir.path());
            let key = EntityKey::new(EntityType::Documentation, "traits.md");
            let job = store.latest_job_for(&key).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert!(!store.entity_chunks(&key).await.unwrap().is_empty());
        }

        app.execute(Command::Search {
            source,
            query: "traits".to_string(),
            limit: Some(5),
            json: true,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_second_sync_skips_fresh_entities() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let source = docs(dir.path());

        for command in [
            Command::Sync {
                source: source.clone(),
                full: false,
            },
            Command::Run {
                source: source.clone(),
                once: true,
            },
            Command::Sync {
                source: source.clone(),
                full: false,
            },
        ] {
            app.execute(command).await.unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.job_counts().await.unwrap().active(), 0);
        assert_eq!(store.job_counts().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_enqueue_then_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let entity = EntityArgs {
            entity_type: EntityType::Flavor,
            entity_id: "spicy".to_string(),
        };

        app.execute(Command::Enqueue {
            entity: entity.clone(),
            priority: None,
        })
        .await
        .unwrap();
        app.execute(Command::Cancel {
            entity: entity.clone(),
        })
        .await
        .unwrap();

        let store = open(dir.path());
        let key = EntityKey::new(EntityType::Flavor, "spicy");
        let job = store.latest_job_for(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.priority, priority::USER);
    }

    #[tokio::test]
    async fn test_status_of_unknown_entity_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let result = app
            .execute(Command::Status {
                entity: EntityArgs {
                    entity_type: EntityType::Project,
                    entity_id: "nope".to_string(),
                },
                json: false,
            })
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_health_probe_persists() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        app.execute(Command::Health { probe: true }).await.unwrap();
        app.execute(Command::Stats { json: true }).await.unwrap();

        let store = open(dir.path());
        let rows = sift_store::HealthStore::list_health(&store).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_available);
    }

    #[tokio::test]
    async fn test_sync_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let result = app
            .execute(Command::Sync {
                source: SourceArgs {
                    dir: dir.path().join("missing"),
                    entity_type: EntityType::Documentation,
                },
                full: false,
            })
            .await;
        assert!(result.is_err());
    }
}
