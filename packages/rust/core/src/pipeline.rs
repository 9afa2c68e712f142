//! Checkpointed enrichment pipeline: NDJSON in → identity → research → crawl
//! → refine → synthesis → NDJSON out.
//!
//! Records are read in index order and handed to a fixed pool of workers
//! over a bounded channel; each worker owns its own [`Crawler`]. Workers
//! finish out of order and report every completion to the [`Checkpoint`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use recordflow_crawler::Crawler;
use recordflow_identity::{
    DirectoryCache, IdentityMatcher, ListingMedia, MatchResult, MatchRules, MismatchReason, PlacesClient,
};
use recordflow_shared::{
    AppConfig, BackoffPolicy, CrawlConfig, CrawlStage, Record, RecordFlowError, ResearchPayload,
    Result, Stage, SynthesisPayload, Usage, with_backoff,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::checkpoint::{Checkpoint, load_checkpoint};
use crate::ledger::{CostLedger, PricingTable};
use crate::progress::{ProgressReporter, ProgressSnapshot, ProgressTracker};
use crate::refine::AssetRefiner;
use crate::services::{Collaborators, ResearchService, SynthesisService};
use crate::sinks::{OutputWriter, RetryLedger};

/// Runtime configuration for [`run_pipeline`], merged from config + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub retry: PathBuf,
    pub checkpoint: PathBuf,
    /// Root of the per-domain crawl store.
    pub content_store: PathBuf,
    pub workers: usize,
    /// Continue after the persisted checkpoint and append to the sinks.
    pub resume: bool,
    /// Process at most this many input lines.
    pub limit: Option<usize>,
    pub progress_interval: Duration,
    pub require_website: bool,
    pub crawl: CrawlConfig,
    pub backoff: BackoffPolicy,
    pub pricing: PricingTable,
}

impl PipelineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let paths = &config.paths;
        Self {
            input: paths.input.clone(),
            output: paths.output.clone(),
            retry: paths.retry.clone(),
            checkpoint: paths.checkpoint.clone(),
            content_store: paths.content_store.clone(),
            workers: config.pipeline.workers,
            resume: false,
            limit: None,
            progress_interval: Duration::from_secs(config.pipeline.progress_interval_secs),
            require_website: config.pipeline.require_website,
            crawl: CrawlConfig::from(config),
            backoff: BackoffPolicy::from(&config.services),
            pricing: PricingTable::from(&config.pricing),
        }
    }
}

/// Long-lived collaborators shared by every worker.
#[derive(Clone)]
pub struct Services {
    pub matcher: Arc<IdentityMatcher>,
    pub research: Arc<dyn ResearchService>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub refiner: Arc<AssetRefiner>,
}

impl Services {
    /// Wire the production collaborators. Fails when the directory API key
    /// is missing.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let backoff = BackoffPolicy::from(&config.services);
        let directory = PlacesClient::from_config(&config.identity)?;
        let matcher = IdentityMatcher::new(
            Arc::new(directory),
            DirectoryCache::new(&config.paths.directory_cache),
            MatchRules::from(&config.identity),
            backoff,
        )
        .with_media(ListingMedia::from_config(config));
        let collaborators = Collaborators::from_config(&config.services)?;
        let refiner = AssetRefiner::new(collaborators.ranking, config.refine.clone(), backoff);

        Ok(Self {
            matcher: Arc::new(matcher),
            research: collaborators.research,
            synthesis: collaborators.synthesis,
            refiner: Arc::new(refiner),
        })
    }
}

/// Why a record was left out of the output.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    NoDirectoryMatch(MismatchReason),
    /// Directory status missing or not operating.
    Inactive(Option<String>),
    NoWebsite,
    InvalidInput,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDirectoryMatch(reason) => write!(f, "no directory match ({reason})"),
            Self::Inactive(Some(status)) => write!(f, "business status {status}"),
            Self::Inactive(None) => f.write_str("business status unknown"),
            Self::NoWebsite => f.write_str("no usable website"),
            Self::InvalidInput => f.write_str("invalid input record"),
        }
    }
}

/// Terminal outcome of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Appended to the output. `retried` names an earlier stage whose
    /// failure also went to the retry ledger.
    Written { retried: Option<Stage> },
    /// Filtered out; nothing persisted.
    Dropped(DropReason),
    /// Sent to the retry ledger at this stage and not written.
    Retried(Stage),
}

/// Everything a worker needs besides its crawler.
pub struct StageContext {
    pub services: Services,
    pub output: OutputWriter,
    pub retry: RetryLedger,
    pub ledger: CostLedger,
    pub progress: ProgressTracker,
    pub backoff: BackoffPolicy,
    pub require_website: bool,
}

impl StageContext {
    fn send_to_retry(&self, original: &Record, stage: Stage, error: impl ToString) -> Result<()> {
        self.retry.record(original, stage, error)?;
        self.progress.record_retry_entry();
        Ok(())
    }
}

/// Drive one record through every stage.
///
/// `Err` is reserved for failures outside the stage policy (a sink that
/// cannot be written, an unreadable cache); the caller drops the record.
#[instrument(skip_all, fields(record_id = %record.id))]
pub async fn process_record(
    record: Record,
    crawler: &Crawler,
    ctx: &StageContext,
) -> Result<RecordOutcome> {
    if record.name.trim().is_empty() {
        info!("dropped: record has no name");
        return Ok(RecordOutcome::Dropped(DropReason::InvalidInput));
    }
    let original = record.clone();
    let mut record = record;

    // 1. Identity
    let resolved = ctx
        .services
        .matcher
        .resolve(&record.name, record.address.as_ref())
        .await;
    let directory = match resolved {
        Ok(MatchResult::Matched(directory)) => directory,
        Ok(MatchResult::NotFound(reason)) => {
            info!(%reason, "dropped: no directory match");
            return Ok(RecordOutcome::Dropped(DropReason::NoDirectoryMatch(reason)));
        }
        Err(RecordFlowError::Service(e)) => {
            warn!(stage = %Stage::Identity, error = %e, "directory lookup failed");
            ctx.send_to_retry(&original, Stage::Identity, &e)?;
            return Ok(RecordOutcome::Retried(Stage::Identity));
        }
        Err(e) => return Err(e),
    };

    // 2. Status
    if !directory.is_active() {
        info!(status = ?directory.business_status, "dropped: business not operating");
        return Ok(RecordOutcome::Dropped(DropReason::Inactive(
            directory.business_status.clone(),
        )));
    }
    record.directory = Some(directory);

    let website = record.usable_website();
    if website.is_none() && ctx.require_website {
        info!("dropped: no usable website");
        return Ok(RecordOutcome::Dropped(DropReason::NoWebsite));
    }

    // 3. Research
    let research = &ctx.services.research;
    let snapshot = &record;
    let researched = with_backoff("research", &ctx.backoff, || research.research(snapshot)).await;
    let mut retried = None;
    match researched {
        Ok(response) => {
            ctx.ledger.add(Stage::Research, response.usage);
            record.research = Some(ResearchPayload(response.payload));
        }
        Err(e) => {
            warn!(stage = %Stage::Research, error = %e, "research failed, continuing without it");
            ctx.send_to_retry(&original, Stage::Research, &e)?;
            retried = Some(Stage::Research);
        }
    }

    // 4. Crawl + refine
    let crawl = match website {
        Some(url) => crawl_and_refine(&url, crawler, ctx).await,
        None => {
            debug!("no usable website, skipping crawl");
            CrawlStage::Unavailable {
                reason: "no usable website".into(),
            }
        }
    };
    record.crawl = Some(crawl);

    // 5. Synthesis
    let synthesis = &ctx.services.synthesis;
    let snapshot = &record;
    let synthesized =
        with_backoff("synthesis", &ctx.backoff, || synthesis.synthesize(snapshot)).await;
    let failure = match synthesized {
        Ok(response) => {
            ctx.ledger.add(Stage::Finalize, response.usage);
            match response.payload {
                Value::Object(map) => {
                    record.synthesis = Some(SynthesisPayload(map));
                    None
                }
                other => Some(format!(
                    "synthesis payload is not a JSON object: {}",
                    json_kind(&other)
                )),
            }
        }
        Err(e) => Some(e.to_string()),
    };
    if let Some(message) = failure {
        warn!(stage = %Stage::Finalize, error = %message, "synthesis failed, record not written");
        ctx.send_to_retry(&original, Stage::Finalize, message)?;
        return Ok(RecordOutcome::Retried(Stage::Finalize));
    }

    // 6. Output
    ctx.output.write(&record)?;
    info!("record written");
    Ok(RecordOutcome::Written { retried })
}

/// Crawl failures never drop a record; they become an `Unavailable` payload.
async fn crawl_and_refine(url: &Url, crawler: &Crawler, ctx: &StageContext) -> CrawlStage {
    let manifest = match crawler.crawl(url).await {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(%url, error = %e, "crawl failed");
            return CrawlStage::Unavailable {
                reason: format!("crawl failed: {e}"),
            };
        }
    };
    if manifest.assets.is_empty() {
        info!(%url, pages = manifest.pages_crawled, "crawl found no usable assets");
        return CrawlStage::Unavailable {
            reason: "crawl found no usable assets".into(),
        };
    }

    match ctx.services.refiner.refine(&manifest).await {
        Ok(refinement) => {
            ctx.ledger.add(Stage::Crawl, refinement.usage);
            CrawlStage::Refined(refinement.assets)
        }
        Err(e) => {
            warn!(%url, error = %e, "asset refinement failed");
            CrawlStage::Unavailable {
                reason: format!("refinement failed: {e}"),
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// End-of-run totals.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// First input index handled by this run.
    pub start_index: usize,
    pub completed: usize,
    pub written: usize,
    /// Records with at least one retry-ledger entry.
    pub retried: usize,
    /// Records neither written nor retried.
    pub dropped: usize,
    /// Retry-ledger lines written (a record can produce two).
    pub retry_entries: usize,
    pub last_processed_index: i64,
    pub usage: BTreeMap<Stage, Usage>,
    pub cost_by_stage: BTreeMap<Stage, f64>,
    pub total_cost: f64,
    pub elapsed: Duration,
}

/// Run the whole input file through the pipeline.
///
/// 1. Resolve the start index (checkpoint + 1 on resume, else 0)
/// 2. Open the sinks (truncated on a fresh run)
/// 3. Feed `(index, record)` pairs to the worker pool
/// 4. Report progress on a timer until the pool drains
#[instrument(skip_all, fields(input = %config.input.display(), workers = config.workers, resume = config.resume))]
pub async fn run_pipeline(
    config: PipelineConfig,
    services: Services,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<RunSummary> {
    let started = Instant::now();
    if !config.input.is_file() {
        return Err(RecordFlowError::validation(format!(
            "input file not found: {}",
            config.input.display()
        )));
    }

    let last_processed = if config.resume {
        load_checkpoint(&config.checkpoint)
    } else {
        -1
    };
    let start_index = usize::try_from(last_processed + 1).unwrap_or(0);
    let available = count_lines(&config.input).await?;
    let total = available
        .saturating_sub(start_index)
        .min(config.limit.unwrap_or(usize::MAX));

    let truncate = !config.resume;
    let checkpoint = Arc::new(Checkpoint::new(&config.checkpoint, last_processed));
    if truncate {
        checkpoint.save()?;
    }

    let workers = config.workers.max(1);
    let mut crawlers = Vec::with_capacity(workers);
    for _ in 0..workers {
        crawlers.push(Crawler::new(config.crawl.clone(), &config.content_store)?);
    }

    let ctx = Arc::new(StageContext {
        services,
        output: OutputWriter::open(&config.output, truncate)?,
        retry: RetryLedger::open(&config.retry, truncate)?,
        ledger: CostLedger::new(config.pricing.clone()),
        progress: ProgressTracker::new(total),
        backoff: config.backoff,
        require_website: config.require_website,
    });

    info!(start_index, total, available, "starting pipeline");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let ticker = tokio::spawn(report_periodically(
        Arc::clone(&ctx),
        Arc::clone(&reporter),
        config.progress_interval,
        stop_rx,
    ));

    let (tx, rx) = mpsc::channel::<(i64, Record)>(workers * 2);
    let rx = Arc::new(Mutex::new(rx));
    let handles: Vec<_> = crawlers
        .into_iter()
        .enumerate()
        .map(|(worker, crawler)| {
            tokio::spawn(worker_loop(
                worker,
                crawler,
                Arc::clone(&rx),
                Arc::clone(&ctx),
                Arc::clone(&checkpoint),
            ))
        })
        .collect();

    let fed = feed(&config.input, start_index, total, &tx, &ctx, &checkpoint).await;
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task failed");
        }
    }
    let _ = stop_tx.send(());
    if let Err(e) = ticker.await {
        warn!(error = %e, "progress task failed");
    }
    fed?;

    let snapshot = ctx.progress.snapshot(ctx.ledger.total_cost());
    reporter.finish(&snapshot);
    Ok(summarize(&ctx, &checkpoint, start_index, snapshot, started.elapsed()))
}

/// Read `total` lines starting at `start_index` and queue the parsable ones.
/// Blank and malformed lines complete immediately.
async fn feed(
    input: &Path,
    start_index: usize,
    total: usize,
    tx: &mpsc::Sender<(i64, Record)>,
    ctx: &StageContext,
    checkpoint: &Checkpoint,
) -> Result<()> {
    let file = tokio::fs::File::open(input)
        .await
        .map_err(|e| RecordFlowError::io(input, e))?;
    let mut lines = BufReader::new(file).lines();

    let mut index = 0usize;
    let end = start_index.saturating_add(total);
    while index < end {
        let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| RecordFlowError::io(input, e))?
        else {
            break;
        };
        let current = index;
        index += 1;
        if current < start_index {
            continue;
        }
        let position = current as i64;

        let line = line.trim();
        let parsed = if line.is_empty() {
            Err("blank line".to_string())
        } else {
            serde_json::from_str::<Record>(line).map_err(|e| e.to_string())
        };
        match parsed {
            Ok(record) => {
                if tx.send((position, record)).await.is_err() {
                    return Err(RecordFlowError::Storage(
                        "all workers stopped before the input was consumed".into(),
                    ));
                }
            }
            Err(reason) => {
                warn!(index = position, %reason, "skipping invalid input line");
                ctx.progress.record_dropped();
                checkpoint.complete(position)?;
            }
        }
    }
    Ok(())
}

async fn worker_loop(
    worker: usize,
    crawler: Crawler,
    rx: Arc<Mutex<mpsc::Receiver<(i64, Record)>>>,
    ctx: Arc<StageContext>,
    checkpoint: Arc<Checkpoint>,
) {
    debug!(worker, "worker started");
    loop {
        let job = rx.lock().await.recv().await;
        let Some((index, record)) = job else {
            break;
        };
        let record_id = record.id.clone();

        let outcome = AssertUnwindSafe(process_record(record, &crawler, &ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(RecordOutcome::Written { retried })) => {
                ctx.progress.record_written(retried.is_some());
            }
            Ok(Ok(RecordOutcome::Dropped(reason))) => {
                debug!(%record_id, %reason, "record dropped");
                ctx.progress.record_dropped();
            }
            Ok(Ok(RecordOutcome::Retried(stage))) => {
                debug!(%record_id, %stage, "record sent to retry ledger");
                ctx.progress.record_retried();
            }
            Ok(Err(e)) => {
                error!(%record_id, index, error = %e, "record failed unexpectedly, dropped");
                ctx.progress.record_dropped();
            }
            Err(_) => {
                error!(%record_id, index, "record processing panicked, dropped");
                ctx.progress.record_dropped();
            }
        }

        if let Err(e) = checkpoint.complete(index) {
            warn!(index, error = %e, "failed to persist checkpoint");
        }
    }
    debug!(worker, "worker finished");
}

async fn report_periodically(
    ctx: Arc<StageContext>,
    reporter: Arc<dyn ProgressReporter>,
    every: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                reporter.report(&ctx.progress.snapshot(ctx.ledger.total_cost()));
            }
            _ = &mut stop => break,
        }
    }
}

async fn count_lines(path: &Path) -> Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| RecordFlowError::io(path, e))?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while lines
        .next_line()
        .await
        .map_err(|e| RecordFlowError::io(path, e))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}

fn summarize(
    ctx: &StageContext,
    checkpoint: &Checkpoint,
    start_index: usize,
    snapshot: ProgressSnapshot,
    elapsed: Duration,
) -> RunSummary {
    let usage = ctx.ledger.snapshot();
    let cost_by_stage: BTreeMap<Stage, f64> = usage
        .iter()
        .map(|(stage, usage)| (*stage, ctx.ledger.pricing().cost(*stage, *usage)))
        .collect();
    let total_cost = cost_by_stage.values().sum();

    info!(
        written = snapshot.written,
        retried = snapshot.retried,
        dropped = snapshot.dropped,
        retry_entries = snapshot.retry_entries,
        total_cost_usd = format_args!("{total_cost:.4}"),
        "pipeline finished"
    );

    RunSummary {
        start_index,
        completed: snapshot.completed,
        written: snapshot.written,
        retried: snapshot.retried,
        dropped: snapshot.dropped,
        retry_entries: snapshot.retry_entries,
        last_processed_index: checkpoint.last_processed(),
        usage,
        cost_by_stage,
        total_cost,
        elapsed,
    }
}
