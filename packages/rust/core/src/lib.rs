//! Pipeline orchestration for RecordFlow.
//!
//! This crate ties identity resolution, crawling, asset refinement, and the
//! external enrichment collaborators into a resumable batch run
//! ([`run_pipeline`]) with thread-safe sinks, a cost ledger, and progress
//! reporting.

pub mod checkpoint;
pub mod ledger;
pub mod pipeline;
pub mod progress;
pub mod refine;
pub mod services;
pub mod sinks;

pub use checkpoint::{Checkpoint, load_checkpoint};
pub use ledger::{CostLedger, PricingTable};
pub use pipeline::{
    DropReason, PipelineConfig, RecordOutcome, RunSummary, Services, StageContext,
    process_record, run_pipeline,
};
pub use progress::{LogProgress, ProgressReporter, ProgressSnapshot, ProgressTracker, SilentProgress};
pub use refine::{AssetRefiner, CLEANED_TEXT_FILE, Refinement};
pub use services::{
    Collaborators, HttpCollaborator, RankingService, ResearchService, StageResponse,
    SynthesisService, UnconfiguredService,
};
pub use sinks::{JsonlWriter, OutputWriter, RetryLedger};
