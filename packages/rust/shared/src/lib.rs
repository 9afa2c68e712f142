//! Shared types, error model, and configuration for RecordFlow.
//!
//! This crate is the foundation depended on by all other RecordFlow crates.
//! It provides:
//! - [`RecordFlowError`] and [`ServiceError`] : the error types
//! - Domain types ([`Record`], [`DirectoryRecord`], [`CrawlManifest`], [`RetryEntry`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)
//! - [`store`] : atomic JSON file helpers
//! - [`retry`] : bounded exponential backoff for collaborator calls

pub mod config;
pub mod error;
pub mod retry;
pub mod store;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlSection, IdentityConfig, PathsConfig, PipelineSection,
    PricingConfig, Rate, RefineConfig, ServicesConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, read_api_key, validate_config,
};
pub use error::{RecordFlowError, Result, ServiceError};
pub use retry::{BackoffPolicy, with_backoff};
pub use types::{
    Address, Asset, AssetKind, CLOSED_PERMANENTLY, Contact, CrawlManifest, CrawlStage,
    DirectoryRecord, GeoPoint, Rating, RawStats, Record, RefinedAssets, ResearchPayload,
    RetryEntry, Stage, SynthesisPayload, Usage, parse_website,
};
