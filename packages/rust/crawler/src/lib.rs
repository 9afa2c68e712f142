//! Bounded, heuristic website crawler with asset verification.
//!
//! This crate provides:
//! - [`Crawler`] : breadth-first crawl of one domain into a content store
//! - [`policy`] : which links are followed, plus SSRF protection
//! - [`extract`] : readable text, image, document, and link extraction
//! - [`verify`] : byte-size, pixel-size, and aspect-ratio gates for assets
//! - [`manifest`] : the per-domain `metadata.json`

pub mod engine;
pub mod extract;
pub mod manifest;
pub mod policy;
pub mod verify;

pub use engine::{Crawler, asset_file_name};
pub use extract::{PageAnalysis, analyze_page};
pub use manifest::{MANIFEST_FILE, load_manifest, write_manifest};
pub use policy::{LinkDecision, LinkPolicy, domain_of};
pub use verify::{AssetVerdict, Rejection, verify_asset};
