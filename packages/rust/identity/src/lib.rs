//! Identity resolution against an external business directory.
//!
//! - [`IdentityMatcher`] : cached, re-validated lookups
//! - [`DirectoryClient`] / [`PlacesClient`] : the directory seam and its HTTP implementation
//! - [`rules`] : name similarity and street-number consistency
//! - [`cache`] : one JSON verdict per query hash
//! - [`ListingMedia`] : listing photos and street view for fresh matches

pub mod cache;
pub mod client;
pub mod matcher;
pub mod media;
pub mod rules;

pub use cache::{CacheEntry, DirectoryCache, NotFoundMarker, normalize_query};
pub use client::{DirectoryClient, PlacesClient};
pub use matcher::{IdentityMatcher, MatchResult};
pub use media::ListingMedia;
pub use rules::{MatchRules, MismatchReason, name_matches, street_number};
