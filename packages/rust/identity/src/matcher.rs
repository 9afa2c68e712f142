//! Resolve a subject's declared name and address to a validated directory listing.

use std::sync::Arc;

use recordflow_shared::{
    Address, BackoffPolicy, DirectoryRecord, RecordFlowError, Result, with_backoff,
};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::cache::{CacheEntry, DirectoryCache, NotFoundMarker, normalize_query};
use crate::client::DirectoryClient;
use crate::media::ListingMedia;
use crate::rules::{MatchRules, MismatchReason};

/// Outcome of [`IdentityMatcher::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched(DirectoryRecord),
    NotFound(MismatchReason),
}

/// Directory lookups with a persistent verdict cache.
///
/// Shared by all pipeline workers. Concurrent lookups of the same query may
/// both reach the directory; both write the same verdict.
pub struct IdentityMatcher {
    client: Arc<dyn DirectoryClient>,
    cache: DirectoryCache,
    rules: MatchRules,
    backoff: BackoffPolicy,
    media: Option<ListingMedia>,
}

impl IdentityMatcher {
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        cache: DirectoryCache,
        rules: MatchRules,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            rules,
            backoff,
            media: None,
        }
    }

    /// Download listing photos for fresh matches before they are cached.
    pub fn with_media(mut self, media: ListingMedia) -> Self {
        self.media = Some(media);
        self
    }

    /// Resolve `name` at `address`.
    ///
    /// Cached "not found" verdicts return without a network call. Cached
    /// matches are re-validated against the current rules. Errors are
    /// directory failures that outlasted the retry policy; nothing is cached
    /// for them.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn resolve(&self, name: &str, address: Option<&Address>) -> Result<MatchResult> {
        let query = normalize_query(name, address);
        let key = DirectoryCache::key_for(&query);
        let street = address.and_then(|a| a.street.as_deref());

        match self.cache.get(&key) {
            Some(CacheEntry::NotFound(marker)) => {
                debug!(%query, reason = %marker.reason, "cached not-found verdict");
                return Ok(MatchResult::NotFound(marker.reason));
            }
            Some(CacheEntry::Matched(record)) => {
                return match self.rules.validate(name, street, &record) {
                    Ok(()) => {
                        debug!(%query, place_id = %record.place_id, "cached match still valid");
                        Ok(MatchResult::Matched(record))
                    }
                    Err(reason) => {
                        info!(%query, %reason, "cached match failed re-validation");
                        self.store_not_found(&key, &query, reason, Some(&record))?;
                        Ok(MatchResult::NotFound(reason))
                    }
                };
            }
            None => {}
        }

        let client = &self.client;
        let candidate_id = with_backoff("directory.search", &self.backoff, || {
            client.search(&query)
        })
        .await
        .map_err(RecordFlowError::from)?;

        let Some(candidate_id) = candidate_id else {
            info!(%query, "no directory candidate");
            self.store_not_found(&key, &query, MismatchReason::NoCandidate, None)?;
            return Ok(MatchResult::NotFound(MismatchReason::NoCandidate));
        };

        let details = with_backoff("directory.details", &self.backoff, || {
            client.details(&candidate_id)
        })
        .await
        .map_err(RecordFlowError::from)?;

        let Some(mut record) = details else {
            info!(%query, %candidate_id, "candidate details unavailable");
            self.store_not_found(&key, &query, MismatchReason::NoDetails, None)?;
            return Ok(MatchResult::NotFound(MismatchReason::NoDetails));
        };

        match self.rules.validate(name, street, &record) {
            Ok(()) => {
                info!(%query, place_id = %record.place_id, candidate = %record.name, "directory match");
                if let Some(media) = &self.media {
                    media.attach(&**client, &mut record).await;
                }
                self.cache.put(&key, &CacheEntry::Matched(record.clone()))?;
                Ok(MatchResult::Matched(record))
            }
            Err(reason) => {
                self.store_not_found(&key, &query, reason, Some(&record))?;
                Ok(MatchResult::NotFound(reason))
            }
        }
    }

    fn store_not_found(
        &self,
        key: &str,
        query: &str,
        reason: MismatchReason,
        candidate: Option<&DirectoryRecord>,
    ) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert("query".into(), Value::String(query.to_string()));
        if let Some(candidate) = candidate {
            metadata.insert("place_id".into(), Value::String(candidate.place_id.clone()));
            metadata.insert("candidate_name".into(), Value::String(candidate.name.clone()));
            if let Some(address) = &candidate.address {
                metadata.insert("candidate_address".into(), Value::String(address.clone()));
            }
        }
        self.cache
            .put(key, &CacheEntry::NotFound(NotFoundMarker::new(reason, metadata)))
    }
}
