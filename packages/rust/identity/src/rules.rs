//! Name and address consistency rules for directory candidates.

use std::sync::LazyLock;

use recordflow_shared::{DirectoryRecord, IdentityConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Leading street number, e.g. `100` in `100 Oak St`.
static STREET_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)").unwrap_or_else(|e| panic!("invalid street number pattern: {e}"))
});

/// Why a lookup ended without a usable match. Persisted in cache markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    /// The directory returned no candidate for the query.
    NoCandidate,
    /// A candidate id was returned but its details were not.
    NoDetails,
    NameMismatch,
    AddressMismatch,
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoCandidate => "no directory candidate",
            Self::NoDetails => "candidate details unavailable",
            Self::NameMismatch => "name mismatch",
            Self::AddressMismatch => "street number mismatch",
        })
    }
}

/// Thresholds applied to every candidate, including cached ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchRules {
    /// Minimum normalized similarity when neither name contains the other.
    pub similarity_threshold: f64,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self::from(&IdentityConfig::default())
    }
}

impl From<&IdentityConfig> for MatchRules {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
        }
    }
}

impl MatchRules {
    /// Check `candidate` against the declared name and street.
    ///
    /// Both the name rule and the street-number rule must pass.
    pub fn validate(
        &self,
        declared_name: &str,
        declared_street: Option<&str>,
        candidate: &DirectoryRecord,
    ) -> Result<(), MismatchReason> {
        let similarity = name_similarity(declared_name, &candidate.name);
        if !name_matches(declared_name, &candidate.name, self.similarity_threshold) {
            tracing::info!(
                declared = declared_name,
                candidate = %candidate.name,
                similarity,
                threshold = self.similarity_threshold,
                "directory candidate rejected: name"
            );
            return Err(MismatchReason::NameMismatch);
        }

        let declared_number = declared_street.and_then(street_number);
        let candidate_number = candidate.address.as_deref().and_then(street_number);
        if let (Some(declared), Some(found)) = (declared_number, candidate_number) {
            if declared != found {
                tracing::info!(
                    declared,
                    candidate = found,
                    candidate_address = candidate.address.as_deref().unwrap_or_default(),
                    "directory candidate rejected: street number"
                );
                return Err(MismatchReason::AddressMismatch);
            }
        }

        tracing::debug!(
            declared = declared_name,
            candidate = %candidate.name,
            similarity,
            declared_number,
            candidate_number,
            "directory candidate accepted"
        );
        Ok(())
    }
}

/// Case-insensitive containment in either direction, else similarity ≥ threshold.
///
/// Blank names never match.
pub fn name_matches(declared: &str, candidate: &str, threshold: f64) -> bool {
    let declared = normalize_name(declared);
    let candidate = normalize_name(candidate);
    if declared.is_empty() || candidate.is_empty() {
        return false;
    }
    if declared.contains(&candidate) || candidate.contains(&declared) {
        return true;
    }
    strsim::normalized_levenshtein(&declared, &candidate) >= threshold
}

/// Normalized edit-distance similarity of two names in `[0, 1]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

/// The leading numeric token of an address line, if any.
pub fn street_number(address: &str) -> Option<&str> {
    STREET_NUMBER
        .captures(address)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
