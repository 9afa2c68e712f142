//! Reduce a crawl manifest to a bounded asset set for synthesis.
//!
//! Images go to the ranking collaborator (first-N fallback on failure),
//! documents are ordered by URL keywords, and page text is merged into a
//! single `cleaned_content.txt` with site boilerplate removed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use recordflow_shared::{
    Asset, AssetKind, BackoffPolicy, CrawlManifest, RawStats, RecordFlowError, RefineConfig,
    RefinedAssets, Result, Usage, with_backoff,
};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::services::RankingService;

/// Merged page text, written next to the page text files.
pub const CLEANED_TEXT_FILE: &str = "cleaned_content.txt";

/// Images at or below this size are skipped before ranking.
const MIN_RANKED_IMAGE_BYTES: u64 = 5000;

const DOCUMENT_PRIORITY_KEYWORDS: &[&str] = &[
    "handbook", "policy", "parent", "tuition", "rates", "enroll", "schedule", "calendar",
];
const DOCUMENT_LOW_KEYWORDS: &[&str] = &["menu", "lunch", "flyer", "news", "update"];

const TRUNCATION_MARKER: &str = "\n...[Truncated]...";

static NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)copyright \d{4}|all rights reserved|privacy policy|terms of use|cookie policy|subscribe to our newsletter|follow us on|menu|navigation|skip to content|search this site|sign in|log in|cart \(\d+\)",
    )
    .unwrap_or_else(|e| panic!("invalid noise pattern: {e}"))
});

/// Refined assets plus the ranking usage spent producing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub assets: RefinedAssets,
    pub usage: Option<Usage>,
}

/// Shared by all workers; holds no per-record state.
pub struct AssetRefiner {
    ranking: Arc<dyn RankingService>,
    config: RefineConfig,
    backoff: BackoffPolicy,
}

impl AssetRefiner {
    pub fn new(ranking: Arc<dyn RankingService>, config: RefineConfig, backoff: BackoffPolicy) -> Self {
        Self {
            ranking,
            config,
            backoff,
        }
    }

    #[instrument(skip_all, fields(root = %manifest.root_url))]
    pub async fn refine(&self, manifest: &CrawlManifest) -> Result<Refinement> {
        let images: Vec<PathBuf> = manifest
            .assets_of(AssetKind::Image)
            .map(|a| a.local_path.clone())
            .collect();
        let documents: Vec<&Asset> = manifest.assets_of(AssetKind::Document).collect();
        let texts: Vec<PathBuf> = manifest
            .assets_of(AssetKind::Text)
            .map(|a| a.local_path.clone())
            .collect();

        let raw_stats = RawStats {
            original_images: images.len(),
            original_documents: documents.len(),
            original_text_files: texts.len(),
        };

        let (verified_images, usage) = self.select_images(&images).await;
        let document_assets = select_documents(&documents, self.config.document_top_n);

        let derived_body_text_path = match texts.first().and_then(|p| p.parent()) {
            Some(dir) => {
                let output = dir.join(CLEANED_TEXT_FILE);
                let max_chars = self.config.max_text_chars;
                let files = texts.clone();
                tokio::task::spawn_blocking(move || write_consolidated(&files, &output, max_chars))
                    .await
                    .map_err(|e| RecordFlowError::Storage(format!("text consolidation task: {e}")))??
            }
            None => None,
        };

        info!(
            images = verified_images.len(),
            documents = document_assets.len(),
            text = derived_body_text_path.is_some(),
            "assets refined"
        );

        Ok(Refinement {
            assets: RefinedAssets {
                root_url: manifest.root_url.clone(),
                timestamp: Utc::now(),
                verified_images,
                document_assets,
                derived_body_text_path,
                raw_stats,
            },
            usage,
        })
    }

    /// Deduplicate, drop missing or tiny files, then rank down to `image_top_n`.
    async fn select_images(&self, images: &[PathBuf]) -> (Vec<PathBuf>, Option<Usage>) {
        let top_n = self.config.image_top_n;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for path in images {
            if !seen.insert(path.clone()) {
                continue;
            }
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() > MIN_RANKED_IMAGE_BYTES => candidates.push(path.clone()),
                Ok(meta) => debug!(path = %path.display(), bytes = meta.len(), "image too small to rank"),
                Err(_) => debug!(path = %path.display(), "image missing, skipped"),
            }
        }

        if candidates.len() <= top_n {
            return (candidates, None);
        }

        let ranking = &self.ranking;
        let ranked = with_backoff("ranking.rank_images", &self.backoff, || {
            ranking.rank_images(&candidates, top_n)
        })
        .await;

        match ranked {
            Ok(response) => {
                let known: HashSet<&PathBuf> = candidates.iter().collect();
                let mut picked = HashSet::new();
                let selected: Vec<PathBuf> = response
                    .payload
                    .into_iter()
                    .filter(|p| known.contains(p) && picked.insert(p.clone()))
                    .take(top_n)
                    .collect();
                if selected.is_empty() {
                    warn!("ranking returned no known images, using first {top_n}");
                    candidates.truncate(top_n);
                    return (candidates, response.usage);
                }
                (selected, response.usage)
            }
            Err(e) => {
                warn!(error = %e, "image ranking failed, using first {top_n}");
                candidates.truncate(top_n);
                (candidates, None)
            }
        }
    }
}

/// Keyword score of a document URL: +2 per priority keyword, -1 per low one.
pub fn document_score(url: &str) -> i32 {
    let url = url.to_lowercase();
    let priority = DOCUMENT_PRIORITY_KEYWORDS
        .iter()
        .filter(|kw| url.contains(*kw))
        .count() as i32;
    let low = DOCUMENT_LOW_KEYWORDS
        .iter()
        .filter(|kw| url.contains(*kw))
        .count() as i32;
    priority * 2 - low
}

/// Highest-scoring documents first; ties keep discovery order.
pub fn select_documents(documents: &[&Asset], top_n: usize) -> Vec<PathBuf> {
    let mut scored: Vec<(i32, &Asset)> = documents
        .iter()
        .map(|asset| {
            let key = if asset.original_url.is_empty() {
                asset
                    .local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                asset.original_url.clone()
            };
            (document_score(&key), *asset)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(top_n)
        .map(|(_, asset)| asset.local_path.clone())
        .collect()
}

/// Merge page text files into one body.
///
/// Lines present in more than `max(2, files / 2)` files are treated as site
/// chrome. Short lines survive only as headers. Returns `None` when nothing
/// is left.
pub fn consolidate_text(files: &[PathBuf], max_chars: usize) -> Option<String> {
    let mut per_file: Vec<(&Path, Vec<String>)> = Vec::with_capacity(files.len());
    let mut line_counts: HashMap<String, usize> = HashMap::new();

    for path in files {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read page text");
                continue;
            }
        };
        let lines: Vec<String> = content
            .lines()
            .filter(|l| !l.starts_with("URL:"))
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        let distinct: HashSet<&String> = lines.iter().collect();
        for line in distinct {
            *line_counts.entry(line.clone()).or_default() += 1;
        }
        per_file.push((path.as_path(), lines));
    }

    let threshold = (files.len() as f64 * 0.5).max(2.0);
    let boilerplate: HashSet<&String> = line_counts
        .iter()
        .filter(|(_, count)| **count as f64 > threshold)
        .map(|(line, _)| line)
        .collect();
    debug!(lines = boilerplate.len(), threshold, "boilerplate identified");

    let mut sections: Vec<String> = Vec::new();
    for (path, lines) in &per_file {
        let kept: Vec<&String> = lines
            .iter()
            .filter(|l| !boilerplate.contains(l))
            .filter(|l| keep_line(l))
            .collect();
        if kept.is_empty() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        sections.push(format!("--- Source: {name} ---"));
        sections.extend(kept.into_iter().cloned());
        sections.push("\n".to_string());
    }

    if sections.is_empty() {
        return None;
    }
    let mut body = sections.join("\n");
    if let Some((cut, _)) = body.char_indices().nth(max_chars) {
        body.truncate(cut);
        body.push_str(TRUNCATION_MARKER);
    }
    Some(body)
}

fn keep_line(line: &str) -> bool {
    if NOISE.is_match(line) {
        return false;
    }
    if line.split_whitespace().count() >= 4 {
        return true;
    }
    let is_caps_header = line.len() > 5
        && line.chars().any(char::is_alphabetic)
        && !line.chars().any(char::is_lowercase);
    line.ends_with(':') || is_caps_header
}

/// Consolidate `files` into `output`. `Ok(None)` when no text survives.
pub fn write_consolidated(files: &[PathBuf], output: &Path, max_chars: usize) -> Result<Option<PathBuf>> {
    let Some(body) = consolidate_text(files, max_chars) else {
        return Ok(None);
    };
    std::fs::write(output, &body).map_err(|e| RecordFlowError::io(output, e))?;
    debug!(path = %output.display(), chars = body.chars().count(), "consolidated text written");
    Ok(Some(output.to_path_buf()))
}
