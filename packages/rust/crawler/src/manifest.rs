//! Per-domain crawl manifest (`metadata.json`).
//!
//! The manifest's presence marks a domain as crawled; the engine returns it
//! unchanged instead of crawling again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use recordflow_shared::store::{read_json, write_json_atomic};
use recordflow_shared::{Asset, CrawlManifest, Result};

pub const MANIFEST_FILE: &str = "metadata.json";

/// Location of the manifest inside a domain directory.
pub fn manifest_path(domain_dir: &Path) -> PathBuf {
    domain_dir.join(MANIFEST_FILE)
}

/// Read a manifest. `Ok(None)` means the domain has not been crawled.
pub fn load_manifest(path: &Path) -> Result<Option<CrawlManifest>> {
    read_json(path)
}

/// Deduplicate assets by source URL, then persist atomically.
///
/// `assets_found` is recomputed from the deduplicated list.
pub fn write_manifest(path: &Path, mut manifest: CrawlManifest) -> Result<CrawlManifest> {
    manifest.assets = dedupe_assets(std::mem::take(&mut manifest.assets));
    manifest.assets_found = manifest.assets.len();
    write_json_atomic(path, &manifest)?;
    Ok(manifest)
}

/// Keep the first asset seen for each source URL, preserving order.
pub fn dedupe_assets(assets: Vec<Asset>) -> Vec<Asset> {
    let mut seen = HashSet::new();
    assets
        .into_iter()
        .filter(|asset| seen.insert(asset.original_url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use recordflow_shared::AssetKind;
    use uuid::Uuid;

    use super::*;

    fn asset(kind: AssetKind, url: &str, path: &str) -> Asset {
        Asset {
            kind,
            original_url: url.into(),
            local_path: path.into(),
        }
    }

    #[test]
    fn duplicates_collapse_to_first() {
        let assets = vec![
            asset(AssetKind::Image, "https://s.example/a.jpg", "assets/img_a.jpg"),
            asset(AssetKind::Text, "https://s.example/", "content_1.txt"),
            asset(AssetKind::Image, "https://s.example/a.jpg", "assets/img_a2.jpg"),
        ];
        let deduped = dedupe_assets(assets);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].local_path, PathBuf::from("assets/img_a.jpg"));
    }

    #[test]
    fn write_and_reload() {
        let dir = std::env::temp_dir().join(format!("rf-manifest-{}", Uuid::now_v7()));
        let path = manifest_path(&dir);
        assert!(load_manifest(&path).unwrap().is_none());

        let manifest = CrawlManifest {
            root_url: "https://s.example/".into(),
            timestamp: Utc::now(),
            pages_crawled: 2,
            assets_found: 99,
            assets: vec![
                asset(AssetKind::Document, "https://s.example/h.pdf", "assets/doc_h.pdf"),
                asset(AssetKind::Document, "https://s.example/h.pdf", "assets/doc_h.pdf"),
            ],
        };
        let written = write_manifest(&path, manifest).unwrap();
        assert_eq!(written.assets_found, 1);

        let reloaded = load_manifest(&path).unwrap().expect("manifest present");
        assert_eq!(reloaded, written);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["assets"][0]["type"], "document");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
