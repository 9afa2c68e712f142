//! Bounded breadth-first crawler for a single domain.
//!
//! The crawler starts from a root URL, visits at most `max_pages` pages no
//! deeper than `max_depth`, stores readable page text and verified assets
//! under `<content_root>/<domain>/`, and records them in a manifest.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use recordflow_shared::{Asset, AssetKind, CrawlConfig, CrawlManifest, RecordFlowError, Result};

use crate::extract::analyze_page;
use crate::manifest::{load_manifest, manifest_path, write_manifest};
use crate::policy::{LinkPolicy, domain_of, is_ssrf_target, normalize_url};
use crate::verify::{AssetVerdict, verify_asset};

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("RecordFlow/", env!("CARGO_PKG_VERSION"));

/// Image extensions kept as-is in stored file names.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

/// Crawls one domain at a time. Each pipeline worker owns its own instance.
pub struct Crawler {
    config: CrawlConfig,
    content_root: PathBuf,
    client: Client,
}

impl Crawler {
    /// Create a crawler that stores results under `content_root`.
    pub fn new(config: CrawlConfig, content_root: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.page_timeout_secs))
            .build()
            .map_err(|e| RecordFlowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            content_root: content_root.into(),
            client,
        })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Directory holding everything stored for `url`'s domain.
    pub fn domain_dir(&self, url: &Url) -> Result<PathBuf> {
        let domain = domain_of(url)
            .ok_or_else(|| RecordFlowError::validation(format!("not a crawlable URL: {url}")))?;
        Ok(self.content_root.join(domain))
    }

    /// Location of the manifest for `url`'s domain.
    pub fn manifest_path(&self, url: &Url) -> Result<PathBuf> {
        Ok(manifest_path(&self.domain_dir(url)?))
    }

    /// Crawl the domain of `root`, or return its existing manifest.
    ///
    /// Page and asset failures are logged and skipped. Errors are returned
    /// only for an unusable root URL or a manifest that cannot be written.
    #[instrument(skip_all, fields(root = %root))]
    pub async fn crawl(&self, root: &Url) -> Result<CrawlManifest> {
        let domain = domain_of(root)
            .ok_or_else(|| RecordFlowError::validation(format!("not a crawlable URL: {root}")))?;
        if !self.config.allow_private_hosts && is_ssrf_target(root) {
            return Err(RecordFlowError::validation(format!(
                "refusing to crawl private or local host: {root}"
            )));
        }

        let domain_dir = self.content_root.join(&domain);
        let manifest_file = manifest_path(&domain_dir);
        match load_manifest(&manifest_file) {
            Ok(Some(manifest)) => {
                info!(%domain, "manifest exists, skipping crawl");
                return Ok(manifest);
            }
            Ok(None) => {}
            Err(e) => warn!(%domain, error = %e, "unreadable manifest, crawling again"),
        }

        let assets_dir = domain_dir.join("assets");
        tokio::fs::create_dir_all(&assets_dir)
            .await
            .map_err(|e| RecordFlowError::io(&assets_dir, e))?;

        info!(
            %domain,
            max_pages = self.config.max_pages,
            max_depth = self.config.max_depth,
            "starting crawl"
        );

        let policy = LinkPolicy::new(domain.as_str(), &self.config);
        let mut queue: VecDeque<(Url, u32)> = VecDeque::from([(root.clone(), 0)]);
        let mut queued: HashSet<String> = HashSet::from([normalize_url(root)]);
        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_assets: HashSet<String> = HashSet::new();
        let mut assets: Vec<Asset> = Vec::new();

        while visited.len() < self.config.max_pages {
            let Some((url, depth)) = queue.pop_front() else {
                break;
            };
            if !visited.insert(normalize_url(&url)) {
                continue;
            }
            if !self.config.allow_private_hosts && is_ssrf_target(&url) {
                warn!(%url, "SSRF protection: blocked");
                continue;
            }

            debug!(%url, depth, "fetching page");
            let html = match self.fetch_page(&url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(%url, error = %e, "failed to load page, skipping");
                    continue;
                }
            };
            let page = analyze_page(&html, &url, self.config.min_text_chars);
            drop(html);

            if let Some(text) = page.text {
                match self.store_text(&domain_dir, &url, &text).await {
                    Ok(asset) => assets.push(asset),
                    Err(e) => warn!(%url, error = %e, "failed to store page text"),
                }
            }

            let candidates = page
                .images
                .into_iter()
                .map(|u| (u, AssetKind::Image))
                .chain(page.documents.into_iter().map(|u| (u, AssetKind::Document)));
            for (asset_url, kind) in candidates {
                if !seen_assets.insert(asset_url.to_string()) {
                    continue;
                }
                if let Some(asset) = self.fetch_asset(&asset_url, kind, &assets_dir).await {
                    assets.push(asset);
                }
            }

            if depth >= self.config.max_depth {
                continue;
            }
            for link in page.links {
                let key = normalize_url(&link);
                if visited.contains(&key) || queued.contains(&key) {
                    continue;
                }
                let decision = policy.decide(&link, depth);
                if decision.follows() {
                    queued.insert(key);
                    queue.push_back((link, depth + 1));
                } else {
                    debug!(%link, ?decision, "link not followed");
                }
            }
        }

        let manifest = CrawlManifest {
            root_url: root.to_string(),
            timestamp: Utc::now(),
            pages_crawled: visited.len(),
            assets_found: assets.len(),
            assets,
        };
        let manifest = write_manifest(&manifest_file, manifest)?;

        info!(
            %domain,
            pages_crawled = manifest.pages_crawled,
            assets_found = manifest.assets_found,
            "crawl completed"
        );
        Ok(manifest)
    }

    async fn fetch_page(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| RecordFlowError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordFlowError::Network(format!("{url}: HTTP {status}")));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html"));
        if !is_html {
            return Err(RecordFlowError::validation(format!("{url}: not an HTML page")));
        }

        response
            .text()
            .await
            .map_err(|e| RecordFlowError::Network(format!("{url}: body read failed: {e}")))
    }

    async fn store_text(&self, domain_dir: &Path, url: &Url, text: &str) -> Result<Asset> {
        let path = domain_dir.join(format!("content_{}.txt", short_hash(url.as_str())));
        tokio::fs::write(&path, format!("URL: {url}\n\n{text}"))
            .await
            .map_err(|e| RecordFlowError::io(&path, e))?;
        Ok(Asset {
            kind: AssetKind::Text,
            original_url: url.to_string(),
            local_path: path,
        })
    }

    /// Download and verify one asset. Any failure leaves nothing on disk.
    async fn fetch_asset(&self, url: &Url, kind: AssetKind, assets_dir: &Path) -> Option<Asset> {
        let path = assets_dir.join(asset_file_name(url, kind));

        if let Err(e) = self.download(url, &path).await {
            warn!(%url, error = %e, "asset download failed");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        let max_width = self.config.max_image_width;
        let check_path = path.clone();
        let verdict =
            tokio::task::spawn_blocking(move || verify_asset(&check_path, kind, max_width)).await;

        match verdict {
            Ok(Ok(AssetVerdict::Accepted(stored))) => Some(Asset {
                kind,
                original_url: url.to_string(),
                local_path: stored,
            }),
            Ok(Ok(AssetVerdict::Rejected(reason))) => {
                debug!(%url, %reason, "asset rejected");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "asset verification failed");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
            Err(e) => {
                warn!(%url, error = %e, "asset verification task failed");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn download(&self, url: &Url, path: &Path) -> Result<()> {
        let response = self
            .client
            .get(url.as_str())
            .timeout(Duration::from_secs(self.config.asset_timeout_secs))
            .send()
            .await
            .map_err(|e| RecordFlowError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordFlowError::Network(format!("{url}: HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RecordFlowError::Network(format!("{url}: body read failed: {e}")))?;
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| RecordFlowError::io(path, e))
    }
}

/// Stable file name for an asset URL: `img_<hash>.<ext>` or `doc_<hash>.pdf`.
pub fn asset_file_name(url: &Url, kind: AssetKind) -> String {
    let hash = short_hash(url.as_str());
    match kind {
        AssetKind::Image => {
            let ext = Path::new(url.path())
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .filter(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
                .unwrap_or_else(|| "jpg".to_string());
            format!("img_{hash}.{ext}")
        }
        AssetKind::Document => format!("doc_{hash}.pdf"),
        AssetKind::Text => format!("content_{hash}.txt"),
    }
}

/// First 32 hex chars of the SHA-256 of `input`.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(32);
    hex
}

#[cfg(test)]
mod crawler_tests {
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::verify::tests::noisy_bmp;

    fn test_config() -> CrawlConfig {
        CrawlConfig {
            allow_private_hosts: true,
            min_text_chars: 20,
            ..CrawlConfig::default()
        }
    }

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rf-crawl-{label}-{}", Uuid::now_v7()))
    }

    fn html_page(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html; charset=utf-8")
            .set_body_string(format!("<html><body><main>{body}</main></body></html>"))
    }

    async fn mount_page(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(html_page(body))
            .mount(server)
            .await;
    }

    async fn mount_bytes(server: &MockServer, route: &str, bytes: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
            .mount(server)
            .await;
    }

    #[test]
    fn asset_names_are_stable() {
        let png = Url::parse("https://s.example/photos/Room.PNG?v=2").unwrap();
        let name = asset_file_name(&png, AssetKind::Image);
        assert!(name.starts_with("img_") && name.ends_with(".png"));
        assert_eq!(name, asset_file_name(&png, AssetKind::Image));

        let odd = Url::parse("https://s.example/render?id=4").unwrap();
        assert!(asset_file_name(&odd, AssetKind::Image).ends_with(".jpg"));

        let pdf = Url::parse("https://s.example/handbook.pdf").unwrap();
        assert!(asset_file_name(&pdf, AssetKind::Document).starts_with("doc_"));
    }

    #[test]
    fn test_compute_hash() {
        let hash = short_hash("hello world");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, "b94d27b9934d3e08a52e52d7da7dabfa");
    }

    #[tokio::test]
    async fn refuses_private_root_by_default() {
        let crawler = Crawler::new(CrawlConfig::default(), temp_root("ssrf")).unwrap();
        let root = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(crawler.crawl(&root).await.is_err());
    }

    #[tokio::test]
    async fn crawl_collects_verified_assets_once() {
        let server = MockServer::start().await;

        mount_page(
            &server,
            "/",
            r#"<h1>Sunshine Kids</h1><p>A warm and playful daycare in the heart of Austin.</p>
               <img src="/img/room.bmp"><img src="/img/icon.bmp"><img src="/img/banner.bmp">
               <a href="/files/handbook.pdf">Handbook</a><a href="/files/flyer.pdf">Flyer</a>
               <a href="/about">About</a>"#,
        )
        .await;
        mount_page(
            &server,
            "/about",
            r#"<p>About our teachers and our approach to early learning.</p>
               <img src="/img/room.bmp"><a href="/files/handbook.pdf">Handbook again</a>"#,
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/img/room.bmp"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(noisy_bmp(400, 300)))
            .expect(1)
            .mount(&server)
            .await;
        // 40x40 is below the byte floor; 900x120 passes it but fails the shape check
        mount_bytes(&server, "/img/icon.bmp", noisy_bmp(40, 40)).await;
        mount_bytes(&server, "/img/banner.bmp", noisy_bmp(900, 120)).await;
        mount_bytes(&server, "/files/handbook.pdf", vec![b'%'; 8 * 1024]).await;
        mount_bytes(&server, "/files/flyer.pdf", vec![b'%'; 2 * 1024]).await;

        let root_dir = temp_root("assets");
        let crawler = Crawler::new(test_config(), &root_dir).unwrap();
        let root = Url::parse(&server.uri()).unwrap();
        let manifest = crawler.crawl(&root).await.unwrap();

        assert_eq!(manifest.pages_crawled, 2);
        let images: Vec<&Asset> = manifest.assets_of(AssetKind::Image).collect();
        assert_eq!(images.len(), 1);
        assert!(images[0].original_url.ends_with("/img/room.bmp"));
        assert!(images[0].local_path.exists());

        let docs: Vec<&Asset> = manifest.assets_of(AssetKind::Document).collect();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].original_url.ends_with("/files/handbook.pdf"));

        assert_eq!(manifest.assets_of(AssetKind::Text).count(), 2);
        assert_eq!(manifest.assets_found, manifest.assets.len());

        // Rejected assets do not linger on disk
        let stored = std::fs::read_dir(crawler.domain_dir(&root).unwrap().join("assets"))
            .unwrap()
            .count();
        assert_eq!(stored, 2);

        let _ = std::fs::remove_dir_all(&root_dir);
    }

    #[tokio::test]
    async fn failed_and_stalled_downloads_are_skipped() {
        let server = MockServer::start().await;

        mount_page(
            &server,
            "/",
            r#"<p>Sunshine Kids keeps its photo gallery and forms right here.</p>
               <img src="/img/missing.bmp"><img src="/img/slow.bmp"><img src="/img/room.bmp">
               <a href="/files/broken.pdf">Enrollment form</a>"#,
        )
        .await;
        Mock::given(path("/img/missing.bmp"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/files/broken.pdf"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(path("/img/slow.bmp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(noisy_bmp(400, 300))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        mount_bytes(&server, "/img/room.bmp", noisy_bmp(400, 300)).await;

        let root_dir = temp_root("download-failures");
        let config = CrawlConfig {
            asset_timeout_secs: 1,
            ..test_config()
        };
        let crawler = Crawler::new(config, &root_dir).unwrap();
        let root = Url::parse(&server.uri()).unwrap();
        let manifest = crawler.crawl(&root).await.unwrap();

        assert_eq!(manifest.pages_crawled, 1);
        let images: Vec<&Asset> = manifest.assets_of(AssetKind::Image).collect();
        assert_eq!(images.len(), 1);
        assert!(images[0].original_url.ends_with("/img/room.bmp"));
        assert_eq!(manifest.assets_of(AssetKind::Document).count(), 0);
        assert_eq!(manifest.assets_of(AssetKind::Text).count(), 1);

        // Failed downloads leave no partial files behind
        let stored = std::fs::read_dir(crawler.domain_dir(&root).unwrap().join("assets"))
            .unwrap()
            .count();
        assert_eq!(stored, 1);

        let _ = std::fs::remove_dir_all(&root_dir);
    }

    #[tokio::test]
    async fn second_crawl_reads_manifest_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html_page("<p>Only one page on this small site, nothing else.</p>"))
            .expect(1)
            .mount(&server)
            .await;

        let root_dir = temp_root("idempotent");
        let root = Url::parse(&server.uri()).unwrap();

        let first = Crawler::new(test_config(), &root_dir)
            .unwrap()
            .crawl(&root)
            .await
            .unwrap();
        let second = Crawler::new(test_config(), &root_dir)
            .unwrap()
            .crawl(&root)
            .await
            .unwrap();

        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(&root_dir);
    }

    #[tokio::test]
    async fn follows_priority_links_and_respects_bounds() {
        let server = MockServer::start().await;

        mount_page(
            &server,
            "/",
            r#"<a href="/locations">Locations</a><a href="/news">News</a>
               <a href="https://elsewhere.example/about">Partner</a>"#,
        )
        .await;
        mount_page(
            &server,
            "/locations",
            r#"<a href="/directions">Directions</a><a href="/tuition">Tuition</a>"#,
        )
        .await;
        mount_page(&server, "/tuition", r#"<a href="/staff">Staff</a>"#).await;
        mount_page(&server, "/staff", "<p>Staff</p>").await;

        Mock::given(path("/news"))
            .respond_with(html_page("news"))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(path("/directions"))
            .respond_with(html_page("directions"))
            .expect(0)
            .mount(&server)
            .await;

        let root_dir = temp_root("policy");
        let config = CrawlConfig {
            max_depth: 2,
            ..test_config()
        };
        let crawler = Crawler::new(config, &root_dir).unwrap();
        let manifest = crawler
            .crawl(&Url::parse(&server.uri()).unwrap())
            .await
            .unwrap();

        // root (0) -> locations (1, bootstrap) -> tuition (2, priority); staff is depth 3
        assert_eq!(manifest.pages_crawled, 3);
        let _ = std::fs::remove_dir_all(&root_dir);
    }

    #[tokio::test]
    async fn page_limit_and_failing_pages() {
        let server = MockServer::start().await;

        mount_page(
            &server,
            "/",
            r#"<a href="/about">About</a><a href="/programs">Programs</a>
               <a href="/gallery">Gallery</a><a href="/contact">Contact</a>"#,
        )
        .await;
        Mock::given(path("/about"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_page(&server, "/programs", "<p>Programs</p>").await;
        mount_page(&server, "/gallery", "<p>Gallery</p>").await;
        Mock::given(path("/contact"))
            .respond_with(html_page("contact"))
            .expect(0)
            .mount(&server)
            .await;

        let root_dir = temp_root("limit");
        let config = CrawlConfig {
            max_pages: 4,
            ..test_config()
        };
        let crawler = Crawler::new(config, &root_dir).unwrap();
        let manifest = crawler
            .crawl(&Url::parse(&server.uri()).unwrap())
            .await
            .unwrap();

        // The 500 counts as visited but does not abort the crawl
        assert_eq!(manifest.pages_crawled, 4);
        let _ = std::fs::remove_dir_all(&root_dir);
    }
}
