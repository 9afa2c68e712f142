//! Core domain types for RecordFlow records, crawl manifests, and ledgers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Directory status that marks a business as no longer operating.
pub const CLOSED_PERMANENTLY: &str = "CLOSED_PERMANENTLY";

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Identity,
    Research,
    Crawl,
    Finalize,
}

impl Stage {
    /// Name used in the retry ledger and the cost ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Research => "research",
            Self::Crawl => "crawl",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Structured postal address as declared by the source dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opt_string_or_number"
    )]
    pub zip: Option<String>,

    /// Source keys such as `full` or `latitude`, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Address {
    /// Non-empty components joined as `street, city, state, zip`.
    pub fn one_line(&self) -> String {
        [&self.street, &self.city, &self.state, &self.zip]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Contact details, either declared by the source or returned by the directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A subject being enriched.
///
/// Each stage adds its own sub-structure; absence means the stage did not run.
/// Source fields the pipeline does not interpret are kept in `extra` and
/// written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default)]
    pub contact: Contact,

    /// Validated directory match (identity stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryRecord>,
    /// Research collaborator output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<ResearchPayload>,
    /// Crawl + refinement outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl: Option<CrawlStage>,
    /// Final synthesis output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisPayload>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// The website to crawl: directory website first, then the declared one.
    ///
    /// Returns `None` when neither parses as an absolute http(s) URL.
    pub fn usable_website(&self) -> Option<Url> {
        let directory_site = self
            .directory
            .as_ref()
            .and_then(|d| d.contact.website.as_deref());

        [directory_site, self.contact.website.as_deref()]
            .into_iter()
            .flatten()
            .find_map(parse_website)
    }
}

/// Parse a loosely formatted website value (`www.example.com`, `http://...`).
pub fn parse_website(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) if !raw.contains("://") => Url::parse(&format!("https://{raw}")).ok()?,
        Err(_) => return None,
    };

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Some(parsed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Star rating summary from the directory service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    #[serde(default)]
    pub stars: Option<f64>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// Latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Authoritative listing returned by the directory service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub place_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub business_status: Option<String>,
    #[serde(default)]
    pub contact: Contact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_hours: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviews: Vec<Value>,

    /// Photo references from the listing, consumed when media is downloaded.
    #[serde(skip)]
    pub photo_references: Vec<String>,
    /// Downloaded listing photos, downscaled JPEGs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_view_path: Option<PathBuf>,
}

impl DirectoryRecord {
    /// Whether the listing reports an operating business.
    pub fn is_active(&self) -> bool {
        match self.business_status.as_deref().map(str::trim) {
            Some(status) => !status.is_empty() && status != CLOSED_PERMANENTLY,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage payloads
// ---------------------------------------------------------------------------

/// Opaque research output; its shape belongs to the research collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResearchPayload(pub Value);

/// Final synthesis output. Always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SynthesisPayload(pub Map<String, Value>);

/// Outcome of the crawl + refinement stage.
///
/// `Unavailable` is the explicit empty payload: the stage ran but produced
/// nothing usable (no website, or the crawl failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CrawlStage {
    Refined(RefinedAssets),
    Unavailable { reason: String },
}

/// Counts of assets before refinement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStats {
    pub original_images: usize,
    pub original_documents: usize,
    pub original_text_files: usize,
}

/// Bounded subset of a crawl's assets, ready for synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedAssets {
    pub root_url: String,
    pub timestamp: DateTime<Utc>,
    pub verified_images: Vec<PathBuf>,
    pub document_assets: Vec<PathBuf>,
    #[serde(default)]
    pub derived_body_text_path: Option<PathBuf>,
    pub raw_stats: RawStats,
}

// ---------------------------------------------------------------------------
// Crawl manifest
// ---------------------------------------------------------------------------

/// Kind of asset persisted by the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    #[serde(alias = "pdf")]
    Document,
    Text,
}

/// A verified asset stored in the domain's content directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub original_url: String,
    pub local_path: PathBuf,
}

/// The `metadata.json` written at the root of each crawled domain directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlManifest {
    pub root_url: String,
    pub timestamp: DateTime<Utc>,
    pub pages_crawled: usize,
    pub assets_found: usize,
    pub assets: Vec<Asset>,
}

impl CrawlManifest {
    /// Assets of one kind, in discovery order.
    pub fn assets_of(&self, kind: AssetKind) -> impl Iterator<Item = &Asset> {
        self.assets.iter().filter(move |a| a.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Ledgers
// ---------------------------------------------------------------------------

/// Usage units reported by a collaborator call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// One line of the retry ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    /// The record exactly as it was read from the input.
    pub original_record: Record,
    pub failing_stage: Stage,
    pub error_message: String,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    StringOrNumber::deserialize(de).map(String::from)
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    de: D,
) -> std::result::Result<Option<String>, D::Error> {
    Option::<StringOrNumber>::deserialize(de).map(|v| v.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUNSHINE: &str = r#"{"id":"A1","name":"Sunshine Kids","address":{"street":"100 Oak St","city":"Austin","state":"TX","zip":"78701"}}"#;

    #[test]
    fn record_parses_example_input() {
        let record: Record = serde_json::from_str(SUNSHINE).expect("parse");
        assert_eq!(record.id, "A1");
        assert_eq!(
            record.address.as_ref().map(Address::one_line).as_deref(),
            Some("100 Oak St, Austin, TX, 78701")
        );
        assert!(record.directory.is_none());
        assert!(record.extra.is_empty());
    }

    #[test]
    fn record_keeps_unknown_source_fields() {
        let json = r#"{"id":42,"name":"Little Oaks","license_no":"TX-991","address":{"zip":78704}}"#;
        let record: Record = serde_json::from_str(json).expect("parse");
        assert_eq!(record.id, "42");
        assert_eq!(record.address.unwrap().zip.as_deref(), Some("78704"));
        assert_eq!(record.extra["license_no"], "TX-991");

        let out = serde_json::to_value(
            serde_json::from_str::<Record>(json).expect("parse"),
        )
        .expect("serialize");
        assert_eq!(out["license_no"], "TX-991");
        assert!(out.get("directory").is_none());
        assert!(out.get("crawl").is_none());
    }

    #[test]
    fn nested_source_fields_survive_reserialization() {
        let json = r#"{"id":"TX-1","name":"Sunshine Kids","capacity":40,
            "address":{"street":"100 Oak St","city":"Austin","state":"TX","zip":"78701",
                "full":"100 Oak St, Austin, TX 78701","latitude":30.1,"longitude":-97.7},
            "contact":{"phone":"512","director_name":"Jane Doe"}}"#;
        let record: Record = serde_json::from_str(json).expect("parse");
        let address = record.address.as_ref().expect("address");
        assert_eq!(address.one_line(), "100 Oak St, Austin, TX, 78701");
        assert_eq!(address.extra["latitude"], 30.1);
        assert_eq!(record.contact.extra["director_name"], "Jane Doe");

        let out = serde_json::to_value(&record).expect("serialize");
        assert_eq!(out["address"]["full"], "100 Oak St, Austin, TX 78701");
        assert_eq!(out["address"]["longitude"], -97.7);
        assert_eq!(out["address"]["zip"], "78701");
        assert_eq!(out["contact"]["director_name"], "Jane Doe");
        assert_eq!(out["contact"]["phone"], "512");
        assert_eq!(out["capacity"], 40);
    }

    #[test]
    fn usable_website_prefers_directory() {
        let mut record: Record = serde_json::from_str(SUNSHINE).expect("parse");
        record.contact.website = Some("www.declared.example".into());
        assert_eq!(
            record.usable_website().unwrap().as_str(),
            "https://www.declared.example/"
        );

        record.directory = Some(DirectoryRecord {
            place_id: "p1".into(),
            name: "Sunshine Kids Daycare".into(),
            address: None,
            business_status: Some("OPERATIONAL".into()),
            contact: Contact {
                website: Some("http://sunshine.example/home".into()),
                ..Contact::default()
            },
            rating: None,
            location: None,
            operating_hours: None,
            reviews: vec![],
            ..DirectoryRecord::default()
        });
        assert_eq!(
            record.usable_website().unwrap().as_str(),
            "http://sunshine.example/home"
        );
    }

    #[test]
    fn unusable_websites_rejected() {
        assert!(parse_website("").is_none());
        assert!(parse_website("mailto:office@example.com").is_none());
        assert!(parse_website("ftp://files.example.com").is_none());
    }

    #[test]
    fn directory_status_rules() {
        let mut dir = DirectoryRecord {
            place_id: "p".into(),
            name: "n".into(),
            address: None,
            business_status: None,
            contact: Contact::default(),
            rating: None,
            location: None,
            operating_hours: None,
            reviews: vec![],
            ..DirectoryRecord::default()
        };
        assert!(!dir.is_active());
        dir.business_status = Some("OPERATIONAL".into());
        assert!(dir.is_active());
        dir.business_status = Some(CLOSED_PERMANENTLY.into());
        assert!(!dir.is_active());
    }

    #[test]
    fn crawl_stage_is_tagged() {
        let stage = CrawlStage::Unavailable {
            reason: "no usable website".into(),
        };
        let json = serde_json::to_value(&stage).expect("serialize");
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["reason"], "no usable website");
    }

    #[test]
    fn asset_kind_accepts_pdf_alias() {
        let json = r#"{"type":"pdf","original_url":"https://x.example/a.pdf","local_path":"/tmp/a.pdf"}"#;
        let asset: Asset = serde_json::from_str(json).expect("parse");
        assert_eq!(asset.kind, AssetKind::Document);
        assert!(serde_json::to_string(&asset).unwrap().contains(r#""type":"document""#));
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 2,
        };
        total += Usage {
            input_tokens: 5,
            output_tokens: 1,
        };
        assert_eq!(total.input_tokens, 15);
        assert_eq!(total.output_tokens, 3);
    }
}
