//! Directory service client.
//!
//! [`DirectoryClient`] is the seam the matcher depends on; [`PlacesClient`]
//! implements it against the Places web service (find-place-from-text, place
//! details, and the photo and street-view image endpoints).

use std::time::Duration;

use async_trait::async_trait;
use recordflow_shared::{
    Contact, DirectoryRecord, GeoPoint, IdentityConfig, Rating, RecordFlowError, Result,
    ServiceError, read_api_key,
};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// User-Agent string for directory requests.
const USER_AGENT: &str = concat!("RecordFlow/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fields requested from the details endpoint.
const DETAIL_FIELDS: &str = "place_id,name,formatted_address,business_status,\
formatted_phone_number,website,rating,user_ratings_total,geometry,opening_hours,photo,reviews";

/// Requested street-view image size.
const STREET_VIEW_SIZE: &str = "600x300";

/// Lookup operations against an external business directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Best candidate id for a free-text query, if any.
    async fn search(&self, query: &str) -> std::result::Result<Option<String>, ServiceError>;

    /// Full listing for a candidate id, if it still exists.
    async fn details(
        &self,
        candidate_id: &str,
    ) -> std::result::Result<Option<DirectoryRecord>, ServiceError>;

    /// Image bytes for a listing photo reference. `None` when the directory
    /// serves no media.
    async fn photo(
        &self,
        _reference: &str,
        _max_width: u32,
    ) -> std::result::Result<Option<Vec<u8>>, ServiceError> {
        Ok(None)
    }

    /// Street-level image bytes at `location`. `None` when unavailable.
    async fn street_view(
        &self,
        _location: GeoPoint,
    ) -> std::result::Result<Option<Vec<u8>>, ServiceError> {
        Ok(None)
    }
}

/// HTTP client for the Places API.
pub struct PlacesClient {
    client: Client,
    base_url: String,
    street_view_url: String,
    api_key: String,
}

impl PlacesClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| RecordFlowError::Network(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            street_view_url: format!("{base_url}/streetview"),
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Use a street-view endpoint other than `<base_url>/streetview`.
    pub fn with_street_view_url(mut self, url: impl Into<String>) -> Self {
        self.street_view_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let key = read_api_key(&config.api_key_env)?;
        Ok(Self::new(&config.base_url, key)?.with_street_view_url(&config.street_view_url))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<T, ServiceError> {
        let response = self
            .client
            .get(format!("{}/{endpoint}", self.base_url))
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Parse(e.to_string()))
    }

    /// GET an image; 404 means "no image", not an error.
    async fn get_image(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<Option<Vec<u8>>, ServiceError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

#[async_trait]
impl DirectoryClient for PlacesClient {
    async fn search(&self, query: &str) -> std::result::Result<Option<String>, ServiceError> {
        let response: FindPlaceResponse = self
            .get_json(
                "findplacefromtext/json",
                &[
                    ("input", query),
                    ("inputtype", "textquery"),
                    ("fields", "place_id"),
                ],
            )
            .await?;

        match response.status.as_str() {
            "OK" => Ok(response.candidates.into_iter().next().map(|c| c.place_id)),
            "ZERO_RESULTS" => Ok(None),
            other => Err(api_status_error(other, response.error_message)),
        }
    }

    async fn details(
        &self,
        candidate_id: &str,
    ) -> std::result::Result<Option<DirectoryRecord>, ServiceError> {
        let response: DetailsResponse = self
            .get_json(
                "details/json",
                &[("place_id", candidate_id), ("fields", DETAIL_FIELDS)],
            )
            .await?;

        match response.status.as_str() {
            "OK" => Ok(response.result.map(PlaceDetails::into_record)),
            "ZERO_RESULTS" | "NOT_FOUND" => Ok(None),
            other => Err(api_status_error(other, response.error_message)),
        }
    }

    async fn photo(
        &self,
        reference: &str,
        max_width: u32,
    ) -> std::result::Result<Option<Vec<u8>>, ServiceError> {
        let max_width = max_width.to_string();
        self.get_image(
            &format!("{}/photo", self.base_url),
            &[("maxwidth", max_width.as_str()), ("photo_reference", reference)],
        )
        .await
    }

    async fn street_view(
        &self,
        location: GeoPoint,
    ) -> std::result::Result<Option<Vec<u8>>, ServiceError> {
        let location = format!("{},{}", location.lat, location.lng);
        self.get_image(
            &self.street_view_url,
            &[("size", STREET_VIEW_SIZE), ("location", location.as_str())],
        )
        .await
    }
}

/// Map a non-OK API status to a classified error.
fn api_status_error(status: &str, message: Option<String>) -> ServiceError {
    let body = match message {
        Some(message) => format!("{status}: {message}"),
        None => status.to_string(),
    };
    let code = match status {
        "OVER_QUERY_LIMIT" => 429,
        "UNKNOWN_ERROR" => 503,
        "REQUEST_DENIED" => 403,
        _ => 400,
    };
    ServiceError::Status { status: code, body }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FindPlaceResponse {
    status: String,
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    place_id: String,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    #[serde(default)]
    result: Option<PlaceDetails>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceDetails {
    place_id: String,
    #[serde(default)]
    name: String,
    formatted_address: Option<String>,
    business_status: Option<String>,
    formatted_phone_number: Option<String>,
    website: Option<String>,
    rating: Option<f64>,
    user_ratings_total: Option<u64>,
    geometry: Option<Geometry>,
    opening_hours: Option<Value>,
    #[serde(default)]
    photos: Vec<PhotoRef>,
    #[serde(default)]
    reviews: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: GeoPoint,
}

#[derive(Debug, Deserialize)]
struct PhotoRef {
    photo_reference: Option<String>,
}

impl PlaceDetails {
    fn into_record(self) -> DirectoryRecord {
        let rating = (self.rating.is_some() || self.user_ratings_total.is_some()).then(|| Rating {
            stars: self.rating,
            count: self.user_ratings_total,
        });
        let reviews = self
            .reviews
            .into_iter()
            .map(|mut review| {
                // Relative wording ("a month ago") goes stale; the timestamp stays
                if let Value::Object(map) = &mut review {
                    map.remove("relative_time_description");
                }
                review
            })
            .collect();

        DirectoryRecord {
            place_id: self.place_id,
            name: self.name,
            address: self.formatted_address,
            business_status: self.business_status,
            contact: Contact {
                phone: self.formatted_phone_number,
                website: self.website,
                ..Contact::default()
            },
            rating,
            location: self.geometry.map(|g| g.location),
            operating_hours: self.opening_hours,
            reviews,
            photo_references: self
                .photos
                .into_iter()
                .filter_map(|p| p.photo_reference)
                .collect(),
            ..DirectoryRecord::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn search_returns_first_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/findplacefromtext/json"))
            .and(query_param("input", "sunshine kids 100 oak st"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "OK",
                "candidates": [{"place_id": "abc"}, {"place_id": "def"}]
            })))
            .mount(&server)
            .await;

        let client = PlacesClient::new(server.uri(), "test-key").unwrap();
        let id = client.search("sunshine kids 100 oak st").await.unwrap();
        assert_eq!(id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn zero_results_is_none_and_quota_is_transient() {
        let server = MockServer::start().await;
        Mock::given(path("/findplacefromtext/json"))
            .and(query_param("input", "nobody"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "ZERO_RESULTS", "candidates": []})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/findplacefromtext/json"))
            .and(query_param("input", "busy"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "OVER_QUERY_LIMIT"})),
            )
            .mount(&server)
            .await;

        let client = PlacesClient::new(server.uri(), "k").unwrap();
        assert_eq!(client.search("nobody").await.unwrap(), None);
        let err = client.search("busy").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn details_map_to_directory_record() {
        let server = MockServer::start().await;
        Mock::given(path("/details/json"))
            .and(query_param("place_id", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "OK",
                "result": {
                    "place_id": "abc",
                    "name": "Sunshine Kids Daycare",
                    "formatted_address": "100 Oak Street, Austin, TX 78701, USA",
                    "business_status": "OPERATIONAL",
                    "website": "https://sunshine.example/",
                    "rating": 4.7,
                    "user_ratings_total": 31,
                    "geometry": {"location": {"lat": 30.27, "lng": -97.74}},
                    "photos": [{"photo_reference": "ref-a"}, {"height": 10}, {"photo_reference": "ref-b"}],
                    "reviews": [{"text": "Great", "relative_time_description": "a week ago"}]
                }
            })))
            .mount(&server)
            .await;

        let client = PlacesClient::new(format!("{}/", server.uri()), "k").unwrap();
        let record = client.details("abc").await.unwrap().expect("record");
        assert_eq!(record.name, "Sunshine Kids Daycare");
        assert!(record.is_active());
        assert_eq!(record.contact.website.as_deref(), Some("https://sunshine.example/"));
        assert_eq!(record.rating.unwrap().count, Some(31));
        assert_eq!(record.location.unwrap().lat, 30.27);
        assert!(record.reviews[0].get("relative_time_description").is_none());
        assert_eq!(record.photo_references, vec!["ref-a", "ref-b"]);
    }

    #[tokio::test]
    async fn photo_and_street_view_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/photo"))
            .and(query_param("photo_reference", "ref-a"))
            .and(query_param("maxwidth", "1000"))
            .and(query_param("key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;
        Mock::given(path("/photo"))
            .and(query_param("photo_reference", "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/sv"))
            .and(query_param("location", "30.27,-97.74"))
            .and(query_param("size", "600x300"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 4]))
            .mount(&server)
            .await;

        let client = PlacesClient::new(server.uri(), "k")
            .unwrap()
            .with_street_view_url(format!("{}/sv", server.uri()));
        assert_eq!(client.photo("ref-a", 1000).await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(client.photo("gone", 1000).await.unwrap(), None);
        let location = GeoPoint {
            lat: 30.27,
            lng: -97.74,
        };
        assert_eq!(client.street_view(location).await.unwrap(), Some(vec![9; 4]));
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/details/json"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = PlacesClient::new(server.uri(), "k").unwrap();
        let err = client.details("abc").await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 502, .. }));
        assert!(err.is_transient());
    }
}
