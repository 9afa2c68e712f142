//! External enrichment collaborators.
//!
//! Research, synthesis, and image ranking are owned by other systems. The
//! pipeline sees them only through the traits here. [`HttpCollaborator`]
//! talks to a JSON gateway exposing all three; [`UnconfiguredService`] stands
//! in when no gateway is configured and fails every call permanently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recordflow_shared::{
    RecordFlowError, Record, Result, ServiceError, ServicesConfig, Usage, read_api_key,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

const USER_AGENT: &str = concat!("RecordFlow/", env!("CARGO_PKG_VERSION"));

/// A collaborator's answer plus the usage it reported, if any.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct StageResponse<T> {
    pub payload: T,
    #[serde(default)]
    pub usage: Option<Usage>,
}

type ServiceResult<T> = std::result::Result<StageResponse<T>, ServiceError>;

#[async_trait]
pub trait ResearchService: Send + Sync {
    /// Gather external facts about the record's subject.
    async fn research(&self, record: &Record) -> ServiceResult<Value>;
}

#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Produce the final structured profile. The payload must be a JSON object.
    async fn synthesize(&self, record: &Record) -> ServiceResult<Value>;
}

#[async_trait]
pub trait RankingService: Send + Sync {
    /// Pick at most `top_n` of `candidates`, most relevant first.
    async fn rank_images(&self, candidates: &[PathBuf], top_n: usize)
    -> ServiceResult<Vec<PathBuf>>;
}

/// Client for an enrichment gateway with `/research`, `/synthesize`, and
/// `/rank` endpoints, each answering `{"payload": ..., "usage": {...}}`.
pub struct HttpCollaborator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCollaborator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RecordFlowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build from the `[services]` section. Returns `Ok(None)` when no
    /// gateway URL is configured. The API key is optional.
    pub fn from_config(config: &ServicesConfig) -> Result<Option<Self>> {
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(None);
        };
        let api_key = read_api_key(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::debug!(env = %config.api_key_env, "no gateway API key set, sending unauthenticated requests");
        }
        Self::new(base_url, api_key, Duration::from_secs(config.timeout_secs)).map(Some)
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> ServiceResult<T> {
        let mut request = self
            .client
            .post(format!("{}/{endpoint}", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<StageResponse<T>>()
            .await
            .map_err(|e| ServiceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ResearchService for HttpCollaborator {
    async fn research(&self, record: &Record) -> ServiceResult<Value> {
        self.post("research", &json!({ "record": record })).await
    }
}

#[async_trait]
impl SynthesisService for HttpCollaborator {
    async fn synthesize(&self, record: &Record) -> ServiceResult<Value> {
        self.post("synthesize", &json!({ "record": record })).await
    }
}

#[async_trait]
impl RankingService for HttpCollaborator {
    async fn rank_images(
        &self,
        candidates: &[PathBuf],
        top_n: usize,
    ) -> ServiceResult<Vec<PathBuf>> {
        self.post("rank", &json!({ "candidates": candidates, "top_n": top_n }))
            .await
    }
}

/// The three gateway-backed collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub research: Arc<dyn ResearchService>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub ranking: Arc<dyn RankingService>,
}

impl Collaborators {
    /// Gateway clients when `services.base_url` is set, otherwise
    /// [`UnconfiguredService`] for all three.
    pub fn from_config(config: &ServicesConfig) -> Result<Self> {
        match HttpCollaborator::from_config(config)? {
            Some(gateway) => {
                let gateway = Arc::new(gateway);
                Ok(Self {
                    research: gateway.clone(),
                    synthesis: gateway.clone(),
                    ranking: gateway,
                })
            }
            None => {
                tracing::warn!("services.base_url is not set, collaborator calls will fail");
                Ok(Self {
                    research: Arc::new(UnconfiguredService),
                    synthesis: Arc::new(UnconfiguredService),
                    ranking: Arc::new(UnconfiguredService),
                })
            }
        }
    }
}

/// Placeholder for a collaborator nobody configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredService;

impl UnconfiguredService {
    fn error() -> ServiceError {
        ServiceError::Unconfigured("set services.base_url in the config file".into())
    }
}

#[async_trait]
impl ResearchService for UnconfiguredService {
    async fn research(&self, _record: &Record) -> ServiceResult<Value> {
        Err(Self::error())
    }
}

#[async_trait]
impl SynthesisService for UnconfiguredService {
    async fn synthesize(&self, _record: &Record) -> ServiceResult<Value> {
        Err(Self::error())
    }
}

#[async_trait]
impl RankingService for UnconfiguredService {
    async fn rank_images(
        &self,
        _candidates: &[PathBuf],
        _top_n: usize,
    ) -> ServiceResult<Vec<PathBuf>> {
        Err(Self::error())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn record() -> Record {
        serde_json::from_value(json!({"id": "A1", "name": "Sunshine Kids"})).unwrap()
    }

    #[tokio::test]
    async fn research_posts_record_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/research"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"record": {"id": "A1"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payload": {"founded": 2004},
                "usage": {"input_tokens": 1200, "output_tokens": 300}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            HttpCollaborator::new(server.uri(), Some("secret".into()), Duration::from_secs(5))
                .unwrap();
        let response = client.research(&record()).await.unwrap();
        assert_eq!(response.payload["founded"], 2004);
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 1200,
                output_tokens: 300
            })
        );
    }

    #[tokio::test]
    async fn rank_returns_paths_without_usage() {
        let server = MockServer::start().await;
        Mock::given(path("/rank"))
            .and(body_partial_json(json!({"top_n": 1})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"payload": ["/tmp/b.png"]})),
            )
            .mount(&server)
            .await;

        let client = HttpCollaborator::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let response = client
            .rank_images(&[PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.png")], 1)
            .await
            .unwrap();
        assert_eq!(response.payload, vec![PathBuf::from("/tmp/b.png")]);
        assert!(response.usage.is_none());
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/synthesize"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(path("/research"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = HttpCollaborator::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = client.synthesize(&record()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 503, .. }));
        assert!(err.is_transient());

        let err = client.research(&record()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Parse(_)));
    }

    #[tokio::test]
    async fn unconfigured_fails_permanently() {
        let err = UnconfiguredService.research(&record()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(
            HttpCollaborator::from_config(&ServicesConfig::default())
                .unwrap()
                .is_none()
        );
    }
}
