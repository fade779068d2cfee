//! An HTTP client for the experiment backend.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::{Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    events::{EventStore, ExperimentEvent},
    EngineConfig, Error, Experiment, ExperimentResult, FeatureFlag, Result, UserSegment,
};

/// Base delay between retries; doubled for every attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Aggregated model performance of one variant, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VariantPerformance {
    pub variant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
}

/// A client for the experiment backend's REST API.
///
/// Requests time out after `request_timeout` and transient failures (network errors, `429` and
/// `5xx` responses) are retried up to `max_retries` times with jittered exponential backoff.
pub struct BackendClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    max_retries: u32,
    /// Set once the backend answers 401. The API key will not become valid by retrying, so
    /// further requests fail fast.
    unauthorized: AtomicBool,
}

impl BackendClient {
    /// Create a client for `config.base_url`.
    pub fn new(config: &EngineConfig) -> Result<BackendClient> {
        let mut base_url = Url::parse(&config.base_url).map_err(Error::InvalidBaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "base_url {} cannot carry a path",
                config.base_url
            )));
        }
        // Endpoints are appended as path segments; a trailing slash would leave an empty one.
        if let Ok(mut segments) = base_url.path_segments_mut() {
            segments.pop_if_empty();
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(BackendClient {
            client,
            base_url,
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            unauthorized: AtomicBool::new(false),
        })
    }

    /// `GET /experiments?prompt_id&status=running&project_id?`
    pub async fn list_experiments(
        &self,
        prompt_id: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Experiment>> {
        let mut url = self.endpoint(&["experiments"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("prompt_id", prompt_id)
                .append_pair("status", "running");
            if let Some(project_id) = project_id {
                query.append_pair("project_id", project_id);
            }
        }
        self.request(Method::GET, url, None::<&()>).await
    }

    /// `GET /experiments/{id}`
    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        let url = self.endpoint(&["experiments", experiment_id]);
        self.request(Method::GET, url, None::<&()>).await
    }

    /// `POST /events`. Returns the event as stored by the backend.
    pub async fn post_event(&self, event: &ExperimentEvent) -> Result<ExperimentEvent> {
        let url = self.endpoint(&["events"]);
        self.request(Method::POST, url, Some(event)).await
    }

    /// `GET /experiments/{id}/results`
    pub async fn get_results(&self, experiment_id: &str) -> Result<Vec<ExperimentResult>> {
        let url = self.endpoint(&["experiments", experiment_id, "results"]);
        self.request(Method::GET, url, None::<&()>).await
    }

    /// `GET /experiments/{id}/performance`
    pub async fn get_performance(&self, experiment_id: &str) -> Result<Vec<VariantPerformance>> {
        let url = self.endpoint(&["experiments", experiment_id, "performance"]);
        self.request(Method::GET, url, None::<&()>).await
    }

    /// `GET /feature-flags`
    pub async fn list_feature_flags(&self) -> Result<Vec<FeatureFlag>> {
        let url = self.endpoint(&["feature-flags"]);
        self.request(Method::GET, url, None::<&()>).await
    }

    /// `GET /user-segments`
    pub async fn list_user_segments(&self) -> Result<Vec<UserSegment>> {
        let url = self.endpoint(&["user-segments"]);
        self.request(Method::GET, url, None::<&()>).await
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejected cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    async fn request<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            match self.request_once(method.clone(), url.clone(), body).await {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = jitter(RETRY_BACKOFF * 2u32.saturating_pow(attempt), RETRY_BACKOFF);
                    log::warn!(target: "experiments",
                               path = url.path(),
                               attempt,
                               delay_ms = delay.as_millis() as u64;
                               "retrying backend request: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn request_once<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "experiments",
                    method = method.as_str(),
                    path = url.path();
                    "sending backend request");

        let mut request = self.client.request(method, url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "experiments", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "experiments",
                           "received non-success response from backend: {:?}", err);
                Error::from(err)
            }
        })?;

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl EventStore for BackendClient {
    async fn store_event(&self, event: ExperimentEvent) -> Result<ExperimentEvent> {
        self.post_event(&event).await
    }
}

/// Add up to `jitter` of random delay to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    interval.saturating_add(thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{jitter, BackendClient};
    use crate::{EngineConfig, Error};

    fn client(base_url: &str) -> BackendClient {
        BackendClient::new(&EngineConfig::default().with_base_url(base_url)).unwrap()
    }

    #[test]
    fn endpoints_are_appended_to_base_path() {
        let client = client("http://localhost:8000/api/v1/");
        assert_eq!(
            client.endpoint(&["experiments", "exp-1", "results"]).as_str(),
            "http://localhost:8000/api/v1/experiments/exp-1/results"
        );
    }

    #[test]
    fn path_segments_are_escaped() {
        let client = client("http://localhost:8000/api");
        assert_eq!(
            client.endpoint(&["experiments", "a/b c"]).as_str(),
            "http://localhost:8000/api/experiments/a%2Fb%20c"
        );
    }

    #[test]
    fn invalid_base_url() {
        let result = BackendClient::new(&EngineConfig::default().with_base_url("not a url"));
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));

        let result = BackendClient::new(&EngineConfig::default().with_base_url("mailto:me@x.org"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn jitter_is_additive() {
        let interval = Duration::from_millis(400);
        let result = jitter(interval, Duration::from_millis(200));
        assert!(result >= interval && result <= Duration::from_millis(600));
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_millis(400);
        assert_eq!(jitter(interval, Duration::ZERO), interval);
    }

    #[tokio::test]
    async fn unauthorized_client_fails_fast() {
        let client = client("http://localhost:9");
        client
            .unauthorized
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let result = client.get_experiment("exp-1").await;
        assert!(matches!(result, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn connection_errors_are_network_errors() {
        // Port 9 (discard) is not expected to accept connections.
        let config = EngineConfig::default()
            .with_base_url("http://127.0.0.1:9")
            .with_max_retries(0)
            .with_request_timeout(Duration::from_millis(500));
        let client = BackendClient::new(&config).unwrap();
        let result = client.list_user_segments().await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
