use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`ExperimentClient`](crate::ExperimentClient) and
/// [`AssignmentEngine`](crate::AssignmentEngine).
///
/// Durations are expressed in milliseconds on the wire so the configuration can be loaded from
/// the same JSON documents the experiment backend uses.
///
/// ```
/// # use std::time::Duration;
/// # use prompt_experiments::EngineConfig;
/// let config = EngineConfig::default()
///     .with_base_url("http://localhost:8000/api")
///     .with_cache_ttl(Duration::from_secs(60))
///     .with_event_tracking(false);
/// assert_eq!(config.cache_ttl(), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub(crate) enable_automatic_assignment: bool,
    pub(crate) enable_event_tracking: bool,
    pub(crate) enable_result_calculation: bool,
    /// Milliseconds. TTL of sticky assignments and of cached experiment lists.
    pub(crate) cache_ttl: u64,
    pub(crate) assignment_consistency: bool,
    /// Milliseconds. TTL of session-level assignments.
    pub(crate) default_session_timeout: u64,
    pub(crate) cache_capacity: usize,
    pub(crate) base_url: String,
    #[serde(skip_serializing)]
    pub(crate) api_key: Option<String>,
    /// Milliseconds.
    pub(crate) request_timeout: u64,
    pub(crate) max_retries: u32,
    /// Expected number of daily visitors, used for duration estimates.
    pub(crate) daily_traffic: u64,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            enable_automatic_assignment: true,
            enable_event_tracking: true,
            enable_result_calculation: true,
            cache_ttl: 5 * 60 * 1000,
            assignment_consistency: true,
            default_session_timeout: 30 * 60 * 1000,
            cache_capacity: EngineConfig::DEFAULT_CACHE_CAPACITY,
            base_url: EngineConfig::DEFAULT_BASE_URL.to_owned(),
            api_key: None,
            request_timeout: 10 * 1000,
            max_retries: 2,
            daily_traffic: EngineConfig::DEFAULT_DAILY_TRAFFIC,
        }
    }
}

impl EngineConfig {
    /// Default base URL of the experiment backend.
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:8000/api/v1";

    /// Default upper bound on cached assignments per cache.
    pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

    /// Default expected number of daily visitors.
    pub const DEFAULT_DAILY_TRAFFIC: u64 = 10_000;

    /// Parse configuration from JSON. Missing keys take their default values.
    pub fn from_json(json: &str) -> crate::Result<EngineConfig> {
        Ok(serde_json::from_str(json)?)
    }

    /// Override base URL of the experiment backend.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> EngineConfig {
        self.base_url = base_url.into();
        self
    }

    /// Bearer token sent to the experiment backend.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> EngineConfig {
        self.api_key = Some(api_key.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_automatic_assignment(mut self, enabled: bool) -> EngineConfig {
        self.enable_automatic_assignment = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn with_event_tracking(mut self, enabled: bool) -> EngineConfig {
        self.enable_event_tracking = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn with_result_calculation(mut self, enabled: bool) -> EngineConfig {
        self.enable_result_calculation = enabled;
        self
    }

    /// Reuse a session's assignment for repeat calls instead of recomputing it.
    pub fn with_assignment_consistency(mut self, enabled: bool) -> EngineConfig {
        self.assignment_consistency = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> EngineConfig {
        self.cache_ttl = ttl.as_millis() as u64;
        self
    }

    #[allow(missing_docs)]
    pub fn with_session_timeout(mut self, timeout: Duration) -> EngineConfig {
        self.default_session_timeout = timeout.as_millis() as u64;
        self
    }

    #[allow(missing_docs)]
    pub fn with_cache_capacity(mut self, capacity: usize) -> EngineConfig {
        self.cache_capacity = capacity;
        self
    }

    #[allow(missing_docs)]
    pub fn with_request_timeout(mut self, timeout: Duration) -> EngineConfig {
        self.request_timeout = timeout.as_millis() as u64;
        self
    }

    /// Number of retries after a failed backend request.
    pub fn with_max_retries(mut self, max_retries: u32) -> EngineConfig {
        self.max_retries = max_retries;
        self
    }

    #[allow(missing_docs)]
    pub fn with_daily_traffic(mut self, daily_traffic: u64) -> EngineConfig {
        self.daily_traffic = daily_traffic;
        self
    }

    #[allow(missing_docs)]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl)
    }

    #[allow(missing_docs)]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.default_session_timeout)
    }

    #[allow(missing_docs)]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}
