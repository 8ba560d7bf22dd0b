use crate::error::EngineError;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WEBHOOK_RATE_LIMIT: u32 = 10;
pub const DEFAULT_API_RATE_LIMIT: u32 = 100;

/// Process-wide engine configuration. Built once at startup; never
/// mutated afterwards.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Origin used to construct worker callback URLs.
    pub base_url: Url,
    /// Total deadline for one webhook dispatch.
    pub callback_timeout: Duration,
    /// Per-IP requests per minute on the callback surface.
    pub webhook_rate_limit: u32,
    /// Per-IP requests per minute on the control surface.
    pub api_rate_limit: u32,
    /// Worker types to seed the registry with.
    pub worker_types: Vec<String>,
}

impl EngineConfig {
    pub fn new(base_url: &str) -> Result<Self, EngineError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| EngineError::Config(format!("BASE_URL is not a valid URL: {e}")))?;
        Ok(Self {
            base_url,
            callback_timeout: Duration::from_millis(DEFAULT_CALLBACK_TIMEOUT_MS),
            webhook_rate_limit: DEFAULT_WEBHOOK_RATE_LIMIT,
            api_rate_limit: DEFAULT_API_RATE_LIMIT,
            worker_types: Vec::new(),
        })
    }

    /// Read configuration from the environment. A missing `BASE_URL` is a
    /// fatal startup error.
    pub fn from_env() -> Result<Self, EngineError> {
        let base = std::env::var("BASE_URL")
            .map_err(|_| EngineError::Config("BASE_URL is required".to_string()))?;
        let mut config = Self::new(&base)?;

        if let Ok(raw) = std::env::var("CALLBACK_TIMEOUT_MS") {
            let ms: u64 = raw.parse().map_err(|_| {
                EngineError::Config(format!("CALLBACK_TIMEOUT_MS is not a number: {raw}"))
            })?;
            config.callback_timeout = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("WEBHOOK_RATE_LIMIT") {
            config.webhook_rate_limit = raw.parse().map_err(|_| {
                EngineError::Config(format!("WEBHOOK_RATE_LIMIT is not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = std::env::var("API_RATE_LIMIT") {
            config.api_rate_limit = raw.parse().map_err(|_| {
                EngineError::Config(format!("API_RATE_LIMIT is not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = std::env::var("WORKER_TYPES") {
            config.worker_types = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    /// Engine-hosted callback endpoint for one `(run, node)` dispatch.
    pub fn callback_url(&self, run_id: Uuid, node_id: &str) -> String {
        format!(
            "{}/api/stitch/callback/{run_id}/{node_id}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}
