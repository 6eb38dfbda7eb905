use std::time::Duration;

use crate::errors::ClientError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Configuration shared by the streaming transport and the store client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL, without a trailing `/api`.
    pub base_url: String,
    /// Connect timeout for every request.
    pub connect_timeout: Duration,
    /// Whole-request timeout for non-streaming store calls.
    ///
    /// Streaming exchanges are not bounded by this client.
    pub request_timeout: Duration,
    /// Bounded buffer between an exchange task and its consumer.
    pub stream_buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_buffer_capacity: 128,
        }
    }
}

impl ClientConfig {
    /// Creates a config pointing at `base_url` with default timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from `NOVEL_API_BASE_URL`, `NOVEL_CONNECT_TIMEOUT_SECS`
    /// and `NOVEL_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("NOVEL_API_BASE_URL")
            && !url.trim().is_empty()
        {
            config.base_url = url.trim().to_string();
        }
        if let Some(secs) = read_secs("NOVEL_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = secs;
        }
        if let Some(secs) = read_secs("NOVEL_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = secs;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the store request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the exchange event buffer size.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Rejects values the client cannot work with.
    pub fn validate(&self) -> Result<(), ClientError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ClientError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn read_secs(key: &str) -> Result<Option<Duration>, ClientError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ClientError::Config(format!("{key} must be whole seconds: {e}"))),
        _ => Ok(None),
    }
}
