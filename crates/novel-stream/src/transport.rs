use std::pin::Pin;

use futures::StreamExt as _;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{ClientError, ExchangeError};
use crate::request::ExchangeRequest;

/// Raw chunks of one streaming response, at the transport's own granularity.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, ExchangeError>> + Send + 'static>>;

/// Opens streaming exchanges with the backend.
///
/// Dropping the returned stream releases the underlying connection.
#[async_trait::async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Sends `request` and returns the response body as a byte stream.
    async fn open(&self, request: &ExchangeRequest) -> Result<ByteStream, ExchangeError>;
}

/// Transport over `POST /api/chat`.
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    /// Creates a transport from explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        // No overall timeout: a stalled exchange is bounded by the server.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport using `ClientConfig::from_env`.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl ExchangeTransport for HttpTransport {
    async fn open(&self, request: &ExchangeRequest) -> Result<ByteStream, ExchangeError> {
        let url = self.config.api_url("chat");
        debug!(agent = %request.agent, project = %request.project_name, granularity = %request.granularity, "opening exchange");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| ExchangeError::transport(format!("chat request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ExchangeError::Backend {
                status: status.as_u16(),
                message: body,
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| ExchangeError::transport(format!("streaming read failed: {e}")))
        });
        Ok(Box::pin(stream))
    }
}
