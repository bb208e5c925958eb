use std::time::Duration;

use narrate_logging::narrate_info;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use url::Url;

use crate::sse::{decode_body, EventStream};
use crate::TransportError;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Bound on connecting and receiving the response headers.
    pub connect_timeout: Duration,
    /// Longest silence tolerated on an open stream. The server sends a
    /// keepalive comment every 15 seconds.
    pub idle_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Opens push channels. One call is one connection attempt.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
    /// Whether this environment can hold a push channel at all.
    fn is_supported(&self) -> bool {
        true
    }

    async fn open(&self, url: &Url) -> Result<EventStream, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    settings: TransportSettings,
}

impl ReqwestTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        // No overall timeout: the stream is meant to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self { client, settings })
    }
}

#[async_trait::async_trait]
impl EventTransport for ReqwestTransport {
    async fn open(&self, url: &Url) -> Result<EventStream, TransportError> {
        let request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = tokio::time::timeout(self.settings.connect_timeout, request)
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "no response headers within {:?}",
                    self.settings.connect_timeout
                ))
            })?
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let is_event_stream = content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case("text/event-stream"));
        if !is_event_stream {
            return Err(TransportError::ContentType(content_type));
        }

        narrate_info!("Push channel open at {}", url);
        Ok(decode_body(response.bytes_stream(), self.settings.idle_timeout))
    }
}
