use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// One decoded server-sent event, exactly as the server framed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMessage {
    /// `event:` field; `None` for default (`message`) events.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Server reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Push,
    Polling,
    None,
}

/// Observable state of the push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub channel_type: ChannelType,
    pub last_event_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub events_received: u64,
    /// Time since the current channel opened; `None` unless connected.
    pub uptime: Option<Duration>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            channel_type: ChannelType::None,
            last_event_time: None,
            reconnect_attempts: 0,
            events_received: 0,
            uptime: None,
        }
    }
}

impl ConnectionSnapshot {
    pub fn is_polling(&self) -> bool {
        self.channel_type == ChannelType::Polling
    }
}

/// Failures of the push channel. All of them are recovered by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("push transport unsupported")]
    Unsupported,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server answered {status}")]
    HttpStatus { status: u16 },
    #[error("unexpected content type {0:?}")]
    ContentType(Option<String>),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("no data for {0:?}")]
    IdleTimeout(Duration),
    #[error("stream closed by server")]
    Closed,
}

/// Error of a REST request against the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: RequestFailure,
    pub message: String,
}

impl RequestError {
    pub(crate) fn new(kind: RequestFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    Network,
    Decode,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFailure::InvalidUrl => write!(f, "invalid url"),
            RequestFailure::HttpStatus(code) => write!(f, "http status {code}"),
            RequestFailure::Timeout => write!(f, "timeout"),
            RequestFailure::Network => write!(f, "network error"),
            RequestFailure::Decode => write!(f, "undecodable response"),
        }
    }
}
