//! Narrate engine: push channel, fan-out and the REST backend client.
mod backoff;
mod client;
mod connection;
mod fanout;
mod sse;
mod transport;
mod types;

pub use backoff::{BackoffPolicy, ReconnectDecision, ReconnectState};
pub use client::{Backend, BackendSettings, CancelOutcome, ReqwestBackend};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use fanout::{FanOut, Subscription};
pub use sse::{decode_body, EventStream, SseDecoder};
pub use transport::{EventTransport, ReqwestTransport, TransportSettings};
pub use types::{
    ChannelMessage, ChannelType, ConnectionSnapshot, ConnectionStatus, RequestError,
    RequestFailure, TransportError,
};
