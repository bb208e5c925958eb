use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Authoritative job or segment event from the push channel.
    Event {
        event: crate::JobEvent,
        received_at: DateTime<Utc>,
    },
    /// User forced a refresh of part of the cache.
    RefreshRequested(crate::InvalidationScope),
    /// A fetch for `key` returned; replaces the cached entry.
    QueryLoaded {
        key: crate::QueryKey,
        data: crate::QueryData,
    },
    /// A fetch for `key` failed; the entry stays as it was.
    QueryFailed { key: crate::QueryKey, message: String },
    /// Fallback for placeholder wiring.
    NoOp,
}
