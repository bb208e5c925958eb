use crate::QueryKey;

/// Work the reconciler asks its host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch the query again and feed the result back as `Msg::QueryLoaded`.
    Refetch(QueryKey),
}
