//! Narrate core: job state machine, event decoding and the query-cache reconciler.
mod cache;
mod effect;
mod event;
mod machine;
mod msg;
mod optimistic;
mod poll;
mod reconciler;
mod state;
mod timestamp;
mod update;
mod view_model;

pub use cache::{CacheEntry, InvalidationScope, JobFilter, QueryCache, QueryData, QueryKey};
pub use effect::Effect;
pub use event::{parse_event, JobEvent, JobRef, ProtocolError, UnitRef};
pub use machine::IllegalTransition;
pub use msg::Msg;
pub use optimistic::{Mutation, RollbackToken};
pub use poll::PollPolicy;
pub use reconciler::Reconciler;
pub use state::{Job, JobId, JobStatus, ParentEntity, ParentId, Unit, UnitId, UnitStatus};
pub use timestamp::parse_timestamp;
pub use update::update;
pub use view_model::{JobRowView, SyncViewModel};
