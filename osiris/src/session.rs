//! Per-run session: the single sink for events, metrics, logs, artifacts
//! and the final status record.

pub mod context;
pub mod events;
pub mod id;
pub mod masking;
pub mod status;

pub use context::{SealGuard, SessionContext, SessionError};
pub use events::{EventName, EventRecord, MetricName, MetricRecord};
pub use id::SessionId;
pub use status::Status;
