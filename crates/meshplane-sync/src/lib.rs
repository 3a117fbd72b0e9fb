//! meshplane-sync: optimistic-concurrency sync with remote agents.
//!
//! The control plane never talks to a cluster synchronously. It bumps a
//! record's version, hands the desired object to a [`ResourceDispatcher`]
//! with the version embedded as an annotation, and later reconciles the
//! agent's asynchronous reports against the stored version:
//!
//! ```text
//!  local mutation ──► InQueue ──dispatch──► agent
//!                                             │
//!        ┌──── version matches ◄──────────────┘
//!        │            └── no ──► resync (re-dispatch last action)
//!        ▼
//!  UpdatedAtAgent / DeletingAtAgent
//! ```
//!
//! Delivery is assumed at-least-once and unordered; the version comparison
//! is what keeps both sides converging.

pub mod annotations;
pub mod dispatcher;
pub mod error;
pub mod reconciler;
pub mod record;

pub use annotations::{RECORD_VERSION_ANNOTATION, record_version_of, set_record_version};
pub use dispatcher::{
    DispatchCall, DispatchFuture, DispatchOp, LogDispatcher, RecordingDispatcher,
    ResourceDispatcher, ResourceObject,
};
pub use error::{SyncError, SyncResult};
pub use reconciler::{
    AgentUpdate, UpdateOutcome, dispatch, mark_agent_error, mark_for_apply, mark_for_delete,
    reconcile_update, resync,
};
pub use record::SyncedRecord;
