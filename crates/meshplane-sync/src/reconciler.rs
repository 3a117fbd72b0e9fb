//! Record-version state machine.
//!
//! Local mutations go through [`mark_for_apply`] / [`mark_for_delete`] and
//! are then handed to [`dispatch`]. Agent reports go through
//! [`reconcile_update`], which either accepts the payload or asks the
//! caller to [`resync`].

use tracing::{debug, info, warn};

use meshplane_state::{ObjectMeta, ResourcePhase, ResourceStatus, SyncAction, SyncState};

use crate::annotations::{record_version_of, set_record_version};
use crate::dispatcher::ResourceDispatcher;
use crate::error::SyncResult;
use crate::record::SyncedRecord;

/// A status report sent back by an agent.
#[derive(Debug, Clone)]
pub struct AgentUpdate {
    /// Metadata as seen by the agent, including the version annotation.
    pub metadata: ObjectMeta,
    pub status: ResourceStatus,
    pub timestamp: u64,
}

/// What [`reconcile_update`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted { state: SyncState },
    /// The agent has not seen the stored version; re-dispatch `action`.
    Resync {
        action: SyncAction,
        stored: u64,
        reported: Option<u64>,
    },
}

impl UpdateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateOutcome::Accepted { .. })
    }
}

fn queue<R: SyncedRecord>(record: &mut R, action: SyncAction, now: u64) {
    let status = record.sync_status_mut();
    status.record_version += 1;
    status.state = SyncState::InQueue;
    status.action = action;
    status.error = None;
    record.set_updated_at(now);
}

/// Record a local create or update.
pub fn mark_for_apply<R: SyncedRecord>(record: &mut R, now: u64) {
    queue(record, SyncAction::Apply, now);
    debug!(
        kind = record.kind(),
        name = record.name(),
        record_version = record.record_version(),
        "queued apply"
    );
}

/// Record a local delete. The record stays stored until the agent confirms.
pub fn mark_for_delete<R: SyncedRecord>(record: &mut R, now: u64) {
    record.set_marked_for_deletion(true);
    queue(record, SyncAction::Delete, now);
    debug!(
        kind = record.kind(),
        name = record.name(),
        record_version = record.record_version(),
        "queued delete"
    );
}

/// Store an agent-reported apply failure. The record version is left as is.
pub fn mark_agent_error<R: SyncedRecord>(record: &mut R, error: &str, timestamp: u64) {
    warn!(kind = record.kind(), name = record.name(), %error, "agent failed to apply");
    let status = record.sync_status_mut();
    status.state = SyncState::ErroredAtAgent;
    status.error = Some(error.to_string());
    status.last_synced_at = Some(timestamp);
}

fn accept<R: SyncedRecord>(record: &mut R, update: &AgentUpdate, state: SyncState) {
    let metadata = record.metadata_mut();
    metadata.labels = update.metadata.labels.clone();
    metadata.annotations = update.metadata.annotations.clone();
    metadata.generation = update.metadata.generation;
    *record.resource_status_mut() = update.status.clone();

    let status = record.sync_status_mut();
    status.state = state;
    status.error = None;
    status.last_synced_at = Some(update.timestamp);
}

/// Compare an agent report with the stored record.
///
/// On a version match the payload is copied into `record`; otherwise
/// `record` is left untouched and the caller must resync.
pub fn reconcile_update<R: SyncedRecord>(record: &mut R, update: &AgentUpdate) -> UpdateOutcome {
    if !record.tracks_record_version() {
        accept(record, update, SyncState::ReceivedUpdateFromAgent);
        return UpdateOutcome::Accepted {
            state: SyncState::ReceivedUpdateFromAgent,
        };
    }

    let stored = record.record_version();
    let reported = record_version_of(&update.metadata.annotations);
    if reported != Some(stored) {
        warn!(
            kind = record.kind(),
            name = record.name(),
            stored,
            reported = ?reported,
            "record version mismatch, resync required"
        );
        return UpdateOutcome::Resync {
            action: record.sync_status().action,
            stored,
            reported,
        };
    }

    let state = match update.status.phase {
        ResourcePhase::Deleting => SyncState::DeletingAtAgent,
        ResourcePhase::Applying | ResourcePhase::Ready => SyncState::UpdatedAtAgent,
    };
    accept(record, update, state);
    debug!(
        kind = record.kind(),
        name = record.name(),
        record_version = stored,
        ?state,
        "agent update accepted"
    );
    UpdateOutcome::Accepted { state }
}

/// Hand the record's queued action to `cluster`.
pub async fn dispatch<R: SyncedRecord + Sync>(
    dispatcher: &dyn ResourceDispatcher,
    cluster: &str,
    record: &R,
) -> SyncResult<()> {
    let version = record.record_version();
    let action = record.sync_status().action;
    let kind = record.kind();
    let name = record.name().to_string();
    let mut object = record.to_object();

    match action {
        SyncAction::Apply => {
            set_record_version(&mut object.metadata.annotations, version);
            dispatcher
                .apply_to_target_cluster(cluster, &object, version)
                .await?;
        }
        SyncAction::Delete => {
            dispatcher.delete_from_target_cluster(cluster, &object).await?;
        }
    }
    info!(%cluster, kind, %name, record_version = version, ?action, "dispatched");
    Ok(())
}

/// Re-dispatch the last desired action without bumping the version.
pub async fn resync<R: SyncedRecord + Send + Sync>(
    dispatcher: &dyn ResourceDispatcher,
    cluster: &str,
    record: &mut R,
) -> SyncResult<()> {
    record.sync_status_mut().state = SyncState::InQueue;
    dispatch(dispatcher, cluster, &*record).await
}
