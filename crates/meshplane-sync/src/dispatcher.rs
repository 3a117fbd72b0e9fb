//! The seam to the message bus that carries objects to cluster agents.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use meshplane_state::ObjectMeta;

use crate::annotations::record_version_of;
use crate::error::{SyncError, SyncResult};

/// A Kubernetes-style object as dispatched to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: serde_json::Value,
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = SyncResult<()>> + Send + 'a>>;

/// Posts desired state to a target cluster. Delivery is asynchronous; a
/// successful call only means the object was handed off.
pub trait ResourceDispatcher: Send + Sync {
    fn apply_to_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
        record_version: u64,
    ) -> DispatchFuture<'a>;

    fn delete_from_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
    ) -> DispatchFuture<'a>;
}

/// Emits every dispatch as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

impl ResourceDispatcher for LogDispatcher {
    fn apply_to_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
        record_version: u64,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            let body = serde_json::to_string(object).map_err(|e| SyncError::Dispatch {
                cluster: cluster.to_string(),
                reason: e.to_string(),
            })?;
            info!(
                %cluster,
                kind = %object.kind,
                name = %object.metadata.name,
                record_version,
                object = %body,
                "apply dispatched"
            );
            Ok(())
        })
    }

    fn delete_from_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            info!(
                %cluster,
                kind = %object.kind,
                name = %object.metadata.name,
                "delete dispatched"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOp {
    Apply,
    Delete,
}

/// One call observed by [`RecordingDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub op: DispatchOp,
    pub cluster: String,
    pub object: ResourceObject,
    /// Version passed to apply; `None` for deletes.
    pub record_version: Option<u64>,
}

impl DispatchCall {
    /// Version carried by the object's annotation.
    pub fn annotated_version(&self) -> Option<u64> {
        record_version_of(&self.object.metadata.annotations)
    }
}

/// In-memory dispatcher that records every call and can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<DispatchCall>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (without recording them).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, kind: &str, name: &str) -> Vec<DispatchCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.object.kind == kind && c.object.metadata.name == name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: DispatchCall) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Dispatch {
                cluster: call.cluster,
                reason: "dispatcher unavailable".to_string(),
            });
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(())
    }
}

impl ResourceDispatcher for RecordingDispatcher {
    fn apply_to_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
        record_version: u64,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            self.record(DispatchCall {
                op: DispatchOp::Apply,
                cluster: cluster.to_string(),
                object: object.clone(),
                record_version: Some(record_version),
            })
        })
    }

    fn delete_from_target_cluster<'a>(
        &'a self,
        cluster: &'a str,
        object: &'a ResourceObject,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            self.record(DispatchCall {
                op: DispatchOp::Delete,
                cluster: cluster.to_string(),
                object: object.clone(),
                record_version: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str) -> ResourceObject {
        ResourceObject {
            api_version: "meshplane.io/v1".to_string(),
            kind: "GlobalVpnDevice".to_string(),
            metadata: ObjectMeta::named(name),
            spec: serde_json::json!({ "ip": "10.0.0.1" }),
        }
    }

    #[tokio::test]
    async fn recording_dispatcher_records_and_fails() {
        let dispatcher = RecordingDispatcher::new();
        let obj = object("laptop");

        dispatcher
            .apply_to_target_cluster("platform", &obj, 2)
            .await
            .unwrap();
        dispatcher
            .delete_from_target_cluster("platform", &obj)
            .await
            .unwrap();

        let calls = dispatcher.calls_for("GlobalVpnDevice", "laptop");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].op, DispatchOp::Apply);
        assert_eq!(calls[0].record_version, Some(2));
        assert_eq!(calls[1].op, DispatchOp::Delete);

        dispatcher.set_failing(true);
        let err = dispatcher
            .apply_to_target_cluster("platform", &obj, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Dispatch { ref cluster, .. } if cluster == "platform"));
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn log_dispatcher_accepts_everything() {
        let obj = object("gateway");
        LogDispatcher
            .apply_to_target_cluster("platform", &obj, 1)
            .await
            .unwrap();
        LogDispatcher
            .delete_from_target_cluster("platform", &obj)
            .await
            .unwrap();
    }

    #[test]
    fn object_serializes_camel_case() {
        let json = serde_json::to_value(object("x")).unwrap();
        assert_eq!(json["apiVersion"], "meshplane.io/v1");
        assert_eq!(json["kind"], "GlobalVpnDevice");
    }
}
