use serde::{Deserialize, Serialize};

use crate::time::utc_now;

/// Audit event types emitted by the image pipeline, instance engine, network
/// manager, and build orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditAction {
    ImageCreated,
    ImageReady,
    ImageFailed,
    ImageDeleted,
    InstanceCreated,
    InstanceDeleted,
    InstanceStandby,
    InstanceRestored,
    InstanceRebooted,
    VolumeAttached,
    VolumeDetached,
    NetworkCreated,
    NetworkDeleted,
    BuildCreated,
    BuildCancelled,
    BuildCompleted,
}

/// A single audit log entry. `subject` is an opaque string forwarded
/// unexamined from the caller — this crate carries no authorization logic of
/// its own (spec §1 non-goals), it only records who asked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub subject: Option<String>,
    pub resource_id: String,
    pub action: AuditAction,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(subject: Option<String>, resource_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            timestamp: utc_now(),
            subject,
            resource_id: resource_id.into(),
            action,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
