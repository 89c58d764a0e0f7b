use serde::{Deserialize, Serialize};

use crate::image::ImageStatus;

/// A single progress update emitted during image pull/convert (spec §4.C
/// `subscribeProgress`): `(status, percent, optional queue position,
/// optional error)`. Percent is monotonically non-decreasing within one
/// build; `Pending` maps to 0, `Ready` is exactly 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: ImageStatus,
    pub percent: u8,
    pub queue_position: Option<usize>,
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn pending(queue_position: Option<usize>) -> Self {
        Self { status: ImageStatus::Pending, percent: 0, queue_position, error: None }
    }

    pub fn ready() -> Self {
        Self { status: ImageStatus::Ready, percent: 100, queue_position: None, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: ImageStatus::Failed, percent: 0, queue_position: None, error: Some(error.into()) }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
