use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Image conversion/readiness state (spec §3 Image): `Pending → Pulling →
/// Unpacking → Converting → Ready | Failed`, monotonic forward except
/// `Failed`, which is terminal — retries start a new build rather than
/// resuming a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Pulling,
    Unpacking,
    Converting,
    Ready,
    Failed,
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Pulling => "pulling",
            Self::Unpacking => "unpacking",
            Self::Converting => "converting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl ImageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Container metadata extracted from the OCI image config (spec §4.B),
/// carried forward into the converted image so the instance engine can
/// synthesize a default command line without re-reading the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// A converted, content-addressed image (spec §3 Image). Identity is the
/// `(repo, digest)` pair; tags are mutable pointers resolved at lookup time,
/// never stored as part of the record's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub repo: String,
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub arch: String,
    pub status: ImageStatus,
    pub size_bytes: u64,
    pub metadata: ContainerMetadata,
    pub source_ref: String,
    pub created_at: String,
    pub failure_reason: Option<String>,
}

impl Image {
    /// Fully-qualified reference as accepted back by `getImage`/`createInstance`.
    pub fn digest_ref(&self) -> String {
        format!("{}@{}", self.repo, self.digest)
    }
}

/// Layer-level dedup ledger entry used during `pullAndUnpack` (spec §4.B) —
/// keyed by layer digest so a shared base layer across repos is only
/// unpacked once into the OCI blob cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub digest: String,
    pub size_bytes: u64,
    pub refcount: u32,
}

pub type LayerLedger = BTreeMap<String, LayerRecord>;
