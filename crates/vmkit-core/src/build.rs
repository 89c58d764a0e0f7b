use serde::{Deserialize, Serialize};

/// Build lifecycle state (spec §3 Build, §4.H): `Queued → Building → Pushing
/// → Ready | Failed | Cancelled`. `Ready`/`Failed`/`Cancelled` are terminal;
/// a terminal record must never be overwritten by a non-terminal update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Pushing,
    Ready,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Pushing => "pushing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl BuildStatus {
    /// Once a build leaves `Queued`/`Building`/`Pushing` it never re-enters
    /// them (spec §4.H `cancelBuild` / `getBuild` terminal-state semantics).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Networking policy for the ephemeral builder VM (spec §4.H step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildNetworkPolicy {
    /// No egress; builder can only reach the source volume and itself.
    Isolated,
    /// Attached to the default network with outbound access.
    Egress,
}

/// Resource and timeout policy applied to a build's builder VM (spec §4.H,
/// preflight check against §4.I resource accounting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPolicy {
    pub network: BuildNetworkPolicy,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub timeout_secs: u64,
}

/// What the client asked to build: the target image coordinates the
/// produced artifact is pushed under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub image_repo: String,
    pub image_tag: Option<String>,
}

/// A single source-to-image build (spec §3 Build). Queued by the build
/// orchestrator until a builder VM slot is free, then run to completion,
/// failure, or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    /// Hypervisor runtime the builder VM runs under, e.g. `"cloud-hypervisor"`.
    pub runtime: String,
    pub request: BuildRequest,
    pub policy: BuildPolicy,
    pub status: BuildStatus,
    pub image_digest: Option<String>,
    pub error: Option<String>,
    /// Free-form provenance string (source commit, builder image digest, ...).
    pub provenance: Option<String>,
    pub builder_instance_id: Option<String>,
    pub duration_secs: Option<f64>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Build {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// `cancelBuild`/background-task updates must never clobber a terminal
    /// status (spec §4.H cancellation race, §8 terminal-state invariant).
    pub fn apply_status(&mut self, next: BuildStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: BuildStatus) -> Build {
        Build {
            id: "build-3f9a2c1e4b7d0a55c2e1".into(),
            runtime: "cloud-hypervisor".into(),
            request: BuildRequest { image_repo: "library/alpine".into(), image_tag: Some("nightly".into()) },
            policy: BuildPolicy {
                network: BuildNetworkPolicy::Egress,
                vcpus: 2,
                memory_bytes: 512 * 1024 * 1024,
                timeout_secs: 1800,
            },
            status,
            image_digest: None,
            error: None,
            provenance: None,
            builder_instance_id: None,
            duration_secs: None,
            queued_at: "2026-07-30T00:00:00Z".into(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn terminal_states_are_exactly_three() {
        assert!(!sample(BuildStatus::Queued).status.is_terminal());
        assert!(!sample(BuildStatus::Building).status.is_terminal());
        assert!(!sample(BuildStatus::Pushing).status.is_terminal());
        assert!(sample(BuildStatus::Ready).status.is_terminal());
        assert!(sample(BuildStatus::Failed).status.is_terminal());
        assert!(sample(BuildStatus::Cancelled).status.is_terminal());
    }

    #[test]
    fn active_tracks_non_terminal_states() {
        assert!(sample(BuildStatus::Queued).is_active());
        assert!(sample(BuildStatus::Building).is_active());
        assert!(sample(BuildStatus::Pushing).is_active());
        assert!(!sample(BuildStatus::Ready).is_active());
    }

    #[test]
    fn apply_status_refuses_to_overwrite_terminal() {
        let mut b = sample(BuildStatus::Cancelled);
        assert!(!b.apply_status(BuildStatus::Ready));
        assert_eq!(b.status, BuildStatus::Cancelled);
    }

    #[test]
    fn apply_status_updates_non_terminal() {
        let mut b = sample(BuildStatus::Queued);
        assert!(b.apply_status(BuildStatus::Building));
        assert_eq!(b.status, BuildStatus::Building);
    }

    #[test]
    fn build_json_roundtrips() {
        let b = sample(BuildStatus::Building);
        let json = serde_json::to_string(&b).unwrap();
        let parsed: Build = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, BuildStatus::Building);
        assert_eq!(parsed.request.image_repo, "library/alpine");
    }
}
