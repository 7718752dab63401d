//! Job record: the immutable-except-state descriptor of one merge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied job identifier, unique per VM.
pub type JobId = Uuid;

/// Storage locator for the drive a merge runs against — enough for the
/// volume service to resolve a path without the coordinator needing to
/// know its internal layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskLocator {
    pub storage_domain_id: String,
    pub image_id: String,
}

/// `EXTEND -> COMMIT -> CLEANUP`, persisted before every externally
/// observable side effect that depends on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Extend,
    Commit,
    Cleanup,
}

/// One merge in flight. Mutated only by the `Merger` (state transitions) or
/// by the cleanup worker signalling a terminal flag the `Merger` observes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub drive: String,
    pub disk: DiskLocator,
    pub base: String,
    pub top: String,
    pub bandwidth: u64,
    pub state: JobState,
    /// Monotonic timestamp (seconds since the coordinator's clock epoch),
    /// set on entry to `EXTEND` and cleared on transition to `COMMIT`.
    pub extend_started: Option<u64>,
    /// True iff `top` was the active layer at merge time.
    pub pivot: bool,
    /// Set when `query_jobs()` observes the block job vanish from an active
    /// (`pivot == true`) merge without ever reporting `commit_ready` — an
    /// operator aborted it directly against the hypervisor. Persisted
    /// alongside `pivot` so a crash between detecting this and the cleanup
    /// worker finishing doesn't lose the distinction on recovery: a plain
    /// `pivot == true` with no `aborted` flag would otherwise be
    /// indistinguishable from a pivot still genuinely in flight.
    #[serde(default)]
    pub aborted: bool,

    /// Fields this coordinator doesn't model but must round-trip unchanged
    /// — e.g. written by a newer coordinator version sharing the same
    /// metadata document.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Caller-facing request to `Merger::merge`.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub job_id: JobId,
    pub drive: String,
    pub disk: DiskLocator,
    pub base: String,
    pub top: String,
    pub bandwidth: u64,
}

/// Live status of one job, as returned from `query_jobs()`.
///
/// Counters are rendered as decimal strings with no thousands separator, as
/// specified for the wire format; `cur`/`end` default to `"0"` and
/// `bandwidth` to `0` when no live block-job info exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatus {
    pub id: JobId,
    pub drive: String,
    #[serde(rename = "imgUUID")]
    pub img_uuid: String,
    #[serde(rename = "jobType")]
    pub job_type: &'static str,
    #[serde(rename = "blockJobType")]
    pub block_job_type: &'static str,
    pub bandwidth: u64,
    pub cur: String,
    pub end: String,
}

impl JobStatus {
    pub fn zeroed(job: &Job) -> Self {
        Self {
            id: job.id,
            drive: job.drive.clone(),
            img_uuid: job.disk.image_id.clone(),
            job_type: "block",
            block_job_type: "commit",
            bandwidth: 0,
            cur: "0".to_string(),
            end: "0".to_string(),
        }
    }
}
