//! The hypervisor capability this coordinator consumes.
//!
//! Out of scope per the spec: the concrete transport (libvirt, or
//! otherwise). This module only defines the trait boundary plus the small
//! value types that cross it; [`crate::testkit::FakeHypervisor`] is the
//! only implementation this crate ships.

use async_trait::async_trait;
use thiserror::Error;

use crate::chain::Chain;

/// A hypervisor RPC failing outright — as opposed to succeeding with an
/// empty or negative result. Per the spec's open question, only a
/// successful `Ok(None)` from [`HypervisorDriver::block_job_info`] means
/// "the job is gone"; this variant must never be conflated with that.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("hypervisor error: {0}")]
pub struct HypervisorError(pub String);

/// Outcome of a pivot attempt ([`HypervisorDriver::pivot`]), mirroring the
/// two recoverable/terminal cases the cleanup worker must distinguish.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PivotError {
    #[error("not ready to pivot: {0}")]
    NotReady(String),
    #[error("unrecoverable pivot failure: {0}")]
    Unrecoverable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockJobType {
    Commit,
    ActiveCommit,
}

/// Live progress of a running block-commit job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockJobInfo {
    pub job_type: BlockJobType,
    pub bandwidth: u64,
    pub cur: u64,
    pub end: u64,
}

/// `blockInfo` result: `(capacity, allocation, physical)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Virtual size, bytes. Fixed at volume creation; a COW volume's
    /// capacity doesn't change when its allocation grows.
    pub capacity: u64,
    /// Bytes actually allocated on the backing storage — what an extend
    /// grows, and what a post-extend size check must compare against.
    pub allocation: u64,
    pub physical: u64,
}

/// Capability set exposed by the hypervisor driver, per §6 of the spec.
///
/// `active_commit` selects the `ACTIVE_COMMIT` flag on `block_commit` and
/// routes `pivot`/abort semantics accordingly; implementations must not
/// infer it from chain shape themselves — the caller (the `Merger`) derives
/// it once, from whether `top` is the active layer at merge time.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    async fn block_commit(
        &self,
        drive: &str,
        base_path: &str,
        top_path: &str,
        bandwidth_bps: u64,
        active_commit: bool,
    ) -> Result<(), HypervisorError>;

    /// `None` means the job is no longer known to the hypervisor (it
    /// finished, or was aborted externally). An `Err` means the RPC itself
    /// failed and nothing can be concluded about the job's state.
    async fn block_job_info(&self, drive: &str) -> Result<Option<BlockJobInfo>, HypervisorError>;

    /// Whether the domain reports the active-commit mirror as caught up and
    /// pivotable. Only meaningful for active commits; internal commits
    /// complete by the job disappearing from `block_job_info` instead.
    async fn commit_ready(&self, drive: &str) -> Result<bool, HypervisorError>;

    /// `blockJobAbort(drive, PIVOT)` — the hypervisor's idiom for finalising
    /// an active commit by pivoting the live disk onto the base.
    async fn pivot(&self, drive: &str) -> Result<(), PivotError>;

    /// Current chain as observed from the domain description, used both to
    /// reconcile metadata and to poll for the post-pivot layout.
    async fn domain_chain(&self, drive: &str) -> Result<Chain, HypervisorError>;

    /// Atomically publish `payload` under the coordinator's metadata
    /// element.
    async fn set_metadata(&self, payload: &str) -> Result<(), HypervisorError>;

    /// Read back the coordinator's metadata element, if present.
    async fn get_metadata(&self) -> Result<Option<String>, HypervisorError>;

    async fn block_info(&self, drive: &str) -> Result<BlockInfo, HypervisorError>;

    /// Push `chain` as the drive's authoritative volume-chain metadata —
    /// the cleanup worker's reconcile step. Distinct from
    /// `set_metadata`/`get_metadata`, which carry this coordinator's own job
    /// table; this is the surrounding VM's device metadata.
    async fn sync_volume_chain(&self, drive: &str, chain: &Chain) -> Result<(), HypervisorError>;
}
