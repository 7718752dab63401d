//! Cleanup worker: the per-job background task that finishes a merge once
//! its block-commit job has left `COMMIT`.
//!
//! Runs the six steps outlined for the state: disable the drive monitor,
//! refresh the base volume's size, pivot (active merges only) with bounded
//! retry, reconcile the chain metadata, tear down the obsolete top volume,
//! re-enable the drive monitor. The worker never touches the job table —
//! it reports back only through `state`, an atomic flag the `Merger`
//! samples on its own schedule and that determines when the job is finally
//! removed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::chain::{Chain, VolumeId};
use crate::config::MergeCoordinatorConfig;
use crate::hypervisor::{HypervisorDriver, PivotError};
use crate::volume::{DriveMonitor, VolumeService};

/// Polling granularity while waiting for the post-pivot chain to land.
/// Independent of `cleanup_wait_interval`, which governs pivot retries —
/// this wait is for the domain description to catch up, a much faster
/// condition in practice.
const CHAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanupState {
    Trying = 0,
    Retry = 1,
    Done = 2,
    Abort = 3,
}

impl CleanupState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Trying,
            1 => Self::Retry,
            2 => Self::Done,
            3 => Self::Abort,
            _ => unreachable!("invalid CleanupState encoding"),
        }
    }
}

/// Shared handle a [`CleanupContext`] reports through and the `Merger`
/// reads from — the only channel between the two once the worker is
/// spawned.
pub struct CleanupFlag(AtomicU8);

impl CleanupFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(CleanupState::Trying as u8)))
    }

    pub fn get(&self) -> CleanupState {
        CleanupState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: CleanupState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Whether a merge still owes a pivot, completed without needing one, or
/// was aborted against the hypervisor directly before either happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    Pivot,
    NoPivot,
    Aborted,
}

pub struct CleanupContext {
    pub drive: String,
    pub kind: CleanupKind,
    /// Chain as it stood right before the commit started — the reference
    /// point for both the expected post-merge layout and, if aborted, the
    /// chain to restore.
    pub pre_chain: Chain,
    pub base_id: String,
    pub top_id: String,
    pub flag: Arc<CleanupFlag>,
    pub hypervisor: Arc<dyn HypervisorDriver>,
    pub volume_service: Arc<dyn VolumeService>,
    pub drive_monitor: Arc<dyn DriveMonitor>,
    pub config: MergeCoordinatorConfig,
}

/// Spawns the worker and returns immediately; progress is observable only
/// through `ctx.flag`.
pub fn spawn_cleanup(ctx: CleanupContext) {
    tokio::spawn(run(ctx));
}

async fn run(ctx: CleanupContext) {
    ctx.drive_monitor.disable(&ctx.drive).await;
    let outcome = run_inner(&ctx).await;
    ctx.drive_monitor.enable(&ctx.drive).await;
    ctx.flag.set(outcome);
}

async fn run_inner(ctx: &CleanupContext) -> CleanupState {
    update_base_size(ctx).await;

    if ctx.kind == CleanupKind::Pivot {
        match retry_pivot(ctx).await {
            Ok(()) => {}
            Err(terminal) => return terminal,
        }
        wait_for_post_pivot_chain(ctx).await;
    }

    match ctx.kind {
        CleanupKind::Aborted => {
            if let Err(e) = ctx.hypervisor.sync_volume_chain(&ctx.drive, &ctx.pre_chain).await {
                warn!(drive = %ctx.drive, %e, "failed to restore pre-merge chain metadata");
            }
        }
        CleanupKind::Pivot | CleanupKind::NoPivot => {
            let expected = expected_chain(ctx);
            if let Err(e) = ctx.hypervisor.sync_volume_chain(&ctx.drive, &expected).await {
                warn!(drive = %ctx.drive, %e, "failed to reconcile post-merge chain metadata");
            }
            if let Some(top) = find_volume(&ctx.pre_chain, &ctx.top_id) {
                if let Err(e) = ctx.volume_service.teardown(&top).await {
                    warn!(drive = %ctx.drive, %e, "teardown of obsolete top volume failed");
                }
            }
        }
    }

    info!(drive = %ctx.drive, kind = ?ctx.kind, "cleanup finished");
    CleanupState::Done
}

async fn update_base_size(ctx: &CleanupContext) {
    let Some(base) = find_volume(&ctx.pre_chain, &ctx.base_id) else {
        warn!(drive = %ctx.drive, base = %ctx.base_id, "base volume missing from pre-merge chain snapshot");
        return;
    };

    match ctx.hypervisor.block_info(&ctx.drive).await {
        Ok(info) => {
            if let Err(e) = ctx.volume_service.update_size(&base, info.allocation).await {
                warn!(drive = %ctx.drive, %e, "failed to push base volume size update");
            }
        }
        Err(e) => warn!(drive = %ctx.drive, %e, "failed to read base volume size from hypervisor"),
    }
}

/// Retries `pivot()` until it succeeds, the job is aborted, or
/// `cleanup_max_retries` is exceeded (at which point the worker promotes
/// itself to `ABORT`, per the spec's allowance to bound retries).
async fn retry_pivot(ctx: &CleanupContext) -> Result<(), CleanupState> {
    let mut attempts = 0u32;
    loop {
        match ctx.hypervisor.pivot(&ctx.drive).await {
            Ok(()) => return Ok(()),
            Err(PivotError::NotReady(reason)) => {
                attempts += 1;
                ctx.flag.set(CleanupState::Retry);
                if attempts > ctx.config.cleanup_max_retries {
                    warn!(drive = %ctx.drive, %reason, attempts, "pivot retries exhausted, aborting cleanup");
                    return Err(CleanupState::Abort);
                }
                tokio::time::sleep(ctx.config.cleanup_wait_interval).await;
            }
            Err(PivotError::Unrecoverable(reason)) => {
                error!(drive = %ctx.drive, %reason, "unrecoverable pivot failure, aborting cleanup");
                return Err(CleanupState::Abort);
            }
        }
    }
}

async fn wait_for_post_pivot_chain(ctx: &CleanupContext) {
    let expected = expected_chain(ctx);
    let deadline = Instant::now() + ctx.config.post_pivot_chain_timeout;

    loop {
        match ctx.hypervisor.domain_chain(&ctx.drive).await {
            Ok(chain) if chain == expected => return,
            Ok(_) => {}
            Err(e) => warn!(drive = %ctx.drive, %e, "domain_chain RPC failed while waiting on post-pivot layout"),
        }
        if Instant::now() >= deadline {
            warn!(drive = %ctx.drive, "timed out waiting for domain chain to reflect post-pivot layout");
            return;
        }
        tokio::time::sleep(CHAIN_POLL_INTERVAL).await;
    }
}

fn expected_chain(ctx: &CleanupContext) -> Chain {
    match ctx.pre_chain.locate(&ctx.base_id, &ctx.top_id) {
        Ok((i, j)) => ctx.pre_chain.post_merge_chain(i, j),
        Err(e) => {
            warn!(drive = %ctx.drive, %e, "could not re-locate merge range in pre-merge chain snapshot, falling back to it unchanged");
            ctx.pre_chain.clone()
        }
    }
}

fn find_volume(chain: &Chain, volume_id: &str) -> Option<VolumeId> {
    chain.0.iter().find(|v| v.id.volume_id == volume_id).map(|v| v.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{sample_chain, FakeDriveMonitor, FakeHypervisor, FakeVolumeService};

    fn ctx_for(
        kind: CleanupKind,
        hypervisor: Arc<FakeHypervisor>,
        volume_service: Arc<FakeVolumeService>,
        drive_monitor: Arc<FakeDriveMonitor>,
    ) -> CleanupContext {
        CleanupContext {
            drive: "sda".into(),
            kind,
            pre_chain: sample_chain(),
            base_id: "base".into(),
            top_id: "top".into(),
            flag: CleanupFlag::new(),
            hypervisor,
            volume_service,
            drive_monitor,
            config: MergeCoordinatorConfig::default(),
        }
    }

    #[tokio::test]
    async fn internal_merge_reconciles_chain_and_tears_down_top() {
        let hv = Arc::new(FakeHypervisor::new());
        let vs = Arc::new(FakeVolumeService::new());
        let dm = Arc::new(FakeDriveMonitor::new());
        let ctx = ctx_for(CleanupKind::NoPivot, hv.clone(), vs.clone(), dm.clone());
        let flag = ctx.flag.clone();

        run(ctx).await;

        assert_eq!(flag.get(), CleanupState::Done);
        let chain = hv.chain().await;
        let ids: Vec<&str> = chain.0.iter().map(|v| v.id.volume_id.as_str()).collect();
        assert_eq!(ids, vec!["base", "mid", "active"]);
        assert_eq!(vs.torn_down().await.len(), 1);
        assert_eq!(dm.calls().await, vec!["disable:sda", "enable:sda"]);
    }

    #[tokio::test]
    async fn active_merge_pivots_then_reconciles() {
        let hv = Arc::new(FakeHypervisor::new());
        // pivot() consults `merge_range`, populated by block_commit in real
        // use; seed it directly since this test exercises cleanup alone.
        hv.start_block_job("sda", true, 100, 100).await;
        let _ = hv
            .block_commit("sda", "/vols/base", "/vols/top", 0, true)
            .await;
        let vs = Arc::new(FakeVolumeService::new());
        let dm = Arc::new(FakeDriveMonitor::new());
        let ctx = ctx_for(CleanupKind::Pivot, hv.clone(), vs.clone(), dm.clone());
        let flag = ctx.flag.clone();

        run(ctx).await;

        assert_eq!(flag.get(), CleanupState::Done);
        let chain = hv.chain().await;
        let ids: Vec<&str> = chain.0.iter().map(|v| v.id.volume_id.as_str()).collect();
        assert_eq!(ids, vec!["base", "mid", "active"]);
        assert_eq!(vs.torn_down().await.len(), 1);
    }

    #[tokio::test]
    async fn aborted_merge_restores_pre_merge_chain_and_skips_teardown() {
        let hv = Arc::new(FakeHypervisor::new());
        let vs = Arc::new(FakeVolumeService::new());
        let dm = Arc::new(FakeDriveMonitor::new());
        let ctx = ctx_for(CleanupKind::Aborted, hv.clone(), vs.clone(), dm.clone());
        let flag = ctx.flag.clone();
        let pre = ctx.pre_chain.clone();

        run(ctx).await;

        assert_eq!(flag.get(), CleanupState::Done);
        assert_eq!(hv.chain().await, pre);
        assert!(vs.torn_down().await.is_empty());
    }

    #[tokio::test]
    async fn pivot_not_ready_retries_then_aborts_after_max_retries() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.set_pivot_not_ready().await;
        let vs = Arc::new(FakeVolumeService::new());
        let dm = Arc::new(FakeDriveMonitor::new());
        let mut ctx = ctx_for(CleanupKind::Pivot, hv.clone(), vs.clone(), dm.clone());
        ctx.config.cleanup_max_retries = 1;
        ctx.config.cleanup_wait_interval = Duration::from_millis(1);
        let flag = ctx.flag.clone();

        run(ctx).await;

        assert_eq!(flag.get(), CleanupState::Abort);
        assert!(vs.torn_down().await.is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_pivot_failure_aborts_immediately() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.set_pivot_unrecoverable().await;
        let vs = Arc::new(FakeVolumeService::new());
        let dm = Arc::new(FakeDriveMonitor::new());
        let ctx = ctx_for(CleanupKind::Pivot, hv.clone(), vs.clone(), dm.clone());
        let flag = ctx.flag.clone();

        run(ctx).await;

        assert_eq!(flag.get(), CleanupState::Abort);
    }
}
