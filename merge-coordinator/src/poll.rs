//! COMMIT-phase polling: advances one job's live status on each
//! `query_jobs()` tick and decides when it's time to hand off to the
//! cleanup worker.
//!
//! An internal commit's only completion signal is the block job vanishing
//! from the hypervisor — qemu has already spliced the chain by then. An
//! active commit is different: it never disappears on its own. It finishes
//! when `commit_ready()` reports the mirror caught up, at which point a
//! pivot is still owed; if it vanishes *before* that, an operator aborted it
//! directly against the hypervisor.

use tracing::{debug, info, warn};

use crate::hypervisor::{BlockJobType, HypervisorDriver, HypervisorError};
use crate::job::{Job, JobState, JobStatus};

/// What `query_jobs()` should do with a `COMMIT` job after one poll.
pub enum PollOutcome {
    /// Still running; report this status and poll again next tick.
    Live(JobStatus),
    /// Time to hand off to the cleanup worker. `job.state` has already been
    /// advanced to `Cleanup` (and `job.aborted` set, if this was an external
    /// abort) — the caller spawns the worker and keeps reporting
    /// `last_known` until it signals `DONE`.
    HandToCleanup { last_known: JobStatus },
}

/// Poll the hypervisor for `job`'s live status and react. Mutates `job` in
/// place exactly when it's time to leave `COMMIT`.
pub async fn poll_commit(job: &mut Job, hypervisor: &dyn HypervisorDriver) -> PollOutcome {
    let info = match hypervisor.block_job_info(&job.drive).await {
        Ok(info) => info,
        Err(HypervisorError(reason)) => {
            warn!(job = %job.id, %reason, "block_job_info RPC failed, reporting stale status");
            return PollOutcome::Live(JobStatus::zeroed(job));
        }
    };

    match (info, job.pivot) {
        (None, false) => {
            info!(job = %job.id, "internal commit completed");
            hand_to_cleanup(job, false)
        }
        (None, true) => {
            info!(job = %job.id, "active commit vanished before pivot: treating as externally aborted");
            hand_to_cleanup(job, true)
        }
        (Some(info), false) => live_status(job, info),
        (Some(info), true) => match hypervisor.commit_ready(&job.drive).await {
            Ok(true) => {
                debug!(job = %job.id, "active commit mirror caught up, ready to pivot");
                hand_to_cleanup(job, false)
            }
            Ok(false) => live_status(job, info),
            Err(HypervisorError(reason)) => {
                warn!(job = %job.id, %reason, "commit_ready RPC failed, reporting stale status");
                PollOutcome::Live(JobStatus::zeroed(job))
            }
        },
    }
}

fn live_status(job: &Job, info: crate::hypervisor::BlockJobInfo) -> PollOutcome {
    debug!(job = %job.id, cur = info.cur, end = info.end, "commit in progress");
    PollOutcome::Live(JobStatus {
        id: job.id,
        drive: job.drive.clone(),
        img_uuid: job.disk.image_id.clone(),
        job_type: "block",
        block_job_type: match info.job_type {
            BlockJobType::Commit => "commit",
            BlockJobType::ActiveCommit => "activeCommit",
        },
        bandwidth: info.bandwidth,
        cur: info.cur.to_string(),
        end: info.end.to_string(),
    })
}

fn hand_to_cleanup(job: &mut Job, aborted: bool) -> PollOutcome {
    let last_known = JobStatus::zeroed(job);
    job.aborted = aborted;
    job.state = JobState::Cleanup;
    job.extend_started = None;
    PollOutcome::HandToCleanup { last_known }
}
