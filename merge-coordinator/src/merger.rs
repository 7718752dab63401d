//! The coordinator itself: one job table behind a single lock, driving each
//! job through `EXTEND -> COMMIT -> CLEANUP` and persisting before every
//! externally observable transition.
//!
//! Mirrors `qarax-node`'s `VmManager`: an `Arc<Inner>`-backed handle, cheap
//! to clone, with the table held under a `tokio::sync::Mutex` so it can be
//! locked across the `.await` points persistence requires.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::chain::{Chain, VolumeId};
use crate::cleanup::{spawn_cleanup, CleanupContext, CleanupFlag, CleanupKind, CleanupState};
use crate::clock::{Clock, SystemClock};
use crate::config::MergeCoordinatorConfig;
use crate::error::MergeError;
use crate::hypervisor::HypervisorDriver;
use crate::job::{Job, JobId, JobState, JobStatus, MergeRequest};
use crate::persistence::PersistenceAdapter;
use crate::poll::{poll_commit, PollOutcome};
use crate::volume::{DriveMonitor, ExtendCallback, VolumeService};

/// Everything the `Merger` knows about one job that isn't part of its
/// persisted record: the chain snapshot merge-time validation worked
/// against, and — once in `CLEANUP` — the handle to that job's worker.
struct JobEntry {
    job: Job,
    pre_chain: Chain,
    cached_status: JobStatus,
    cleanup: Option<Arc<CleanupFlag>>,
}

struct Inner {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    hypervisor: Arc<dyn HypervisorDriver>,
    volume_service: Arc<dyn VolumeService>,
    drive_monitor: Arc<dyn DriveMonitor>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: MergeCoordinatorConfig,
    clock: Arc<dyn Clock>,
}

/// Cheaply-cloneable coordinator handle. Intended to be owned by the
/// surrounding VM object, one per VM.
#[derive(Clone)]
pub struct Merger {
    inner: Arc<Inner>,
}

impl Merger {
    pub fn new(
        hypervisor: Arc<dyn HypervisorDriver>,
        volume_service: Arc<dyn VolumeService>,
        drive_monitor: Arc<dyn DriveMonitor>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: MergeCoordinatorConfig,
    ) -> Self {
        Self::with_clock(hypervisor, volume_service, drive_monitor, persistence, config, SystemClock::new())
    }

    pub fn with_clock(
        hypervisor: Arc<dyn HypervisorDriver>,
        volume_service: Arc<dyn VolumeService>,
        drive_monitor: Arc<dyn DriveMonitor>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: MergeCoordinatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                hypervisor,
                volume_service,
                drive_monitor,
                persistence,
                config,
                clock,
            }),
        }
    }

    /// Starts a merge: validates the request against the live chain,
    /// records an `EXTEND` job, persists it, then kicks off the volume
    /// extend. Returns as soon as the extend request is accepted — the rest
    /// happens off of [`ExtendCallback::on_extended`] and subsequent
    /// [`Merger::query_jobs`] ticks.
    #[instrument(skip(self), fields(job_id = %req.job_id, drive = %req.drive))]
    pub async fn merge(&self, req: MergeRequest) -> Result<(), MergeError> {
        let chain = self
            .inner
            .hypervisor
            .domain_chain(&req.drive)
            .await
            .map_err(|e| MergeError::CommitRejected { drive: req.drive.clone(), reason: e.0 })?;

        let (i, j) = chain.locate(&req.base, &req.top)?;
        let required_capacity = chain.required_base_capacity(i, j)?;
        let pivot = Some(j) == chain.active_index();
        let base_volume = chain.0[i].id.clone();

        let mut jobs = self.inner.jobs.lock().await;

        if jobs.contains_key(&req.job_id) {
            return Err(MergeError::DuplicateJob(req.job_id));
        }
        if jobs.values().any(|e| e.job.drive == req.drive) {
            return Err(MergeError::DriveBusy(req.drive));
        }

        let job = Job {
            id: req.job_id,
            drive: req.drive.clone(),
            disk: req.disk,
            base: req.base,
            top: req.top,
            bandwidth: req.bandwidth,
            state: JobState::Extend,
            extend_started: Some(self.inner.clock.now_secs()),
            pivot,
            aborted: false,
            extra: serde_json::Map::new(),
        };

        let cached_status = JobStatus::zeroed(&job);
        jobs.insert(
            req.job_id,
            JobEntry { job, pre_chain: chain, cached_status, cleanup: None },
        );
        self.persist_locked(&jobs).await;
        drop(jobs);

        info!(job_id = %req.job_id, required_capacity, pivot, "merge accepted, extend requested");

        let callback: Arc<dyn ExtendCallback> =
            Arc::new(ExtendDone { merger: self.clone(), job_id: req.job_id });
        self.inner
            .volume_service
            .extend(base_volume, required_capacity, callback)
            .await
            .map_err(|e| MergeError::CommitRejected { drive: req.job_id.to_string(), reason: e.0 })?;

        Ok(())
    }

    /// Advances every in-flight job by one tick and returns the live status
    /// of each. Idempotent: calling this twice with nothing changed in
    /// between produces the same result and issues no duplicate hypervisor
    /// calls beyond the `COMMIT`-phase poll itself.
    #[instrument(skip(self))]
    pub async fn query_jobs(&self) -> HashMap<JobId, JobStatus> {
        let mut jobs = self.inner.jobs.lock().await;
        let mut done = Vec::new();
        let mut to_spawn = Vec::new();
        let mut changed = false;

        for (id, entry) in jobs.iter_mut() {
            match entry.job.state {
                JobState::Extend => {
                    let started = entry.job.extend_started.unwrap_or_else(|| self.inner.clock.now_secs());
                    let elapsed = self.inner.clock.now_secs().saturating_sub(started);
                    if elapsed >= self.inner.config.extend_timeout.as_secs() {
                        warn!(job_id = %id, elapsed, "extend timed out, removing job");
                        done.push(*id);
                        changed = true;
                    }
                }
                JobState::Commit => {
                    match poll_commit(&mut entry.job, self.inner.hypervisor.as_ref()).await {
                        PollOutcome::Live(status) => entry.cached_status = status,
                        PollOutcome::HandToCleanup { last_known } => {
                            entry.cached_status = last_known;
                            changed = true;
                            to_spawn.push(*id);
                        }
                    }
                }
                JobState::Cleanup => {
                    if let Some(flag) = &entry.cleanup {
                        if flag.get() == CleanupState::Done {
                            info!(job_id = %id, "cleanup finished, removing job");
                            done.push(*id);
                            changed = true;
                        }
                        // RETRY/TRYING/ABORT: keep reporting the last known
                        // status: the job stays in the table either to keep
                        // retrying (RETRY/TRYING) or for operator
                        // intervention (ABORT).
                    }
                }
            }
        }

        for id in &done {
            jobs.remove(id);
        }
        if changed {
            self.persist_locked(&jobs).await;
        }

        // Workers start only after the CLEANUP transition above is durable —
        // a worker call (pivot, teardown) is externally observable, and must
        // never race ahead of the persisted record that explains it on
        // recovery.
        for id in to_spawn {
            let Some(entry) = jobs.get_mut(&id) else { continue };
            let kind = if entry.job.aborted {
                CleanupKind::Aborted
            } else if entry.job.pivot {
                CleanupKind::Pivot
            } else {
                CleanupKind::NoPivot
            };
            let flag = CleanupFlag::new();
            entry.cleanup = Some(flag.clone());
            spawn_cleanup(CleanupContext {
                drive: entry.job.drive.clone(),
                kind,
                pre_chain: entry.pre_chain.clone(),
                base_id: entry.job.base.clone(),
                top_id: entry.job.top.clone(),
                flag,
                hypervisor: self.inner.hypervisor.clone(),
                volume_service: self.inner.volume_service.clone(),
                drive_monitor: self.inner.drive_monitor.clone(),
                config: self.inner.config,
            });
        }

        jobs.values().map(|e| (e.job.id, e.cached_status.clone())).collect()
    }

    /// Snapshot of the persisted fields of every in-flight job.
    pub async fn dump_jobs(&self) -> HashMap<JobId, Job> {
        self.inner.jobs.lock().await.values().map(|e| (e.job.id, e.job.clone())).collect()
    }

    /// Restores a job table from a previous process's persisted state. Only
    /// legal before any `merge()` call on this `Merger`.
    ///
    /// Per the recovery rules: `EXTEND` jobs are restored as-is and left to
    /// time out naturally (the callback that would have completed them is
    /// gone). `COMMIT` jobs re-attach to their live block job by drive name.
    /// `CLEANUP` jobs get a fresh worker — `pre_chain` is re-derived from
    /// the live domain chain, since the original merge-time snapshot wasn't
    /// persisted; this is exact for `COMMIT`-phase jobs (nothing has
    /// touched the chain yet) and best-effort for jobs that crashed
    /// mid-`CLEANUP`.
    #[instrument(skip(self, jobs))]
    pub async fn load_jobs(&self, jobs: HashMap<JobId, Job>) {
        let mut table = self.inner.jobs.lock().await;
        let mut to_spawn = Vec::new();

        for (id, job) in jobs {
            let pre_chain = match self.inner.hypervisor.domain_chain(&job.drive).await {
                Ok(chain) => chain,
                Err(e) => {
                    warn!(job_id = %id, %e, "failed to read domain chain on recovery, using an empty snapshot");
                    Chain::default()
                }
            };
            let cached_status = JobStatus::zeroed(&job);
            if job.state == JobState::Cleanup {
                to_spawn.push(id);
            }

            table.insert(id, JobEntry { job, pre_chain, cached_status, cleanup: None });
        }

        // The recovered table is already durable — it's exactly what the
        // previous process persisted before it exited or crashed — but the
        // worker is only started once that's reaffirmed here, so a second
        // crash between this load and the first successful `query_jobs()`
        // tick still leaves a CLEANUP-state record behind to recover from.
        self.persist_locked(&table).await;

        for id in to_spawn {
            let Some(entry) = table.get_mut(&id) else { continue };
            let kind = if entry.job.aborted {
                CleanupKind::Aborted
            } else if entry.job.pivot {
                CleanupKind::Pivot
            } else {
                CleanupKind::NoPivot
            };
            let flag = CleanupFlag::new();
            entry.cleanup = Some(flag.clone());
            spawn_cleanup(CleanupContext {
                drive: entry.job.drive.clone(),
                kind,
                pre_chain: entry.pre_chain.clone(),
                base_id: entry.job.base.clone(),
                top_id: entry.job.top.clone(),
                flag,
                hypervisor: self.inner.hypervisor.clone(),
                volume_service: self.inner.volume_service.clone(),
                drive_monitor: self.inner.drive_monitor.clone(),
                config: self.inner.config,
            });
        }
    }

    async fn persist_locked(&self, jobs: &HashMap<JobId, JobEntry>) {
        let snapshot: HashMap<JobId, Job> = jobs.iter().map(|(id, e)| (*id, e.job.clone())).collect();
        if let Err(e) = self.inner.persistence.store(&snapshot).await {
            warn!(%e, "failed to persist job table, in-memory state is ahead of durable state");
        }
    }
}

/// Routes a volume service's extend completion back to the job it belongs
/// to. Tolerates the job having already been removed (timeout, or a
/// duplicate delivery) — a no-op in that case, per the volume service
/// contract that callbacks may be invoked more than once.
struct ExtendDone {
    merger: Merger,
    job_id: JobId,
}

#[async_trait]
impl ExtendCallback for ExtendDone {
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    async fn on_extended(&self, volume: VolumeId) {
        let mut jobs = self.merger.inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&self.job_id) else {
            info!("extend callback fired for a job that's no longer tracked, ignoring");
            return;
        };
        if entry.job.state != JobState::Extend {
            info!(state = ?entry.job.state, "extend callback fired for a job already past EXTEND, ignoring");
            return;
        }

        let required = match entry.pre_chain.locate(&entry.job.base, &entry.job.top) {
            Ok((i, j)) => entry.pre_chain.required_base_capacity(i, j).unwrap_or(0),
            Err(_) => 0,
        };

        let block_info = self.merger.inner.hypervisor.block_info(&entry.job.drive).await;
        let apparentsize = match block_info {
            Ok(info) => info.allocation,
            Err(e) => {
                warn!(%e, "failed to verify extended size, removing job");
                jobs.remove(&self.job_id);
                self.merger.persist_locked(&jobs).await;
                return;
            }
        };

        if apparentsize < required {
            let err = MergeError::ExtendInsufficient(format!(
                "base volume allocation is {apparentsize} bytes, need at least {required}"
            ));
            warn!(%err, "removing job");
            jobs.remove(&self.job_id);
            self.merger.persist_locked(&jobs).await;
            return;
        }

        let base = entry.pre_chain.0.iter().find(|v| v.id == volume);
        let (base_path, top_path) = match base.zip(
            entry.pre_chain.0.iter().find(|v| v.id.volume_id == entry.job.top),
        ) {
            Some((base, top)) => (base.path.clone(), top.path.clone()),
            None => {
                warn!("base or top volume missing from pre-merge chain snapshot, removing job");
                jobs.remove(&self.job_id);
                self.merger.persist_locked(&jobs).await;
                return;
            }
        };

        let active_commit = entry.job.pivot;
        match self
            .merger
            .inner
            .hypervisor
            .block_commit(&entry.job.drive, &base_path, &top_path, entry.job.bandwidth, active_commit)
            .await
        {
            Ok(()) => {
                entry.job.state = JobState::Commit;
                entry.job.extend_started = None;
                info!("block commit started");
            }
            Err(e) => {
                warn!(%e, "hypervisor rejected block commit, removing job");
                jobs.remove(&self.job_id);
            }
        }
        self.merger.persist_locked(&jobs).await;
    }
}
