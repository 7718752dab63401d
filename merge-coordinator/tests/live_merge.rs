//! End-to-end coverage of the worked scenarios: the full
//! `merge() -> extend callback -> query_jobs() -> cleanup` lifecycle, driven
//! entirely through the public `Merger` API against the in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use merge_coordinator::config::MergeCoordinatorConfig;
use merge_coordinator::hypervisor::BlockInfo;
use merge_coordinator::job::{DiskLocator, Job, JobId, JobState, MergeRequest};
use merge_coordinator::merger::Merger;
use merge_coordinator::testkit::{
    sample_chain, sample_job, FakeDriveMonitor, FakeHypervisor, FakeVolumeService,
};

fn request(job_id: JobId, base: &str, top: &str) -> MergeRequest {
    MergeRequest {
        job_id,
        drive: "sda".into(),
        disk: DiskLocator { storage_domain_id: "sd0".into(), image_id: "img0".into() },
        base: base.into(),
        top: top.into(),
        bandwidth: 0,
    }
}

/// Waits for the cleanup worker's disable/enable cycle to complete, the
/// signal that it has run to `DONE` (or `ABORT`) and the drive monitor has
/// been re-enabled.
async fn wait_for_drive_monitor_cycle(dm: &FakeDriveMonitor, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if dm.calls().await.iter().any(|c| c.starts_with("enable:")) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("cleanup worker did not finish in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn scenario_a_active_merge_happy_path() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "base", "active")).await.unwrap();

    // extend fires inline (FakeVolumeService's default mode), so the job
    // should already be in COMMIT as an active commit.
    let jobs = merger.dump_jobs().await;
    assert_eq!(jobs[&job_id].state, JobState::Commit);
    assert!(jobs[&job_id].pivot);

    hv.set_commit_ready(true).await;
    let statuses = merger.query_jobs().await;
    assert!(statuses.contains_key(&job_id));
    assert_eq!(merger.dump_jobs().await[&job_id].state, JobState::Cleanup);

    wait_for_drive_monitor_cycle(&dm, Duration::from_secs(2)).await;
    let statuses = merger.query_jobs().await;
    assert!(!statuses.contains_key(&job_id), "job should be removed once cleanup reports DONE");

    let chain = hv.chain().await;
    let ids: Vec<&str> = chain.0.iter().map(|v| v.id.volume_id.as_str()).collect();
    assert_eq!(ids, vec!["base"]);
    assert_eq!(vs.torn_down().await.len(), 1);
}

#[tokio::test]
async fn scenario_b_internal_merge_happy_path() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "mid", "top")).await.unwrap();
    assert!(!merger.dump_jobs().await[&job_id].pivot);

    // qemu finishes the commit before the next poll, as in the spec's
    // worked scenario.
    hv.finish_internal_commit("sda").await;
    let statuses = merger.query_jobs().await;
    assert!(statuses.contains_key(&job_id));

    wait_for_drive_monitor_cycle(&dm, Duration::from_secs(2)).await;
    let statuses = merger.query_jobs().await;
    assert!(!statuses.contains_key(&job_id));

    let chain = hv.chain().await;
    let ids: Vec<&str> = chain.0.iter().map(|v| v.id.volume_id.as_str()).collect();
    assert_eq!(ids, vec!["base", "mid", "active"]);
}

#[tokio::test]
async fn scenario_c_extend_timeout_removes_job() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    vs.set_manual().await;
    let dm = Arc::new(FakeDriveMonitor::new());
    let mut config = MergeCoordinatorConfig::default();
    config.extend_timeout = Duration::from_millis(0);
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), config);

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "base", "top")).await.unwrap();
    assert_eq!(merger.dump_jobs().await[&job_id].state, JobState::Extend);

    let statuses = merger.query_jobs().await;
    assert!(!statuses.contains_key(&job_id), "EXTEND job past its timeout should be removed");
    assert!(merger.dump_jobs().await.get(&job_id).is_none());
}

#[tokio::test]
async fn scenario_d_external_abort_restores_chain_without_teardown() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());
    let pre_merge_chain = hv.chain().await;

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "base", "active")).await.unwrap();
    assert!(merger.dump_jobs().await[&job_id].pivot);

    // operator runs blockJobAbort without PIVOT directly on the hypervisor
    hv.external_abort("sda").await;

    let statuses = merger.query_jobs().await;
    assert!(statuses.contains_key(&job_id));
    assert!(merger.dump_jobs().await[&job_id].aborted);

    wait_for_drive_monitor_cycle(&dm, Duration::from_secs(2)).await;
    let statuses = merger.query_jobs().await;
    assert!(!statuses.contains_key(&job_id));

    assert_eq!(hv.chain().await, pre_merge_chain, "chain must be restored, not collapsed");
    assert!(vs.torn_down().await.is_empty(), "top volume must not be torn down on external abort");
}

#[tokio::test]
async fn scenario_e_raw_base_too_small_is_rejected_before_any_job_is_created() {
    let mut chain = sample_chain();
    chain.0[0].format = merge_coordinator::chain::VolumeFormat::Raw;
    chain.0[0].capacity = 1024;
    let hv = Arc::new(FakeHypervisor::with_chain(chain));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    let err = merger.merge(request(job_id, "base", "active")).await.unwrap_err();
    assert!(matches!(err, merge_coordinator::error::MergeError::Chain(_)));
    assert!(merger.dump_jobs().await.is_empty());
}

#[tokio::test]
async fn scenario_f_duplicate_job_id_is_rejected() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    vs.set_manual().await;
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "base", "top")).await.unwrap();

    let err = merger.merge(request(job_id, "mid", "active")).await.unwrap_err();
    assert!(matches!(err, merge_coordinator::error::MergeError::DuplicateJob(_)));
}

#[tokio::test]
async fn scenario_g_extend_insufficient_allocation_removes_job() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    // The extend "succeeds" (the volume service fires its callback) but the
    // base's allocation, as the hypervisor reports it, is still far short of
    // what collapsing the whole chain requires.
    hv.set_block_info(
        "sda",
        BlockInfo {
            capacity: 10 * 1024 * 1024 * 1024,
            allocation: 1024 * 1024 * 1024,
            physical: 10 * 1024 * 1024 * 1024,
        },
    )
    .await;
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    merger.merge(request(job_id, "base", "active")).await.unwrap();

    assert!(
        merger.dump_jobs().await.get(&job_id).is_none(),
        "job should be removed once the extend callback sees the base is still too small"
    );
    assert_eq!(hv.chain().await, sample_chain(), "no block-commit should have been started");
}

#[tokio::test]
async fn recovered_extend_job_past_its_timeout_is_removed_on_first_tick() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let merger = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    // A job as a previous process would have persisted it mid-EXTEND,
    // with `extend_started` expressed as this process's epoch seconds —
    // the same basis a freshly constructed `SystemClock` reads from, since
    // it's wall-clock time rather than a per-process offset.
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut job = sample_job();
    job.state = JobState::Extend;
    job.extend_started = Some(now - 10_000);
    let job_id = job.id;

    let mut persisted = HashMap::new();
    persisted.insert(job_id, job);
    merger.load_jobs(persisted).await;
    assert_eq!(merger.dump_jobs().await[&job_id].state, JobState::Extend);

    let statuses = merger.query_jobs().await;
    assert!(
        !statuses.contains_key(&job_id),
        "a recovered EXTEND job whose deadline has long passed must be removed on the very first tick"
    );
    assert!(merger.dump_jobs().await.get(&job_id).is_none());
}

#[tokio::test]
async fn recovered_commit_job_reattaches_and_finishes_cleanup() {
    let hv = Arc::new(FakeHypervisor::with_chain(sample_chain()));
    let vs = Arc::new(FakeVolumeService::new());
    let dm = Arc::new(FakeDriveMonitor::new());
    let crashed = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());

    let job_id = JobId::new_v4();
    crashed.merge(request(job_id, "base", "active")).await.unwrap();
    assert_eq!(crashed.dump_jobs().await[&job_id].state, JobState::Commit);

    // Simulate a process restart: a brand new `Merger` over the same
    // hypervisor/volume-service/drive-monitor, seeded from whatever was last
    // persisted rather than carrying over any in-memory state.
    let persisted = crashed.dump_jobs().await;
    let recovered = Merger::new(hv.clone(), vs.clone(), dm.clone(), persistence(&hv), MergeCoordinatorConfig::default());
    recovered.load_jobs(persisted).await;

    hv.set_commit_ready(true).await;
    let statuses = recovered.query_jobs().await;
    assert!(statuses.contains_key(&job_id));
    assert_eq!(recovered.dump_jobs().await[&job_id].state, JobState::Cleanup);

    wait_for_drive_monitor_cycle(&dm, Duration::from_secs(2)).await;
    let statuses = recovered.query_jobs().await;
    assert!(!statuses.contains_key(&job_id));

    let chain = hv.chain().await;
    let ids: Vec<&str> = chain.0.iter().map(|v| v.id.volume_id.as_str()).collect();
    assert_eq!(ids, vec!["base"]);
}

fn persistence(hv: &Arc<FakeHypervisor>) -> Arc<dyn merge_coordinator::persistence::PersistenceAdapter> {
    Arc::new(merge_coordinator::persistence::MetadataPersistenceAdapter::new(hv.clone()))
}
