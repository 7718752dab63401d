//! In-memory fakes for the collaborator traits, plus shared test fixtures.
//!
//! Mirrors the role the Python test suite's `FakeDomain`/`FakeVM` played for
//! the system this design is distilled from: enough behavior to drive every
//! job through its real state machine without a hypervisor or storage
//! backend, with a few extra hooks (`start_block_job`, `external_abort`, ...)
//! a test uses to steer the fake into a particular scenario.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::chain::{Chain, Volume, VolumeFormat, VolumeId};
use crate::hypervisor::{
    BlockInfo, BlockJobInfo, BlockJobType, HypervisorDriver, HypervisorError, PivotError,
};
use crate::job::{DiskLocator, Job, JobId, JobState};
use crate::volume::{DriveMonitor, ExtendCallback, VolumeService, VolumeServiceError};

fn vol(id: &str, parent: Option<&str>, format: VolumeFormat, capacity: u64) -> Volume {
    Volume {
        id: VolumeId {
            storage_domain_id: "sd0".into(),
            image_id: "img0".into(),
            volume_id: id.into(),
        },
        format,
        capacity,
        apparentsize: capacity / 2,
        parent: parent.map(|p| VolumeId {
            storage_domain_id: "sd0".into(),
            image_id: "img0".into(),
            volume_id: p.into(),
        }),
        path: format!("/vols/{id}"),
        lease_path: format!("/leases/{id}"),
        lease_offset: 0,
    }
}

/// A four-volume active chain: `base <- mid <- top <- active`, matching the
/// shape of the spec's worked scenarios.
pub fn sample_chain() -> Chain {
    Chain::new(vec![
        vol("base", None, VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
        vol("mid", Some("base"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
        vol("top", Some("mid"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
        vol("active", Some("top"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
    ])
}

pub fn sample_job() -> Job {
    Job {
        id: JobId::new_v4(),
        drive: "sda".into(),
        disk: DiskLocator { storage_domain_id: "sd0".into(), image_id: "img0".into() },
        base: "base".into(),
        top: "top".into(),
        bandwidth: 0,
        state: JobState::Extend,
        extend_started: None,
        pivot: false,
        aborted: false,
        extra: serde_json::Map::new(),
    }
}

#[derive(Debug, Clone, Copy)]
enum PivotMode {
    Succeed,
    NotReady,
    Unrecoverable,
}

struct HypervisorState {
    chain: Chain,
    metadata: Option<String>,
    block_jobs: HashMap<String, BlockJobInfo>,
    /// `drive -> (base_id, top_id)`, recorded on `block_commit` so `pivot`
    /// and the scenario-steering helpers know what to collapse.
    merge_range: HashMap<String, (String, String)>,
    block_info: HashMap<String, BlockInfo>,
    commit_ready: bool,
    pivot_mode: PivotMode,
}

/// In-memory [`HypervisorDriver`]. Starts with [`sample_chain`] unless
/// [`FakeHypervisor::with_chain`] is used.
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::with_chain(sample_chain())
    }

    pub fn with_chain(chain: Chain) -> Self {
        Self {
            state: Mutex::new(HypervisorState {
                chain,
                metadata: None,
                block_jobs: HashMap::new(),
                merge_range: HashMap::new(),
                block_info: HashMap::new(),
                commit_ready: false,
                pivot_mode: PivotMode::Succeed,
            }),
        }
    }

    /// Registers a running block job for `drive` directly, bypassing
    /// `block_commit` — useful when a test wants to start already mid-COMMIT.
    pub async fn start_block_job(&self, drive: &str, active_commit: bool, cur: u64, end: u64) {
        let mut state = self.state.lock().await;
        state.block_jobs.insert(
            drive.to_string(),
            BlockJobInfo {
                job_type: if active_commit { BlockJobType::ActiveCommit } else { BlockJobType::Commit },
                bandwidth: 0,
                cur,
                end,
            },
        );
    }

    pub async fn set_commit_ready(&self, ready: bool) {
        self.state.lock().await.commit_ready = ready;
    }

    pub async fn set_pivot_not_ready(&self) {
        self.state.lock().await.pivot_mode = PivotMode::NotReady;
    }

    pub async fn set_pivot_unrecoverable(&self) {
        self.state.lock().await.pivot_mode = PivotMode::Unrecoverable;
    }

    pub async fn set_block_info(&self, drive: &str, info: BlockInfo) {
        self.state.lock().await.block_info.insert(drive.to_string(), info);
    }

    /// Simulates qemu finishing an internal commit: the chain is collapsed
    /// and the block job disappears, as if it had already happened by the
    /// time the coordinator next polls.
    pub async fn finish_internal_commit(&self, drive: &str) {
        let mut state = self.state.lock().await;
        if let Some((base, top)) = state.merge_range.remove(drive) {
            if let Ok((i, j)) = state.chain.locate(&base, &top) {
                state.chain = state.chain.post_merge_chain(i, j);
            }
        }
        state.block_jobs.remove(drive);
    }

    /// Simulates an operator running `blockJobAbort` with no `PIVOT` flag
    /// directly against the hypervisor: the job disappears, chain untouched.
    pub async fn external_abort(&self, drive: &str) {
        let mut state = self.state.lock().await;
        state.block_jobs.remove(drive);
        state.merge_range.remove(drive);
    }

    pub async fn chain(&self) -> Chain {
        self.state.lock().await.chain.clone()
    }
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorDriver for FakeHypervisor {
    async fn block_commit(
        &self,
        drive: &str,
        base_path: &str,
        top_path: &str,
        _bandwidth_bps: u64,
        active_commit: bool,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().await;
        let base_id = state
            .chain
            .0
            .iter()
            .find(|v| v.path == base_path)
            .map(|v| v.id.volume_id.clone())
            .ok_or_else(|| HypervisorError(format!("no volume at path {base_path}")))?;
        let top_id = state
            .chain
            .0
            .iter()
            .find(|v| v.path == top_path)
            .map(|v| v.id.volume_id.clone())
            .ok_or_else(|| HypervisorError(format!("no volume at path {top_path}")))?;

        state.merge_range.insert(drive.to_string(), (base_id, top_id));
        state.block_jobs.insert(
            drive.to_string(),
            BlockJobInfo {
                job_type: if active_commit { BlockJobType::ActiveCommit } else { BlockJobType::Commit },
                bandwidth: _bandwidth_bps,
                cur: 0,
                end: 100,
            },
        );
        Ok(())
    }

    async fn block_job_info(&self, drive: &str) -> Result<Option<BlockJobInfo>, HypervisorError> {
        Ok(self.state.lock().await.block_jobs.get(drive).copied())
    }

    async fn commit_ready(&self, _drive: &str) -> Result<bool, HypervisorError> {
        Ok(self.state.lock().await.commit_ready)
    }

    async fn pivot(&self, drive: &str) -> Result<(), PivotError> {
        let mut state = self.state.lock().await;
        match state.pivot_mode {
            PivotMode::NotReady => return Err(PivotError::NotReady("mirror not yet synced".into())),
            PivotMode::Unrecoverable => {
                return Err(PivotError::Unrecoverable("domain lost storage connectivity".into()))
            }
            PivotMode::Succeed => {}
        }

        if let Some((base, top)) = state.merge_range.remove(drive) {
            if let Ok((i, j)) = state.chain.locate(&base, &top) {
                state.chain = state.chain.post_merge_chain(i, j);
            }
        }
        state.block_jobs.remove(drive);
        Ok(())
    }

    async fn domain_chain(&self, _drive: &str) -> Result<Chain, HypervisorError> {
        Ok(self.state.lock().await.chain.clone())
    }

    async fn set_metadata(&self, payload: &str) -> Result<(), HypervisorError> {
        self.state.lock().await.metadata = Some(payload.to_string());
        Ok(())
    }

    async fn get_metadata(&self) -> Result<Option<String>, HypervisorError> {
        Ok(self.state.lock().await.metadata.clone())
    }

    async fn block_info(&self, drive: &str) -> Result<BlockInfo, HypervisorError> {
        // Defaults to a fully-allocated 10 GiB volume — as if the extend
        // that just completed had already been reflected on the storage
        // side. Tests exercising a short allocation call `set_block_info`
        // explicitly.
        Ok(self.state.lock().await.block_info.get(drive).copied().unwrap_or(BlockInfo {
            capacity: 10 * 1024 * 1024 * 1024,
            allocation: 10 * 1024 * 1024 * 1024,
            physical: 10 * 1024 * 1024 * 1024,
        }))
    }

    async fn sync_volume_chain(&self, _drive: &str, chain: &Chain) -> Result<(), HypervisorError> {
        self.state.lock().await.chain = chain.clone();
        Ok(())
    }
}

enum ExtendMode {
    /// Invoke the callback inline, before `extend()` returns.
    Immediate,
    /// Stash the callback; the test fires it with `fire_pending`.
    Manual,
}

struct VolumeServiceState {
    mode: ExtendMode,
    pending: HashMap<VolumeId, Arc<dyn ExtendCallback>>,
    sizes: HashMap<VolumeId, u64>,
    torn_down: Vec<VolumeId>,
}

/// In-memory [`VolumeService`]. Defaults to firing the extend callback
/// immediately; call [`FakeVolumeService::set_manual`] to hold callbacks
/// back for a test that needs to control exactly when (or whether) they
/// fire — e.g. the extend-timeout scenario, which never fires one at all.
pub struct FakeVolumeService {
    state: Mutex<VolumeServiceState>,
}

impl FakeVolumeService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VolumeServiceState {
                mode: ExtendMode::Immediate,
                pending: HashMap::new(),
                sizes: HashMap::new(),
                torn_down: Vec::new(),
            }),
        }
    }

    pub async fn set_manual(&self) {
        self.state.lock().await.mode = ExtendMode::Manual;
    }

    /// Fires a previously-held-back callback. Panics if none is pending for
    /// `volume` — tests should only call this after `set_manual`.
    pub async fn fire_pending(&self, volume: &VolumeId) {
        let callback = {
            let mut state = self.state.lock().await;
            state.pending.remove(volume).expect("no pending extend callback for volume")
        };
        callback.on_extended(volume.clone()).await;
    }

    pub async fn size_of(&self, volume: &VolumeId) -> Option<u64> {
        self.state.lock().await.sizes.get(volume).copied()
    }

    pub async fn torn_down(&self) -> Vec<VolumeId> {
        self.state.lock().await.torn_down.clone()
    }
}

impl Default for FakeVolumeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeService for FakeVolumeService {
    async fn extend(
        &self,
        volume: VolumeId,
        _new_size: u64,
        callback: Arc<dyn ExtendCallback>,
    ) -> Result<(), VolumeServiceError> {
        let mode = {
            let mut state = self.state.lock().await;
            match state.mode {
                ExtendMode::Immediate => None,
                ExtendMode::Manual => {
                    state.pending.insert(volume.clone(), callback.clone());
                    Some(())
                }
            }
        };

        if mode.is_none() {
            callback.on_extended(volume).await;
        }
        Ok(())
    }

    async fn prepare(&self, _volume: &VolumeId) -> Result<(), VolumeServiceError> {
        Ok(())
    }

    async fn teardown(&self, volume: &VolumeId) -> Result<(), VolumeServiceError> {
        self.state.lock().await.torn_down.push(volume.clone());
        Ok(())
    }

    async fn update_size(&self, volume: &VolumeId, apparentsize: u64) -> Result<(), VolumeServiceError> {
        self.state.lock().await.sizes.insert(volume.clone(), apparentsize);
        Ok(())
    }
}

/// In-memory [`DriveMonitor`], recording call order for assertions that the
/// cleanup worker disabled/enabled exactly once, around its real work.
pub struct FakeDriveMonitor {
    calls: Mutex<Vec<String>>,
}

impl FakeDriveMonitor {
    pub fn new() -> Self {
        Self { calls: Mutex::new(Vec::new()) }
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

impl Default for FakeDriveMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveMonitor for FakeDriveMonitor {
    async fn disable(&self, drive: &str) {
        self.calls.lock().await.push(format!("disable:{drive}"));
    }

    async fn enable(&self, drive: &str) {
        self.calls.lock().await.push(format!("enable:{drive}"));
    }
}
