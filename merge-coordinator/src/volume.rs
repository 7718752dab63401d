//! The volume-service capability this coordinator consumes, and the
//! surrounding VM's drive-monitor watchdog.
//!
//! Both are out of scope per the spec; this module only defines the trait
//! boundaries. [`crate::testkit`] ships the only implementations.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::chain::VolumeId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("volume service error: {0}")]
pub struct VolumeServiceError(pub String);

/// Receiver for a completed extend. Implementations must tolerate being
/// invoked more than once for the same volume — the volume service may
/// retry delivery, and the second call is expected to be a harmless no-op
/// once the job it was meant for is gone.
#[async_trait]
pub trait ExtendCallback: Send + Sync {
    async fn on_extended(&self, volume: VolumeId);
}

/// Capability set exposed by the volume/storage backend, per §6 of the
/// spec. `extend` is asynchronous: it returns once the request has been
/// accepted, and `callback` fires later — potentially on a different task
/// than the one that called `extend`.
#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn extend(
        &self,
        volume: VolumeId,
        new_size: u64,
        callback: Arc<dyn ExtendCallback>,
    ) -> Result<(), VolumeServiceError>;

    async fn prepare(&self, volume: &VolumeId) -> Result<(), VolumeServiceError>;

    /// Non-fatal if the volume is already gone — callers treat that as
    /// success.
    async fn teardown(&self, volume: &VolumeId) -> Result<(), VolumeServiceError>;

    /// Push the base volume's freshly observed allocation into shared volume
    /// metadata. Best-effort: the cleanup worker logs and continues past a
    /// failure here rather than aborting the merge over it.
    async fn update_size(&self, volume: &VolumeId, apparentsize: u64) -> Result<(), VolumeServiceError>;
}

/// The surrounding VM's I/O watchdog for a drive, paused while the cleanup
/// worker manipulates the chain.
#[async_trait]
pub trait DriveMonitor: Send + Sync {
    async fn disable(&self, drive: &str);
    async fn enable(&self, drive: &str);
}
