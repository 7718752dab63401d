//! Live disk-merge coordinator: tracks in-flight volume-chain merges
//! against a running VM's disks and drives each through extend, commit, and
//! cleanup.

pub mod chain;
pub mod clock;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod job;
pub mod merger;
pub mod persistence;
pub mod poll;
pub mod volume;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use chain::{Chain, Volume, VolumeFormat, VolumeId};
pub use config::MergeCoordinatorConfig;
pub use error::{ChainError, MergeError};
pub use hypervisor::HypervisorDriver;
pub use job::{DiskLocator, Job, JobId, JobState, JobStatus, MergeRequest};
pub use merger::Merger;
pub use persistence::{MetadataPersistenceAdapter, PersistenceAdapter};
pub use volume::{DriveMonitor, ExtendCallback, VolumeService};
