//! Error taxonomy for the live disk-merge coordinator.
//!
//! Mirrors the split in `qarax-node`'s manager errors (`VmManagerError`,
//! `ImageStoreError`): one enum per failure surface, `thiserror`-derived,
//! with `#[from]` only where the conversion is lossless.

use thiserror::Error;

use crate::job::JobId;

/// Failure locating or sizing a merge range against a chain.
///
/// Surfaced from [`crate::merger::Merger::merge`] before any job is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("base volume {base} not found in chain")]
    BaseNotFound { base: String },

    #[error("top volume {top} not found in chain")]
    TopNotFound { top: String },

    #[error("base {base} is not below top {top} in the chain")]
    BadOrder { base: String, top: String },

    #[error(
        "raw base volume {base} has capacity {actual} bytes, \
         but the merge requires at least {required} bytes"
    )]
    DestinationTooSmall {
        base: String,
        actual: u64,
        required: u64,
    },
}

/// Failure starting or running a merge.
///
/// Covers both synchronous failures from `merge()` and failures observed
/// from the volume service's extend callback. Per the propagation policy,
/// callback-side errors are logged and translated into job removal — they
/// are never returned to a caller outside this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("drive {0} already has a merge job in progress")]
    DriveBusy(String),

    #[error("extend completed but base is still smaller than required: {0}")]
    ExtendInsufficient(String),

    #[error("hypervisor rejected block-commit for drive {drive}: {reason}")]
    CommitRejected { drive: String, reason: String },
}

// A pivot attempt's recoverable/terminal outcomes are `hypervisor::PivotError`
// — the cleanup worker's retry-vs-abort decision lives right at the RPC
// boundary that produces it, rather than behind a second error type here.

/// A failure reading or writing the persisted job table.
///
/// Per the persistence adapter's contract, absent or malformed blobs are
/// tolerated (treated as empty) rather than surfaced as this error —  this
/// type exists for the underlying transport failing outright (e.g. the
/// metadata-set RPC itself erroring).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to publish job table: {0}")]
    Publish(String),
}

// `HypervisorError` and `VolumeServiceError` — the "an RPC failed outright"
// errors for those two capability boundaries — live next to the traits they
// guard, in `hypervisor.rs` and `volume.rs` respectively.
