//! Persistence adapter: the set of active jobs as a JSON blob inside VM
//! metadata.
//!
//! The adapter never merges — the `Merger` reads the whole map, mutates it,
//! and writes the whole map back. Storage is a single text element on the
//! hypervisor domain; the hypervisor guarantees atomic publication of each
//! metadata-set call, which is the serialisation point with external
//! observers (§5 of the spec).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::PersistenceError;
use crate::hypervisor::HypervisorDriver;
use crate::job::{Job, JobId};

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// The full job map, or an empty map if nothing (or nothing readable)
    /// has been persisted yet.
    async fn load(&self) -> HashMap<JobId, Job>;

    /// Atomically replace the persisted job map with `jobs`.
    async fn store(&self, jobs: &HashMap<JobId, Job>) -> Result<(), PersistenceError>;
}

/// The only production [`PersistenceAdapter`]: round-trips the job map
/// through the hypervisor's metadata-set/get RPCs as a single JSON element.
pub struct MetadataPersistenceAdapter {
    hypervisor: Arc<dyn HypervisorDriver>,
}

impl MetadataPersistenceAdapter {
    pub fn new(hypervisor: Arc<dyn HypervisorDriver>) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl PersistenceAdapter for MetadataPersistenceAdapter {
    async fn load(&self) -> HashMap<JobId, Job> {
        let payload = match self.hypervisor.get_metadata().await {
            Ok(Some(payload)) => payload,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                warn!("failed to read merge job metadata, treating as empty: {}", e);
                return HashMap::new();
            }
        };

        match serde_json::from_str(&payload) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(
                    "merge job metadata is malformed, treating as empty: {} (payload: {})",
                    e, payload
                );
                HashMap::new()
            }
        }
    }

    async fn store(&self, jobs: &HashMap<JobId, Job>) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(jobs)
            .map_err(|e| PersistenceError::Publish(format!("failed to serialise jobs: {e}")))?;

        self.hypervisor
            .set_metadata(&payload)
            .await
            .map_err(|e| PersistenceError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeHypervisor;

    #[tokio::test]
    async fn load_tolerates_absent_metadata() {
        let hv = Arc::new(FakeHypervisor::new());
        let adapter = MetadataPersistenceAdapter::new(hv);
        assert!(adapter.load().await.is_empty());
    }

    #[tokio::test]
    async fn load_tolerates_malformed_metadata() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.set_metadata("not json").await.unwrap();
        let adapter = MetadataPersistenceAdapter::new(hv);
        assert!(adapter.load().await.is_empty());
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let hv = Arc::new(FakeHypervisor::new());
        let adapter = MetadataPersistenceAdapter::new(hv);

        let mut jobs = HashMap::new();
        let job = crate::testkit::sample_job();
        jobs.insert(job.id, job.clone());

        adapter.store(&jobs).await.unwrap();
        let loaded = adapter.load().await;
        assert_eq!(loaded.get(&job.id), Some(&job));
    }
}
