//! Volume chain model: ordered overlay volumes plus the arithmetic needed
//! to validate and compute the effect of collapsing a sub-range of them.

use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// Storage-side identity of a volume: `(storage-domain-id, image-id,
/// volume-id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId {
    pub storage_domain_id: String,
    pub image_id: String,
    pub volume_id: String,
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.volume_id)
    }
}

/// On-disk format. A raw volume cannot be grown virtually by this
/// coordinator — its capacity must already cover the merge before `merge()`
/// is called.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeFormat {
    Raw,
    Cow,
}

/// One volume in a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub id: VolumeId,
    pub format: VolumeFormat,
    /// Virtual size, in bytes.
    pub capacity: u64,
    /// Allocated size, in bytes.
    pub apparentsize: u64,
    pub parent: Option<VolumeId>,
    pub path: String,
    pub lease_path: String,
    pub lease_offset: u64,
}

/// An ordered sequence `[v0, .., vn]`, `v0` the base and `vn` the active
/// (top-of-stack) layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Chain(pub Vec<Volume>);

impl Chain {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self(volumes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Index of the active (topmost) volume.
    pub fn active_index(&self) -> Option<usize> {
        if self.0.is_empty() { None } else { Some(self.0.len() - 1) }
    }

    fn index_of(&self, volume_id: &str) -> Option<usize> {
        self.0.iter().position(|v| v.id.volume_id == volume_id)
    }

    /// Locate `base_id` and `top_id` in the chain, returning their indices
    /// `(i, j)` with `i < j`.
    pub fn locate(&self, base_id: &str, top_id: &str) -> Result<(usize, usize), ChainError> {
        let i = self
            .index_of(base_id)
            .ok_or_else(|| ChainError::BaseNotFound { base: base_id.to_string() })?;
        let j = self
            .index_of(top_id)
            .ok_or_else(|| ChainError::TopNotFound { top: top_id.to_string() })?;

        if i >= j {
            return Err(ChainError::BadOrder {
                base: base_id.to_string(),
                top: top_id.to_string(),
            });
        }

        Ok((i, j))
    }

    /// The minimum virtual size the base must have after the merge: the
    /// maximum `capacity` over `chain[i..=j]`.
    ///
    /// Fails `DestinationTooSmall` if `chain[i]` is raw and its capacity is
    /// below that maximum — a raw volume's virtual size cannot be grown by
    /// this coordinator, so the caller must have expanded it beforehand.
    pub fn required_base_capacity(&self, i: usize, j: usize) -> Result<u64, ChainError> {
        let base = &self.0[i];
        let required = self.0[i..=j].iter().map(|v| v.capacity).max().unwrap_or(base.capacity);

        if base.format == VolumeFormat::Raw && base.capacity < required {
            return Err(ChainError::DestinationTooSmall {
                base: base.id.volume_id.clone(),
                actual: base.capacity,
                required,
            });
        }

        Ok(required)
    }

    /// The chain that results from collapsing `chain[i..=j]` into a single
    /// volume retaining the base's identity: volumes strictly between and
    /// including the merge-range top are removed, and the surviving
    /// successor (if any) has its `parent` pointer rewritten to the base.
    ///
    /// Edge cases: `i == 0` leaves the base as the new root (`parent` stays
    /// `None`); `j` at the last index (an active-layer merge) yields a
    /// chain ending at `i`; `j == i + 1` is the degenerate single-volume
    /// removal.
    pub fn post_merge_chain(&self, i: usize, j: usize) -> Chain {
        let mut result: Vec<Volume> = self.0[..=i].to_vec();

        if let Some(successor) = self.0.get(j + 1) {
            let mut successor = successor.clone();
            successor.parent = Some(result[i].id.clone());
            result.push(successor);
            result.extend(self.0[j + 2..].iter().cloned());
        }

        Chain(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn active_merge_chain() -> Chain {
        Chain::new(vec![
            vol("base", None, VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
            vol("mid", Some("base"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
            vol("top", Some("mid"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
            vol("active", Some("top"), VolumeFormat::Cow, 10 * 1024 * 1024 * 1024),
        ])
    }

    #[test]
    fn locate_orders_base_before_top() {
        let chain = active_merge_chain();
        assert_eq!(chain.locate("base", "active").unwrap(), (0, 3));
    }

    #[test]
    fn locate_rejects_reversed_order() {
        let chain = active_merge_chain();
        assert_eq!(
            chain.locate("active", "base").unwrap_err(),
            ChainError::BadOrder { base: "active".into(), top: "base".into() }
        );
    }

    #[test]
    fn locate_rejects_missing_volumes() {
        let chain = active_merge_chain();
        assert!(matches!(
            chain.locate("nope", "active"),
            Err(ChainError::BaseNotFound { .. })
        ));
        assert!(matches!(
            chain.locate("base", "nope"),
            Err(ChainError::TopNotFound { .. })
        ));
    }

    #[test]
    fn raw_base_too_small_is_rejected() {
        let chain = Chain::new(vec![
            vol("base", None, VolumeFormat::Raw, 1024 * 1024 * 1024),
            vol("top", Some("base"), VolumeFormat::Cow, 2 * 1024 * 1024 * 1024),
        ]);
        let (i, j) = chain.locate("base", "top").unwrap();
        assert_eq!(
            chain.required_base_capacity(i, j).unwrap_err(),
            ChainError::DestinationTooSmall {
                base: "base".into(),
                actual: 1024 * 1024 * 1024,
                required: 2 * 1024 * 1024 * 1024,
            }
        );
    }

    #[test]
    fn active_merge_collapses_to_base_only() {
        let chain = active_merge_chain();
        let (i, j) = chain.locate("base", "active").unwrap();
        assert_eq!(j, chain.active_index().unwrap());
        let post = chain.post_merge_chain(i, j);
        assert_eq!(post.0.len(), 1);
        assert_eq!(post.0[0].id.volume_id, "base");
        assert_eq!(post.0[0].parent, None);
    }

    #[test]
    fn internal_merge_keeps_base_and_rewires_successor() {
        // [base, A, B, top, active], merge A..B.
        let chain = Chain::new(vec![
            vol("base", None, VolumeFormat::Cow, 1),
            vol("A", Some("base"), VolumeFormat::Cow, 1),
            vol("B", Some("A"), VolumeFormat::Cow, 1),
            vol("top", Some("B"), VolumeFormat::Cow, 1),
            vol("active", Some("top"), VolumeFormat::Cow, 1),
        ]);
        let (i, j) = chain.locate("A", "B").unwrap();
        let post = chain.post_merge_chain(i, j);
        let ids: Vec<&str> = post.0.iter().map(|v| v.id.volume_id.as_str()).collect();
        assert_eq!(ids, vec!["base", "A", "top", "active"]);
        assert_eq!(post.0[2].parent.as_ref().unwrap().volume_id, "A");
    }

    #[test]
    fn degenerate_single_volume_removal() {
        let chain = active_merge_chain();
        // merge mid..top: j == i + 1
        let (i, j) = chain.locate("mid", "top").unwrap();
        assert_eq!(j, i + 1);
        let post = chain.post_merge_chain(i, j);
        let ids: Vec<&str> = post.0.iter().map(|v| v.id.volume_id.as_str()).collect();
        assert_eq!(ids, vec!["base", "mid", "active"]);
        assert_eq!(post.0[2].parent.as_ref().unwrap().volume_id, "mid");
    }
}
