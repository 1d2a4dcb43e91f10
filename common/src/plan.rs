//! Replication planning
//!
//! Given the catalogs of a source and a destination filesystem, [`plan`] computes which
//! source snapshots the destination is missing and, for each of them, the snapshot an
//! incremental send has to start from. Presence is decided by snapshot name only; the
//! creation times on the destination are not compared with the source.

use crate::catalog::{SnapshotCatalog, SnapshotRecord};

/// One snapshot to transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStep {
    pub target: SnapshotRecord,
    /// Snapshot immediately preceding `target` in the source chain, `None` for the first one
    pub predecessor: Option<SnapshotRecord>,
}

impl ReplicationStep {
    pub fn is_incremental(&self) -> bool {
        self.predecessor.is_some()
    }
}

impl std::fmt::Display for ReplicationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.predecessor {
            Some(predecessor) => write!(f, "{} -> {}", predecessor, self.target),
            None => write!(f, "{} (full)", self.target),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationPlan {
    steps: Vec<ReplicationStep>,
    present: Vec<SnapshotRecord>,
}

impl ReplicationPlan {
    /// Steps in ascending source creation order
    pub fn steps(&self) -> &[ReplicationStep] {
        &self.steps
    }

    /// Source snapshots that already exist on the destination
    pub fn present(&self) -> &[SnapshotRecord] {
        &self.present
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Compute the transfers needed to bring `destination` up to date with `source`.
pub fn plan(source: &SnapshotCatalog, destination: &SnapshotCatalog) -> ReplicationPlan {
    let mut result = ReplicationPlan::default();
    let mut predecessor: Option<&SnapshotRecord> = None;
    for record in source {
        if destination.contains_name(&record.name) {
            result.present.push(record.clone());
        } else {
            result.steps.push(ReplicationStep {
                target: record.clone(),
                predecessor: predecessor.cloned(),
            });
        }
        predecessor = Some(record);
    }
    result
}
