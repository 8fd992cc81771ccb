use crate::compute_graph::{ComputeGraph, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No intermediates stored for instance {0}")]
    UnknownInstance(InstanceId),
    #[error("Snapshot {instance} holds {stored} nodes, graph has {actual}")]
    NodeCountMismatch {
        instance: InstanceId,
        stored: usize,
        actual: usize,
    },
}

/// Caller-chosen label for one stored set of intermediates, e.g. a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<usize> for InstanceId {
    fn from(value: usize) -> Self {
        Self(value.to_string())
    }
}

/// Deep copies of every node's forward state, keyed by instance id.
#[derive(Debug, Default)]
pub struct IntermediateStore {
    snapshots: HashMap<InstanceId, Vec<NodeState>>,
}

impl IntermediateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures all node inputs and outputs, replacing any earlier snapshot with the same id.
    pub fn store(&mut self, graph: &ComputeGraph, instance: InstanceId) {
        let states: Vec<NodeState> = graph.iter().map(|node| node.state()).collect();
        log::debug!("Storing intermediates of {} nodes as {instance}", states.len());
        if self.snapshots.insert(instance.clone(), states).is_some() {
            log::debug!("Snapshot {instance} overwritten");
        }
    }

    /// Writes a snapshot back into the graph and republishes node outputs to
    /// their intermediate bindings. A node with no output in the snapshot leaves
    /// its intermediate binding as it is; only its own state is cleared.
    pub fn restore(&self, graph: &ComputeGraph, instance: &InstanceId) -> Result<(), SnapshotError> {
        let states = self
            .snapshots
            .get(instance)
            .ok_or_else(|| SnapshotError::UnknownInstance(instance.clone()))?;
        if states.len() != graph.len() {
            return Err(SnapshotError::NodeCountMismatch {
                instance: instance.clone(),
                stored: states.len(),
                actual: graph.len(),
            });
        }
        for (node, state) in graph.iter().zip(states.iter()) {
            if let (Some((_, slot)), Some(output)) = (&node.publish, &state.output) {
                *slot.write() = output.clone();
            }
            *node.state.write() = state.clone();
        }
        log::debug!("Restored intermediates of {instance}");
        Ok(())
    }

    pub fn discard(&mut self, instance: &InstanceId) -> bool {
        self.snapshots.remove(instance).is_some()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn contains(&self, instance: &InstanceId) -> bool {
        self.snapshots.contains_key(instance)
    }

    pub fn instances(&self) -> Vec<InstanceId> {
        let mut instances: Vec<_> = self.snapshots.keys().cloned().collect();
        instances.sort();
        instances
    }
}
