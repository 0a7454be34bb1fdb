//! C5: registry of node workers by node id.

use std::collections::HashMap;

use mlnet_node_worker::NodeWorkerHandle;

pub struct WorkGroup {
    workers: HashMap<String, (NodeWorkerHandle, tokio::task::JoinHandle<()>)>,
}

impl WorkGroup {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn add_worker(&mut self, handle: NodeWorkerHandle, join: tokio::task::JoinHandle<()>) {
        self.workers
            .insert(handle.node_id().to_string(), (handle, join));
    }

    /// Removes a worker's entry and returns its handle and join handle so
    /// the caller can shut it down outside the work-group lock (§4.4):
    /// `parking_lot`'s guards aren't `Send`, so nothing here may be awaited
    /// while a guard is held.
    pub fn take_worker(&mut self, node_id: &str) -> Option<(NodeWorkerHandle, tokio::task::JoinHandle<()>)> {
        self.workers.remove(node_id)
    }

    /// Returns a cloned handle so callers never hold the work-group lock
    /// guard across an `.await` point.
    pub fn get_worker(&self, node_id: &str) -> Option<NodeWorkerHandle> {
        self.workers.get(node_id).map(|(h, _)| h.clone())
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }
}

impl Default for WorkGroup {
    fn default() -> Self {
        Self::new()
    }
}
