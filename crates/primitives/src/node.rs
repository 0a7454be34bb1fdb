//! §3 `Node` (static identity) and its composition with `NodeState`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::NodeState;

/// A single `{type, count}` hardware line item, e.g. `{"H100", 8}`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct HardwareSpec {
    #[serde(rename = "type")]
    pub hw_type: String,
    pub count: u32,
}

/// Identity and endpoints of one local ML machine. Created on
/// `RegisterNode`, modified only on `UpdateNode`, destroyed on `RemoveNode`
/// (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub inference_host: String,
    pub inference_port: u16,
    pub poc_host: String,
    pub poc_port: u16,
    pub max_concurrent: u32,
    /// Dense, monotonically increasing index assigned on registration; used
    /// as the PoC shard index (§3, I4).
    pub node_num: u64,
    pub hardware: Vec<HardwareSpec>,
    /// model_id -> launch args (flat `--key [value]` token list).
    pub models: BTreeMap<String, Vec<String>>,
}

impl Node {
    pub fn inference_addr(&self) -> String {
        format!("{}:{}", self.inference_host, self.inference_port)
    }

    pub fn poc_addr(&self) -> String {
        format!("{}:{}", self.poc_host, self.poc_port)
    }
}

/// A training job this node participates in.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrainingTask {
    pub id: String,
    pub master_addr: String,
    pub ranks: BTreeMap<String, u32>,
    pub world_size: u32,
}

/// Owns one `Node` and its `NodeState`. Held exclusively by the broker;
/// never handed out without a deep copy (§3: callers must not observe
/// internal handles such as `cancel_in_flight`).
#[derive(Clone, Debug)]
pub struct NodeWithState {
    pub node: Node,
    pub state: NodeState,
}

impl NodeWithState {
    pub fn new(node: Node, state: NodeState) -> Self {
        Self { node, state }
    }

    /// A deep copy safe to hand out to callers: drops the cancellation
    /// handle, which is otherwise private to the reconciler.
    pub fn to_snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node: self.node.clone(),
            intended_status: self.state.intended_status,
            current_status: self.state.current_status,
            intended_poc_status: self.state.intended_poc_status,
            current_poc_status: self.state.current_poc_status,
            reconciling: self.state.reconcile_info.is_some(),
            lock_count: self.state.lock_count,
            failure_reason: self.state.failure_reason.clone(),
            admin_state: self.state.admin_state,
        }
    }
}

/// Externally-observable view of a node: no cancellation handles, no
/// reconcile breadcrumb internals beyond "is one in flight".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: Node,
    pub intended_status: crate::status::HardwareNodeStatus,
    pub current_status: crate::status::HardwareNodeStatus,
    pub intended_poc_status: crate::status::PocStatus,
    pub current_poc_status: crate::status::PocStatus,
    pub reconciling: bool,
    pub lock_count: u32,
    pub failure_reason: String,
    pub admin_state: crate::status::AdminState,
}
