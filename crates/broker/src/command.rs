//! Tagged `Command` variants the broker's dispatcher matches on (§9 "dynamic
//! dispatch over commands": a closed-set match, not open polymorphism).
//! Every variant carries a `reply` channel sized to hold at least one value
//! — `tokio::oneshot` is always single-slot-buffered, so the "reject
//! commands with an unbuffered response channel" rule of §4.5.1/§7 holds
//! structurally for every command built through this module.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use mlnet_primitives::{
    AdminState, HardwareNodeStatus, HardwareSpec, Node, NodeResult, NodeSnapshot, TrainingTask,
};

use crate::errors::BrokerError;

/// Registration payload for `RegisterNode`/`UpdateNode` (§3 `Node`,
/// §6 `LoadNodeToBroker`).
#[derive(Clone, Debug)]
pub struct NodeRegistration {
    pub id: String,
    pub host: String,
    pub inference_host: String,
    pub inference_port: u16,
    pub poc_host: String,
    pub poc_port: u16,
    pub max_concurrent: u32,
    pub hardware: Vec<HardwareSpec>,
    pub models: BTreeMap<String, Vec<String>>,
}

/// One timestamped observation from the status-probe loop (§4.5.6).
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub node_id: String,
    pub new_status: HardwareNodeStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Priority {
    High,
    Low,
}

pub enum Command {
    RegisterNode {
        reg: NodeRegistration,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    UpdateNode {
        reg: NodeRegistration,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    RemoveNode {
        node_id: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    UpdateNodeHardware {
        node_id: String,
        hardware: Vec<HardwareSpec>,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    GetNodes {
        reply: oneshot::Sender<Vec<NodeSnapshot>>,
    },
    GetNodeByNodeNum {
        node_num: u64,
        reply: oneshot::Sender<Option<Node>>,
    },
    LockAvailableNode {
        model: String,
        reply: oneshot::Sender<Result<Option<Node>, BrokerError>>,
    },
    ReleaseNode {
        node_id: String,
        succeeded: bool,
        reply: oneshot::Sender<()>,
    },
    SetNodeAdminState {
        node_id: String,
        admin_state: AdminState,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    SetNodesActualStatus {
        updates: Vec<StatusUpdate>,
        reply: oneshot::Sender<()>,
    },
    StartPoc {
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    InitValidate {
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    InferenceUpAll {
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    UpdateNodeResult {
        result: NodeResult,
        reply: oneshot::Sender<()>,
    },
    LockNodesForTraining {
        node_ids: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    StartTraining {
        task: TrainingTask,
        participant: String,
        reply: oneshot::Sender<()>,
    },
    SyncNodes {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    /// §4.5.1: phase triggers, results, lifecycle and sync are high
    /// priority; node selection and read paths are low priority.
    pub fn priority(&self) -> Priority {
        use Command::*;
        match self {
            StartPoc { .. }
            | InitValidate { .. }
            | InferenceUpAll { .. }
            | UpdateNodeResult { .. }
            | SetNodesActualStatus { .. }
            | SetNodeAdminState { .. }
            | RegisterNode { .. }
            | RemoveNode { .. }
            | LockNodesForTraining { .. }
            | StartTraining { .. }
            | SyncNodes { .. } => Priority::High,
            LockAvailableNode { .. }
            | ReleaseNode { .. }
            | GetNodes { .. }
            | GetNodeByNodeNum { .. }
            | UpdateNode { .. }
            | UpdateNodeHardware { .. } => Priority::Low,
        }
    }
}
