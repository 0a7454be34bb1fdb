//! Per-node mutable state: §3 `PocStatus`, `HardwareNodeStatus`, `AdminState`,
//! `ReconcileInfo`, `NodeState`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::epoch::EpochMlNodeInfo;
use crate::node::TrainingTask;

/// Sub-state of a node while it is running a Proof-of-Compute phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PocStatus {
    Idle,
    Generating,
    Validating,
}

/// The mode an ML node is actually observed to be running, as reported by
/// `NodeState`/`PowStatus`/`InferenceHealth` or as driven toward by the
/// reconciler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HardwareNodeStatus {
    Unknown,
    Inference,
    Poc,
    Training,
    Stopped,
    Failed,
}

/// Admin on/off switch for a node, sticky from the epoch at which it was
/// toggled. See `should_be_operational` for the interpretation (§3, P8).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AdminState {
    pub enabled: bool,
    pub epoch: u64,
}

impl Default for AdminState {
    fn default() -> Self {
        Self {
            enabled: true,
            epoch: 0,
        }
    }
}

/// Breadcrumb that a worker command is in flight driving `current_status`
/// toward `(status, poc_status)`. Present iff a command is dispatched (I1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconcileInfo {
    pub status: HardwareNodeStatus,
    pub poc_status: PocStatus,
    pub task_id: Option<String>,
}

/// An opaque handle used to cancel an in-flight worker command. Cloning it
/// and invoking `cancel()` is idempotent; this is a thin wrapper over
/// `tokio_util::sync::CancellationToken` so the broker core never has to
/// reach past `mlnet_primitives` for the type. `identity` lets the
/// reconciler re-check "is this still the handle we just cancelled?" under
/// the write lock (§4.5.4 Phase A) without relying on token internals.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: tokio_util::sync::CancellationToken,
    identity: std::sync::Arc<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: tokio_util::sync::CancellationToken::new(),
            identity: std::sync::Arc::new(()),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancelHandle {
    fn eq(&self, other: &Self) -> bool {
        std::sync::Arc::ptr_eq(&self.identity, &other.identity)
    }
}

/// Per-model subset of launch args actually assigned to a node for the
/// current epoch by chain governance.
pub type EpochModelSnapshot = BTreeMap<String, Vec<String>>;

/// The mutable half of a node: desired vs. observed mode, locking, epoch
/// bookkeeping. Lives exclusively inside the broker's node map (§3).
#[derive(Clone, Debug)]
pub struct NodeState {
    pub intended_status: HardwareNodeStatus,
    pub current_status: HardwareNodeStatus,
    pub intended_poc_status: PocStatus,
    pub current_poc_status: PocStatus,
    pub reconcile_info: Option<ReconcileInfo>,
    pub cancel_in_flight: Option<CancelHandle>,
    pub training_task: Option<TrainingTask>,
    pub lock_count: u32,
    pub failure_reason: String,
    pub status_timestamp: DateTime<Utc>,
    pub admin_state: AdminState,
    pub epoch_models: EpochModelSnapshot,
    pub epoch_ml_nodes: BTreeMap<String, EpochMlNodeInfo>,
}

impl NodeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            intended_status: HardwareNodeStatus::Unknown,
            current_status: HardwareNodeStatus::Unknown,
            intended_poc_status: PocStatus::Idle,
            current_poc_status: PocStatus::Idle,
            reconcile_info: None,
            cancel_in_flight: None,
            training_task: None,
            lock_count: 0,
            failure_reason: String::new(),
            status_timestamp: now,
            admin_state: AdminState::default(),
            epoch_models: BTreeMap::new(),
            epoch_ml_nodes: BTreeMap::new(),
        }
    }

    /// Whether this node must keep serving inference through the PoC window
    /// because at least one of its assigned models has the POC_SLOT flag
    /// set for this epoch (GLOSSARY: POC_SLOT).
    pub fn should_continue_inference(&self) -> bool {
        self.epoch_ml_nodes.values().any(|info| info.has_poc_slot())
    }
}
