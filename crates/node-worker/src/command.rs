//! C3: tagged command variants the reconciler dispatches to a [`crate::NodeWorker`].
//!
//! Each variant is a closed-set instruction naming only its own payload
//! (§4.5.4 dispatch table, §9 "dynamic dispatch over commands"). Execution is
//! idempotent: every handler checks the node's observed state first and
//! short-circuits if it already matches the target (§4.3).

use mlnet_node_client::PocInitDto;
use mlnet_primitives::{HardwareNodeStatus, PocStatus, TrainingTask};

/// One reconciliation primitive (§4.5.4 dispatch table).
#[derive(Clone, Debug)]
pub enum NodeWorkerCommand {
    StopNode,
    StartPoc(PocInitDto),
    InitValidateNode(PocInitDto),
    InferenceUpNode { model: String, args: Vec<String> },
    StartTrainingNode { task: TrainingTask, participant: String },
    NoOp,
}

impl NodeWorkerCommand {
    /// The `(status, poc_status)` this command drives the node toward. Used
    /// to stamp `original_target`/`original_poc_target` on the resulting
    /// [`mlnet_primitives::NodeResult`] so the broker can detect staleness (I5).
    pub fn target(&self) -> (HardwareNodeStatus, PocStatus) {
        match self {
            Self::StopNode => (HardwareNodeStatus::Stopped, PocStatus::Idle),
            Self::StartPoc(_) => (HardwareNodeStatus::Poc, PocStatus::Generating),
            Self::InitValidateNode(_) => (HardwareNodeStatus::Poc, PocStatus::Validating),
            Self::InferenceUpNode { .. } => (HardwareNodeStatus::Inference, PocStatus::Idle),
            Self::StartTrainingNode { .. } => (HardwareNodeStatus::Training, PocStatus::Idle),
            Self::NoOp => (HardwareNodeStatus::Unknown, PocStatus::Idle),
        }
    }
}
