//! §3 `NodeResult` — the write-through protocol a worker uses to report the
//! outcome of a dispatched command back to the broker (§4.5.5).

use crate::status::{HardwareNodeStatus, PocStatus};

#[derive(Clone, Debug)]
pub struct NodeResult {
    pub node_id: String,
    pub succeeded: bool,
    pub final_status: HardwareNodeStatus,
    pub original_target: HardwareNodeStatus,
    pub final_poc_status: PocStatus,
    pub original_poc_target: PocStatus,
    pub error_message: Option<String>,
}
