//! Free functions over `NodeWithState` used by the dispatcher and the
//! reconciler: the availability predicate (§4.5.2) and the per-phase-command
//! target table (§4.5.3).

use mlnet_primitives::{
    should_be_operational, HardwareNodeStatus, NodeWithState, Phase, PocStatus,
};

/// §4.5.2 availability predicate, checked for every node considered by
/// `LockAvailableNode` (P2).
pub fn is_available_for(
    nws: &NodeWithState,
    requested_model: &str,
    epoch: u64,
    phase: Phase,
) -> bool {
    nws.state.intended_status == HardwareNodeStatus::Inference
        && nws.state.current_status == HardwareNodeStatus::Inference
        && nws.state.reconcile_info.is_none()
        && nws.state.lock_count < nws.node.max_concurrent
        && should_be_operational(&nws.state.admin_state, epoch, phase)
        && nws.node.models.contains_key(requested_model)
}

/// Which phase command is computing targets (§4.5.3 table).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhaseCommandKind {
    StartPoc,
    InitValidate,
    InferenceUpAll,
}

/// Resolves §4.5.3's per-node target for the given phase command. Returns
/// `None` when the row is "leave untouched" (node currently training under
/// `InferenceUpAll`).
pub fn resolve_target(
    nws: &NodeWithState,
    epoch: u64,
    phase: Phase,
    kind: PhaseCommandKind,
) -> Option<(HardwareNodeStatus, PocStatus)> {
    if !should_be_operational(&nws.state.admin_state, epoch, phase) {
        return Some((HardwareNodeStatus::Stopped, PocStatus::Idle));
    }
    if nws.state.should_continue_inference() {
        return Some((HardwareNodeStatus::Inference, PocStatus::Idle));
    }
    match kind {
        PhaseCommandKind::StartPoc => Some((HardwareNodeStatus::Poc, PocStatus::Generating)),
        PhaseCommandKind::InitValidate => Some((HardwareNodeStatus::Poc, PocStatus::Validating)),
        PhaseCommandKind::InferenceUpAll => {
            if nws.state.current_status == HardwareNodeStatus::Training {
                None
            } else {
                Some((HardwareNodeStatus::Inference, PocStatus::Idle))
            }
        }
    }
}

/// Preconditions under which each phase command is allowed to run (§4.5.3).
/// `InitValidate`'s tolerance for `PocGenerateWindDown` is deliberate and
/// over-wide, preserved from the source per the Open Questions note in §9.
pub fn phase_allows(kind: PhaseCommandKind, phase: Phase) -> bool {
    match kind {
        PhaseCommandKind::StartPoc => phase == Phase::PocGenerate,
        PhaseCommandKind::InitValidate => {
            matches!(phase, Phase::PocValidate | Phase::PocGenerateWindDown)
        }
        PhaseCommandKind::InferenceUpAll => {
            matches!(phase, Phase::Inference | Phase::PocValidateWindDown)
        }
    }
}
