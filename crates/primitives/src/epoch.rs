//! §4.1 phase/epoch model and the admin-gating predicate (P8).

use serde::{Deserialize, Serialize};

use crate::status::AdminState;

/// Sub-interval of an epoch (GLOSSARY: Phase).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    Inference,
    PocGenerate,
    PocGenerateWindDown,
    PocValidate,
    PocValidateWindDown,
    Other,
}

/// Window lengths (in blocks) that make up one epoch's PoC cycle, counted
/// from `LatestEpoch::poc_start_block_height`. Everything after the four
/// windows, up to the next epoch's PoC start, is `Phase::Inference`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EpochParams {
    pub generate_window: u64,
    pub generate_wind_down: u64,
    pub validate_window: u64,
    pub validate_wind_down: u64,
}

/// The chain's most recently observed epoch header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LatestEpoch {
    pub index: u64,
    pub poc_start_block_height: u64,
}

/// A block as reported by the chain dispatcher.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    pub hash: String,
}

/// Consistent, owned snapshot returned by `PhaseTracker::current()` (C2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochSnapshot {
    pub block: BlockRef,
    pub latest_epoch: Option<LatestEpoch>,
    pub epoch_params: EpochParams,
    pub is_synced: bool,
}

impl EpochSnapshot {
    /// Gates all phase-sensitive decisions (§4.1).
    pub fn is_nil_or_not_synced(&self) -> bool {
        !self.is_synced || self.latest_epoch.is_none()
    }

    /// Derives the current phase from `latest_epoch.poc_start_block_height`,
    /// `block.height`, and `epoch_params`. Returns `Phase::Other` if there is
    /// no epoch data yet; callers must check `is_nil_or_not_synced` first.
    pub fn phase(&self) -> Phase {
        let Some(epoch) = &self.latest_epoch else {
            return Phase::Other;
        };
        if self.block.height < epoch.poc_start_block_height {
            return Phase::Inference;
        }
        let offset = self.block.height - epoch.poc_start_block_height;
        let p = &self.epoch_params;
        let generate_end = p.generate_window;
        let generate_wd_end = generate_end + p.generate_wind_down;
        let validate_end = generate_wd_end + p.validate_window;
        let validate_wd_end = validate_end + p.validate_wind_down;

        if offset < generate_end {
            Phase::PocGenerate
        } else if offset < generate_wd_end {
            Phase::PocGenerateWindDown
        } else if offset < validate_end {
            Phase::PocValidate
        } else if offset < validate_wd_end {
            Phase::PocValidateWindDown
        } else {
            Phase::Inference
        }
    }

    pub fn epoch_index(&self) -> Option<u64> {
        self.latest_epoch.as_ref().map(|e| e.index)
    }
}

/// One slot of a node's PoC timeslot allocation for a model (GLOSSARY:
/// POC_SLOT).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TimeslotKind {
    InferenceSlot,
    PocSlot,
}

/// Chain-side descriptor of one node's role for one model in the current
/// epoch (§3 `epoch_ml_nodes`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EpochMlNodeInfo {
    pub timeslot_allocation: Vec<TimeslotKind>,
    pub poc_weights: Vec<u64>,
}

impl EpochMlNodeInfo {
    pub fn has_poc_slot(&self) -> bool {
        self.timeslot_allocation
            .iter()
            .any(|slot| matches!(slot, TimeslotKind::PocSlot))
    }
}

/// P8: `should_be_operational({enabled,epoch}, E, phase) =
/// enabled ∧ (E>epoch ∨ (E=epoch ∧ phase=Inference)) ∨ ¬enabled ∧ E≤epoch`.
pub fn should_be_operational(admin: &AdminState, epoch: u64, phase: Phase) -> bool {
    if admin.enabled {
        epoch > admin.epoch || (epoch == admin.epoch && phase == Phase::Inference)
    } else {
        epoch <= admin.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(height: u64) -> EpochSnapshot {
        EpochSnapshot {
            block: BlockRef {
                height,
                hash: "h".into(),
            },
            latest_epoch: Some(LatestEpoch {
                index: 5,
                poc_start_block_height: 100,
            }),
            epoch_params: EpochParams {
                generate_window: 10,
                generate_wind_down: 2,
                validate_window: 10,
                validate_wind_down: 2,
            },
            is_synced: true,
        }
    }

    #[test]
    fn phase_before_poc_start_is_inference() {
        assert_eq!(snapshot(50).phase(), Phase::Inference);
    }

    #[test]
    fn phase_windows_in_order() {
        assert_eq!(snapshot(105).phase(), Phase::PocGenerate);
        assert_eq!(snapshot(111).phase(), Phase::PocGenerateWindDown);
        assert_eq!(snapshot(115).phase(), Phase::PocValidate);
        assert_eq!(snapshot(123).phase(), Phase::PocValidateWindDown);
        assert_eq!(snapshot(126).phase(), Phase::Inference);
    }

    #[test]
    fn admin_gating_matches_p8() {
        let enabled = AdminState {
            enabled: true,
            epoch: 10,
        };
        assert!(should_be_operational(&enabled, 10, Phase::Inference));
        assert!(!should_be_operational(&enabled, 10, Phase::PocGenerate));
        assert!(should_be_operational(&enabled, 11, Phase::PocGenerate));

        let disabled = AdminState {
            enabled: false,
            epoch: 10,
        };
        assert!(should_be_operational(&disabled, 10, Phase::Inference));
        assert!(!should_be_operational(&disabled, 11, Phase::Inference));
    }
}
