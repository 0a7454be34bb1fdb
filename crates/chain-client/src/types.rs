//! §6 consumed-contract value types: the chain's view of our hardware
//! inventory and of epoch/subgroup governance data.

use std::collections::BTreeMap;

use mlnet_primitives::{EpochMlNodeInfo, HardwareNodeStatus, HardwareSpec};

/// The chain's record of one of our local ML nodes (§4.5.7, §4.7).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareNode {
    pub id: String,
    pub status: HardwareNodeStatus,
    pub hardware: Vec<HardwareSpec>,
    pub models: Vec<String>,
}

impl HardwareNode {
    /// Normal form used by the hardware-equality relation (§4.7): models and
    /// hardware tuples sorted so that set-semantics comparisons are a plain
    /// `==` on the sorted vectors.
    pub fn normalized(&self) -> Self {
        let mut hardware = self.hardware.clone();
        hardware.sort();
        let mut models = self.models.clone();
        models.sort();
        Self {
            id: self.id.clone(),
            status: self.status,
            hardware,
            models,
        }
    }
}

/// A governance-declared inference model (`GetGovernanceModels`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
}

/// One chain-assigned ML node entry inside a subgroup (§4.5.8).
#[derive(Clone, Debug)]
pub struct MlNodeInfo {
    pub node_id: String,
    pub participant_address: String,
    /// The subset of the model's launch args assigned to this node for the
    /// current epoch (`epoch_models`).
    pub model_args: Vec<String>,
    /// `epoch_ml_nodes` descriptor: timeslot allocation + PoC weights.
    pub descriptor: EpochMlNodeInfo,
}

/// A model's subgroup: the chain-assigned nodes and weights for one model.
#[derive(Clone, Debug, Default)]
pub struct SubgroupData {
    pub model_id: String,
    pub ml_nodes: Vec<MlNodeInfo>,
}

/// Epoch group data returned by `GetCurrentEpochGroupData` /
/// `GetEpochGroupDataByModelId` (§4.5.8).
#[derive(Clone, Debug, Default)]
pub struct EpochGroupData {
    pub epoch_index: u64,
    pub model_ids: Vec<String>,
    pub subgroups: BTreeMap<String, SubgroupData>,
}
