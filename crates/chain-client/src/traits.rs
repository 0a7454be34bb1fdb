//! §6 "To the chain (consumed contracts, verbatim semantics)". The chain
//! client implementation itself (governance queries, block dispatcher,
//! identity/key management) is out of scope (§1) — only this contract is
//! named, the way `mlnet-node-client`'s trait names the ML-node surface.

use async_trait::async_trait;

use crate::errors::ChainClientResult;
use crate::types::{EpochGroupData, HardwareNode, Model};

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_hardware_nodes(&self, participant: &str) -> ChainClientResult<Vec<HardwareNode>>;

    async fn submit_hardware_diff(
        &self,
        creator: &str,
        new_or_modified: Vec<HardwareNode>,
        removed: Vec<HardwareNode>,
    ) -> ChainClientResult<()>;

    async fn get_block_hash(&self, height: u64) -> ChainClientResult<String>;

    async fn get_governance_models(&self) -> ChainClientResult<Vec<Model>>;

    async fn get_current_epoch_group_data(&self) -> ChainClientResult<EpochGroupData>;

    async fn get_epoch_group_data_by_model_id(
        &self,
        epoch_index: u64,
        model_id: &str,
    ) -> ChainClientResult<EpochGroupData>;
}
