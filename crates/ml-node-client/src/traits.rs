//! C1: abstract ML-node RPC client (§4.2 operation table) plus the factory
//! that binds a client to a version-prefixed URL (§4.2, §4.5.9).

use async_trait::async_trait;

use mlnet_primitives::{CancelHandle, HardwareNodeStatus, PocStatus, TrainingTask};

use crate::errors::NodeClientResult;
use crate::types::PocInitDto;

/// One ML node's typed operation set. Every operation takes a cancellation
/// handle; implementations race their I/O against `cancel.cancelled()`.
#[async_trait]
pub trait MlNodeClient: Send + Sync {
    /// Observe the node's current mode. No side effect.
    async fn node_state(&self, cancel: &CancelHandle) -> NodeClientResult<HardwareNodeStatus>;

    /// Observe the node's PoC sub-state. No side effect.
    async fn pow_status(&self, cancel: &CancelHandle) -> NodeClientResult<PocStatus>;

    /// Liveness probe used after a node reports `Inference` (§4.5.6).
    async fn inference_health(&self, cancel: &CancelHandle) -> NodeClientResult<()>;

    /// Tear down whatever is running; transitions to `Stopped`.
    async fn stop(&self, cancel: &CancelHandle) -> NodeClientResult<()>;

    /// Begin PoC generation. Precondition: node `Stopped`.
    async fn init_generate(&self, cancel: &CancelHandle, dto: &PocInitDto) -> NodeClientResult<()>;

    /// Begin PoC validation. Precondition: node `Stopped` or already in PoC.
    async fn init_validate(&self, cancel: &CancelHandle, dto: &PocInitDto) -> NodeClientResult<()>;

    /// Load `model` with `args` and begin serving. Precondition: `Stopped`.
    async fn inference_up(
        &self,
        cancel: &CancelHandle,
        model: &str,
        args: &[String],
    ) -> NodeClientResult<()>;

    /// Begin a training job for this node's assigned rank.
    async fn start_training(
        &self,
        cancel: &CancelHandle,
        task: &TrainingTask,
        participant: &str,
    ) -> NodeClientResult<()>;
}

/// Produces a client bound to a versioned URL (§4.2). Version changes cause
/// the broker to rebuild every client atomically (§4.5.9).
pub trait NodeClientFactory: Send + Sync {
    fn build(&self, host: &str, port: u16, version: &str) -> std::sync::Arc<dyn MlNodeClient>;
}
