//! Shared value types for the ML-node control-plane broker.
//!
//! Every type here is plain data: no channels, no locks, no RPC. The broker
//! and its collaborator crates build their state machines on top of these.

pub mod epoch;
pub mod node;
pub mod result;
pub mod status;

pub use epoch::{
    should_be_operational, BlockRef, EpochMlNodeInfo, EpochParams, EpochSnapshot, LatestEpoch,
    Phase, TimeslotKind,
};
pub use node::{HardwareSpec, Node, NodeSnapshot, NodeWithState, TrainingTask};
pub use result::NodeResult;
pub use status::{AdminState, CancelHandle, HardwareNodeStatus, NodeState, PocStatus, ReconcileInfo};
