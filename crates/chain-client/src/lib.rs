//! §6 chain contracts consumed by the broker: hardware inventory sync,
//! block hashes for PoC parameters, and epoch/subgroup governance data. The
//! concrete chain client (block dispatcher, governance queries, identity)
//! lives outside this crate's scope (§1); this is the trait-only shape, the
//! way the teacher's `rpc/api` crate names RPC surfaces without owning their
//! transport.

pub mod errors;
pub mod traits;
pub mod types;

pub use errors::{ChainClientError, ChainClientResult};
pub use traits::ChainClient;
pub use types::{EpochGroupData, HardwareNode, MlNodeInfo, Model, SubgroupData};
