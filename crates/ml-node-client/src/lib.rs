//! C1: the abstract ML-node RPC client (§4.2) plus a concrete REST
//! implementation grounded on the teacher's `BitcoinClient`-style
//! `reqwest::Client` wrapper (`btcio/src/rpc/rpc.rs`): one thin struct
//! holding a base URL and a shared `reqwest::Client`, one `call` helper used
//! by every typed operation.

pub mod errors;
pub mod http;
pub mod traits;
pub mod types;

pub use errors::{NodeClientError, NodeClientResult};
pub use http::{HttpMlNodeClient, HttpNodeClientFactory};
pub use traits::{MlNodeClient, NodeClientFactory};
pub use types::PocInitDto;
