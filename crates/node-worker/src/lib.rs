//! C3 (node-worker commands) + C4 (node worker): the per-node actor that
//! serializes RPC dispatch against one ML node and reports results back to
//! the broker over a plain channel, grounded on the teacher's
//! consensus-worker task shape (`consensus-logic/src/csm/worker.rs`): an
//! owned receiver, a blocking `recv` loop, one `match` per message kind.

pub mod command;
pub mod worker;

pub use command::NodeWorkerCommand;
pub use worker::{spawn, NodeWorker, NodeWorkerHandle};
