//! Process entry point: loads `BrokerConfig`, wires a [`BrokerHandle`]
//! against the configured local nodes, and keeps the process alive. The
//! block-feed loop that drives [`mlnet_phase_tracker::PhaseTracker`] and the
//! concrete [`mlnet_chain_client::ChainClient`] (governance queries, block
//! dispatcher, identity/key management) are out of scope (§1); this binary
//! wires a stub chain client so the broker is runnable standalone, the way
//! the teacher's `bin/strata-client` wires a concrete `L1Client` behind the
//! same trait its consensus core consumes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use async_trait::async_trait;

use mlnet_broker::{BrokerArgs, BrokerHandle, Intervals, NodeRegistration, StaticVersionProvider};
use mlnet_chain_client::{ChainClient, ChainClientError, ChainClientResult, EpochGroupData, HardwareNode, Model};
use mlnet_common::logging::{self, LoggerConfig};
use mlnet_config::BrokerConfig;
use mlnet_node_client::HttpNodeClientFactory;
use mlnet_phase_tracker::PhaseTracker;

#[derive(FromArgs)]
/// ML-node control-plane broker: fleet-manages local GPU nodes between
/// inference, proof-of-compute, and training modes.
struct Args {
    /// path to the broker's TOML config file
    #[argh(option)]
    config: PathBuf,
}

/// A chain client that always reports itself unavailable. The real
/// implementation (out of scope here) talks to the participant's chain
/// dispatcher; this keeps the broker's sync/epoch loops harmless no-ops
/// until a concrete client is wired in.
struct UnavailableChainClient;

#[async_trait]
impl ChainClient for UnavailableChainClient {
    async fn get_hardware_nodes(&self, _participant: &str) -> ChainClientResult<Vec<HardwareNode>> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }

    async fn submit_hardware_diff(
        &self,
        _creator: &str,
        _new_or_modified: Vec<HardwareNode>,
        _removed: Vec<HardwareNode>,
    ) -> ChainClientResult<()> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }

    async fn get_block_hash(&self, _height: u64) -> ChainClientResult<String> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }

    async fn get_governance_models(&self) -> ChainClientResult<Vec<Model>> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }

    async fn get_current_epoch_group_data(&self) -> ChainClientResult<EpochGroupData> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }

    async fn get_epoch_group_data_by_model_id(
        &self,
        _epoch_index: u64,
        _model_id: &str,
    ) -> ChainClientResult<EpochGroupData> {
        Err(ChainClientError::Unavailable("no chain client configured".into()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    logging::init(LoggerConfig::new("broker-node"));

    let config = BrokerConfig::from_file(&args.config)?;
    tracing::info!(participant = %config.participant, nodes = config.nodes.len(), "loaded broker config");

    let initial_version = "1".to_string();
    let handle = BrokerHandle::spawn(BrokerArgs {
        participant: config.participant.clone(),
        poc_pubkey: config.participant.clone(),
        poc_callback_url: String::new(),
        chain_client: Arc::new(UnavailableChainClient),
        client_factory: Arc::new(HttpNodeClientFactory),
        version_provider: Arc::new(StaticVersionProvider(initial_version)),
        phase_tracker: Arc::new(PhaseTracker::new()),
        intervals: Intervals {
            reconcile: Duration::from_secs(config.intervals.reconcile_secs),
            sync: Duration::from_secs(config.intervals.sync_secs),
            status_probe: Duration::from_secs(config.intervals.status_probe_secs),
        },
    });

    for node in config.nodes {
        let reg = NodeRegistration {
            id: node.id.clone(),
            host: node.host,
            inference_host: node.inference_host,
            inference_port: node.inference_port,
            poc_host: node.poc_host,
            poc_port: node.poc_port,
            max_concurrent: node.max_concurrent,
            hardware: node.hardware,
            models: node.models,
        };
        match handle.load_node_to_broker(reg).await {
            Ok(()) => tracing::info!(node_id = %node.id, "registered node from config"),
            Err(err) => tracing::error!(node_id = %node.id, %err, "failed to register node"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
