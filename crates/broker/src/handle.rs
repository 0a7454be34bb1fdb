//! Public façade over the broker's dispatcher: every external caller (the
//! RPC surface and `bin/broker-node`'s block-feed loop) goes through
//! `BrokerHandle`, never touches `BrokerShared` directly. Grounded on the
//! teacher's `CsmController`/worker-handle split: a cheap, cloneable handle
//! wrapping channel senders into a task the handle itself spawned.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use mlnet_chain_client::ChainClient;
use mlnet_node_client::NodeClientFactory;
use mlnet_phase_tracker::PhaseTracker;
use mlnet_primitives::{AdminState, HardwareSpec, Node, NodeSnapshot, TrainingTask};

use crate::command::{Command, NodeRegistration, Priority, StatusUpdate};
use crate::core::{self, BrokerShared, Intervals, VersionHealth};
use crate::errors::{BrokerError, BrokerResult};
use crate::version::VersionProvider;
use crate::work_group::WorkGroup;

const HIGH_CAPACITY: usize = 100;
const LOW_CAPACITY: usize = 10_000;
const RESULTS_CAPACITY: usize = 1_000;

/// Construction parameters for [`BrokerHandle::spawn`].
pub struct BrokerArgs {
    pub participant: String,
    pub poc_pubkey: String,
    pub poc_callback_url: String,
    pub chain_client: Arc<dyn ChainClient>,
    pub client_factory: Arc<dyn NodeClientFactory>,
    pub version_provider: Arc<dyn VersionProvider>,
    pub phase_tracker: Arc<PhaseTracker>,
    pub intervals: Intervals,
}

/// Cheap to clone: holds only the two command-queue senders and a shared
/// pointer into the broker's state. Every method sends a `Command` and
/// awaits its `reply` oneshot.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<BrokerShared>,
    high_tx: mpsc::Sender<Command>,
    low_tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Wires the two priority queues (§4.5.1), the node-result forwarding
    /// task, and the three background loops (reconcile, sync, status
    /// probe), then returns a handle to the running broker.
    pub fn spawn(args: BrokerArgs) -> Self {
        let (high_tx, high_rx) = mpsc::channel(HIGH_CAPACITY);
        let (low_tx, low_rx) = mpsc::channel(LOW_CAPACITY);
        let (results_tx, mut results_rx) = mpsc::channel(RESULTS_CAPACITY);
        let (reconcile_trigger_tx, reconcile_trigger_rx) = mpsc::channel(1);
        let (status_trigger_tx, status_trigger_rx) = mpsc::channel(1);

        let shared = Arc::new(BrokerShared {
            participant: args.participant,
            poc_pubkey: args.poc_pubkey,
            poc_callback_url: args.poc_callback_url,
            nodes: RwLock::new(HashMap::new()),
            work_group: RwLock::new(WorkGroup::new()),
            phase_tracker: args.phase_tracker,
            chain_client: args.chain_client,
            client_factory: args.client_factory,
            version_provider: args.version_provider,
            results_tx,
            high_tx: high_tx.clone(),
            reconcile_trigger_tx,
            status_trigger_tx,
            cur_max_node_num: AtomicU64::new(0),
            last_epoch: Mutex::new(None),
            last_used_version: Mutex::new(String::new()),
            known_models: RwLock::new(HashSet::new()),
            intervals: args.intervals,
        });

        tokio::spawn(core::dispatch_loop(shared.clone(), high_rx, low_rx));
        tokio::spawn(core::reconcile_loop(shared.clone(), reconcile_trigger_rx));
        tokio::spawn(core::sync_loop(shared.clone()));
        tokio::spawn(core::status_probe_loop(shared.clone(), status_trigger_rx));

        // §9 "cyclic graphs": the worker reports into a plain channel; this
        // task is what actually folds the result back into broker state, by
        // re-enqueuing it as a high-priority command.
        let forward_tx = high_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                let (tx, _rx) = oneshot::channel();
                if forward_tx
                    .send(Command::UpdateNodeResult { result, reply: tx })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            shared,
            high_tx,
            low_tx,
        }
    }

    async fn dispatch(&self, cmd: Command) -> BrokerResult<()> {
        let tx = match cmd.priority() {
            Priority::High => &self.high_tx,
            Priority::Low => &self.low_tx,
        };
        tx.send(cmd).await.map_err(|_| BrokerError::Closed)
    }

    pub async fn load_node_to_broker(&self, reg: NodeRegistration) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::RegisterNode { reg, reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn update_node(&self, reg: NodeRegistration) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::UpdateNode { reg, reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn remove_node(&self, node_id: impl Into<String>) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::RemoveNode {
            node_id: node_id.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn update_node_hardware(
        &self,
        node_id: impl Into<String>,
        hardware: Vec<HardwareSpec>,
    ) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::UpdateNodeHardware {
            node_id: node_id.into(),
            hardware,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn get_nodes(&self) -> BrokerResult<Vec<NodeSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::GetNodes { reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn get_node_by_node_num(&self, node_num: u64) -> BrokerResult<Option<Node>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::GetNodeByNodeNum { node_num, reply: tx })
            .await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn lock_available_node(&self, model: impl Into<String>) -> BrokerResult<Option<Node>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::LockAvailableNode {
            model: model.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn release_node(&self, node_id: impl Into<String>, succeeded: bool) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::ReleaseNode {
            node_id: node_id.into(),
            succeeded,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// §9 lock-then-act-then-release combinator: locks a node for `model`,
    /// runs `action` against its (copied) `Node`, and always releases the
    /// lock afterward, reporting `action`'s success back as the release
    /// outcome. Returns `Ok(None)` if no node was available.
    pub async fn lock_node<F, Fut, T, E>(
        &self,
        model: impl Into<String>,
        action: F,
    ) -> BrokerResult<Option<Result<T, E>>>
    where
        F: FnOnce(Node) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(node) = self.lock_available_node(model).await? else {
            return Ok(None);
        };
        let node_id = node.id.clone();
        let outcome = action(node).await;
        self.release_node(node_id, outcome.is_ok()).await?;
        Ok(Some(outcome))
    }

    pub async fn set_node_admin_state(
        &self,
        node_id: impl Into<String>,
        admin_state: AdminState,
    ) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::SetNodeAdminState {
            node_id: node_id.into(),
            admin_state,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn set_nodes_actual_status(&self, updates: Vec<StatusUpdate>) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::SetNodesActualStatus { updates, reply: tx })
            .await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn start_poc(&self) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::StartPoc { reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn init_validate(&self) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::InitValidate { reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn inference_up_all(&self) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::InferenceUpAll { reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    pub async fn lock_nodes_for_training(&self, node_ids: Vec<String>) -> BrokerResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::LockNodesForTraining { node_ids, reply: tx })
            .await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn start_training(&self, task: TrainingTask, participant: String) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::StartTraining {
            task,
            participant,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    pub async fn sync_nodes(&self) -> BrokerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::SyncNodes { reply: tx }).await?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Wakes the reconciler immediately instead of waiting for its next
    /// tick (§4.5.3: every phase command triggers this).
    pub fn trigger_reconciliation(&self) {
        let _ = self.shared.reconcile_trigger_tx.try_send(());
    }

    pub fn trigger_status_query(&self) {
        let _ = self.shared.status_trigger_tx.try_send(());
    }

    /// Exposed so tests and the version-driven CLI hook can force a client
    /// refresh check without waiting for a reconcile tick (§4.5.9).
    pub async fn check_and_refresh_clients_if_needed(&self) {
        core::check_and_refresh_clients_if_needed(&self.shared).await;
    }

    /// §6 `CheckVersionHealth`: probes every node against `version` and
    /// reports per-node liveness/error, independent of the reconcile tick.
    pub async fn check_version_health(&self, version: &str) -> HashMap<String, VersionHealth> {
        core::check_version_health(&self.shared, version).await
    }

    /// Exposed so the chain block-feed loop can force an epoch-data refresh
    /// right after observing a new epoch (§4.5.8).
    pub async fn update_node_with_epoch_data(&self) {
        core::update_node_with_epoch_data(&self.shared).await;
    }
}
