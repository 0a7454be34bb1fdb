//! C4: one worker per local node. Owns a bounded command queue and its RPC
//! client; executes commands serially; reports results back to the broker
//! over a plain channel (§9 "cyclic graphs": the worker never reads broker
//! state, only ever enqueues a [`NodeResult`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mlnet_node_client::{MlNodeClient, NodeClientError, NodeClientFactory};
use mlnet_primitives::{CancelHandle, NodeResult};

use crate::command::NodeWorkerCommand;

const COMMAND_QUEUE_CAPACITY: usize = 10;
const CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle side of a worker: the only thing the broker touches directly.
/// Submitting is non-blocking; a full queue yields `false` (§4.3). Cheap to
/// clone (an `mpsc::Sender` plus two `Arc`s) so callers can hold their own
/// copy across an `.await` point instead of holding a work-group lock guard.
#[derive(Clone)]
pub struct NodeWorkerHandle {
    node_id: String,
    cmd_tx: mpsc::Sender<(NodeWorkerCommand, CancelHandle)>,
    client: Arc<RwLock<Arc<dyn MlNodeClient>>>,
    version_alive: Arc<parking_lot::Mutex<HashMap<String, VersionProbe>>>,
}

#[derive(Clone, Copy)]
struct VersionProbe {
    alive: bool,
}

impl NodeWorkerHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Non-blocking submit. `false` means the per-worker queue (capacity 10)
    /// is full or the worker has shut down; the reconciler treats that as
    /// "skip and try next tick" (§4.5.4 step 5).
    pub fn submit(&self, command: NodeWorkerCommand, cancel: CancelHandle) -> bool {
        self.cmd_tx.try_send((command, cancel)).is_ok()
    }

    /// Atomically swaps the RPC client to one bound to `new_version`, then
    /// best-effort stops the old client in the background with a 10s
    /// timeout (§4.3 `RefreshClientImmediate`).
    pub fn refresh_client_immediate(&self, factory: &dyn NodeClientFactory, host: &str, port: u16, new_version: &str) {
        let new_client = factory.build(host, port, new_version);
        let old_client = {
            let mut guard = self.client.write();
            std::mem::replace(&mut *guard, new_client)
        };
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            let cancel = CancelHandle::new();
            let res = tokio::time::timeout(CLIENT_STOP_TIMEOUT, old_client.stop(&cancel)).await;
            match res {
                Ok(Ok(())) => debug!(%node_id, "stopped previous-version client"),
                Ok(Err(err)) => warn!(%node_id, %err, "failed to stop previous-version client"),
                Err(_) => warn!(%node_id, "timed out stopping previous-version client"),
            }
        });
    }

    /// Builds a probe client against `version` and calls `NodeState`,
    /// caching the (positive or negative) outcome; positives short-circuit
    /// on the next call, negatives are retried (§4.3).
    pub async fn check_client_version_alive(
        &self,
        factory: &dyn NodeClientFactory,
        host: &str,
        port: u16,
        version: &str,
    ) -> bool {
        if let Some(probe) = self.version_alive.lock().get(version).copied() {
            if probe.alive {
                return true;
            }
        }
        let alive = self.probe_version(factory, host, port, version).await.is_ok();
        self.version_alive
            .lock()
            .insert(version.to_string(), VersionProbe { alive });
        alive
    }

    /// Builds a probe client against `version` and calls `NodeState`,
    /// surfacing the raw error so callers (`CheckVersionHealth`, §6) can
    /// report why a node is unreachable rather than just a bool.
    pub async fn probe_version(
        &self,
        factory: &dyn NodeClientFactory,
        host: &str,
        port: u16,
        version: &str,
    ) -> Result<(), NodeClientError> {
        let probe_client = factory.build(host, port, version);
        let cancel = CancelHandle::new();
        probe_client.node_state(&cancel).await.map(|_| ())
    }
}

/// Owns the receiving half; runs to completion inside a spawned task.
pub struct NodeWorker {
    node_id: String,
    client: Arc<RwLock<Arc<dyn MlNodeClient>>>,
    cmd_rx: mpsc::Receiver<(NodeWorkerCommand, CancelHandle)>,
    results_tx: mpsc::Sender<NodeResult>,
}

/// Spawns a worker task and returns its handle plus a join handle the
/// work group awaits during shutdown (§4.4 `RemoveWorker`).
pub fn spawn(
    node_id: String,
    initial_client: Arc<dyn MlNodeClient>,
    results_tx: mpsc::Sender<NodeResult>,
) -> (NodeWorkerHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let client = Arc::new(RwLock::new(initial_client));
    let worker = NodeWorker {
        node_id: node_id.clone(),
        client: client.clone(),
        cmd_rx,
        results_tx,
    };
    let join = tokio::spawn(worker.run());
    let handle = NodeWorkerHandle {
        node_id,
        cmd_tx,
        client,
        version_alive: Arc::new(parking_lot::Mutex::new(HashMap::new())),
    };
    (handle, join)
}

impl NodeWorker {
    /// Dequeues and executes commands to completion or cancellation,
    /// reporting every outcome. Returns once `cmd_rx` is closed and
    /// drained — the work group drops its sender and joins, which drains
    /// whatever was still queued before returning (§4.3 shutdown).
    async fn run(mut self) {
        while let Some((cmd, cancel)) = self.cmd_rx.recv().await {
            let result = self.execute(cmd, &cancel).await;
            if self.results_tx.send(result).await.is_err() {
                warn!(node_id = %self.node_id, "broker result channel closed, worker exiting");
                break;
            }
        }
        info!(node_id = %self.node_id, "node worker exiting");
    }

    async fn execute(&self, cmd: NodeWorkerCommand, cancel: &CancelHandle) -> NodeResult {
        let (original_target, original_poc_target) = cmd.target();
        let client = self.client.read().clone();

        let outcome = match &cmd {
            NodeWorkerCommand::StopNode => self.run_stop(&*client, cancel).await,
            NodeWorkerCommand::StartPoc(dto) => self.run_init_generate(&*client, cancel, dto).await,
            NodeWorkerCommand::InitValidateNode(dto) => {
                self.run_init_validate(&*client, cancel, dto).await
            }
            NodeWorkerCommand::InferenceUpNode { model, args } => {
                self.run_inference_up(&*client, cancel, model, args).await
            }
            NodeWorkerCommand::StartTrainingNode { task, participant } => {
                self.run_start_training(&*client, cancel, task, participant)
                    .await
            }
            NodeWorkerCommand::NoOp => Ok(original_target),
        };

        match outcome {
            Ok(final_status) => NodeResult {
                node_id: self.node_id.clone(),
                succeeded: true,
                final_status,
                original_target,
                final_poc_status: original_poc_target,
                original_poc_target,
                error_message: None,
            },
            Err(err) => {
                let cancelled = matches!(err, mlnet_node_client::NodeClientError::Cancelled);
                NodeResult {
                    node_id: self.node_id.clone(),
                    succeeded: false,
                    // cancellation leaves current_status untouched (§5); we
                    // report the pre-command status as a neutral "no change"
                    // signal and let the apply path's staleness check do
                    // the real work.
                    final_status: if cancelled {
                        mlnet_primitives::HardwareNodeStatus::Unknown
                    } else {
                        mlnet_primitives::HardwareNodeStatus::Failed
                    },
                    original_target,
                    final_poc_status: original_poc_target,
                    original_poc_target,
                    error_message: Some(err.to_string()),
                }
            }
        }
    }

    async fn run_stop(
        &self,
        client: &dyn MlNodeClient,
        cancel: &CancelHandle,
    ) -> Result<mlnet_primitives::HardwareNodeStatus, mlnet_node_client::NodeClientError> {
        if client.node_state(cancel).await? == mlnet_primitives::HardwareNodeStatus::Stopped {
            return Ok(mlnet_primitives::HardwareNodeStatus::Stopped);
        }
        client.stop(cancel).await?;
        Ok(mlnet_primitives::HardwareNodeStatus::Stopped)
    }

    async fn run_init_generate(
        &self,
        client: &dyn MlNodeClient,
        cancel: &CancelHandle,
        dto: &mlnet_node_client::PocInitDto,
    ) -> Result<mlnet_primitives::HardwareNodeStatus, mlnet_node_client::NodeClientError> {
        if client.node_state(cancel).await? == mlnet_primitives::HardwareNodeStatus::Poc
            && client.pow_status(cancel).await? == mlnet_primitives::PocStatus::Generating
        {
            return Ok(mlnet_primitives::HardwareNodeStatus::Poc);
        }
        client.init_generate(cancel, dto).await?;
        Ok(mlnet_primitives::HardwareNodeStatus::Poc)
    }

    async fn run_init_validate(
        &self,
        client: &dyn MlNodeClient,
        cancel: &CancelHandle,
        dto: &mlnet_node_client::PocInitDto,
    ) -> Result<mlnet_primitives::HardwareNodeStatus, mlnet_node_client::NodeClientError> {
        if client.node_state(cancel).await? == mlnet_primitives::HardwareNodeStatus::Poc
            && client.pow_status(cancel).await? == mlnet_primitives::PocStatus::Validating
        {
            return Ok(mlnet_primitives::HardwareNodeStatus::Poc);
        }
        client.init_validate(cancel, dto).await?;
        Ok(mlnet_primitives::HardwareNodeStatus::Poc)
    }

    async fn run_inference_up(
        &self,
        client: &dyn MlNodeClient,
        cancel: &CancelHandle,
        model: &str,
        args: &[String],
    ) -> Result<mlnet_primitives::HardwareNodeStatus, mlnet_node_client::NodeClientError> {
        if client.node_state(cancel).await? == mlnet_primitives::HardwareNodeStatus::Inference {
            return Ok(mlnet_primitives::HardwareNodeStatus::Inference);
        }
        client.inference_up(cancel, model, args).await?;
        Ok(mlnet_primitives::HardwareNodeStatus::Inference)
    }

    async fn run_start_training(
        &self,
        client: &dyn MlNodeClient,
        cancel: &CancelHandle,
        task: &mlnet_primitives::TrainingTask,
        participant: &str,
    ) -> Result<mlnet_primitives::HardwareNodeStatus, mlnet_node_client::NodeClientError> {
        if client.node_state(cancel).await? == mlnet_primitives::HardwareNodeStatus::Training {
            return Ok(mlnet_primitives::HardwareNodeStatus::Training);
        }
        client.start_training(cancel, task, participant).await?;
        Ok(mlnet_primitives::HardwareNodeStatus::Training)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mlnet_node_client::{NodeClientError, NodeClientResult, PocInitDto};
    use mlnet_primitives::{HardwareNodeStatus, PocStatus, TrainingTask};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockClient {
        state: HardwareNodeStatus,
        pow: PocStatus,
        stop_calls: AtomicU32,
        inference_up_calls: AtomicU32,
        fail_next: bool,
    }

    impl MockClient {
        fn stopped() -> Self {
            Self {
                state: HardwareNodeStatus::Stopped,
                pow: PocStatus::Idle,
                stop_calls: AtomicU32::new(0),
                inference_up_calls: AtomicU32::new(0),
                fail_next: false,
            }
        }

        fn with_state(state: HardwareNodeStatus, fail_next: bool) -> Self {
            Self {
                state,
                pow: PocStatus::Idle,
                stop_calls: AtomicU32::new(0),
                inference_up_calls: AtomicU32::new(0),
                fail_next,
            }
        }
    }

    #[async_trait]
    impl MlNodeClient for MockClient {
        async fn node_state(&self, _cancel: &CancelHandle) -> NodeClientResult<HardwareNodeStatus> {
            Ok(self.state)
        }
        async fn pow_status(&self, _cancel: &CancelHandle) -> NodeClientResult<PocStatus> {
            Ok(self.pow)
        }
        async fn inference_health(&self, _cancel: &CancelHandle) -> NodeClientResult<()> {
            Ok(())
        }
        async fn stop(&self, _cancel: &CancelHandle) -> NodeClientResult<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn init_generate(&self, _cancel: &CancelHandle, _dto: &PocInitDto) -> NodeClientResult<()> {
            Ok(())
        }
        async fn init_validate(&self, _cancel: &CancelHandle, _dto: &PocInitDto) -> NodeClientResult<()> {
            Ok(())
        }
        async fn inference_up(
            &self,
            _cancel: &CancelHandle,
            _model: &str,
            _args: &[String],
        ) -> NodeClientResult<()> {
            self.inference_up_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next {
                return Err(NodeClientError::Precondition("boom".into()));
            }
            Ok(())
        }
        async fn start_training(
            &self,
            _cancel: &CancelHandle,
            _task: &TrainingTask,
            _participant: &str,
        ) -> NodeClientResult<()> {
            Ok(())
        }
    }

    fn spawn_worker(client: MockClient) -> (NodeWorkerHandle, mpsc::Receiver<NodeResult>) {
        let (results_tx, results_rx) = mpsc::channel(10);
        let (handle, _join) = spawn("n1".to_string(), Arc::new(client), results_tx);
        (handle, results_rx)
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_already_stopped() {
        let (handle, mut results_rx) = spawn_worker(MockClient::stopped());
        assert!(handle.submit(NodeWorkerCommand::StopNode, CancelHandle::new()));
        let result = results_rx.recv().await.unwrap();
        assert!(result.succeeded);
        assert_eq!(result.final_status, HardwareNodeStatus::Stopped);
    }

    #[tokio::test]
    async fn inference_up_reports_failure_without_crashing_worker() {
        let client = MockClient::with_state(HardwareNodeStatus::Stopped, true);
        let (handle, mut results_rx) = spawn_worker(client);
        assert!(handle.submit(
            NodeWorkerCommand::InferenceUpNode {
                model: "m1".into(),
                args: vec![],
            },
            CancelHandle::new(),
        ));
        let result = results_rx.recv().await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.final_status, HardwareNodeStatus::Failed);
        assert_eq!(result.original_target, HardwareNodeStatus::Inference);

        // worker keeps serving after a failed command
        assert!(handle.submit(NodeWorkerCommand::StopNode, CancelHandle::new()));
        let second = results_rx.recv().await.unwrap();
        assert!(second.succeeded);
    }

    #[tokio::test]
    async fn queue_full_submit_returns_false() {
        let (handle, mut results_rx) = spawn_worker(MockClient::stopped());
        let mut accepted = 0;
        for _ in 0..50 {
            if handle.submit(NodeWorkerCommand::StopNode, CancelHandle::new()) {
                accepted += 1;
            }
        }
        assert!(accepted < 50, "queue of capacity 10 should reject some bursts");
        for _ in 0..accepted {
            results_rx.recv().await.unwrap();
        }
    }
}
