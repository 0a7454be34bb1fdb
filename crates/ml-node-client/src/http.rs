//! Concrete REST implementation of [`MlNodeClient`], bound to a
//! version-prefixed base URL (§4.2, §4.5.9). Wire shapes are a minimal,
//! internal approximation of the external ML-node REST API named in §6 —
//! that API itself is out of scope (§1).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mlnet_primitives::{CancelHandle, HardwareNodeStatus, PocStatus, TrainingTask};

use crate::errors::{NodeClientError, NodeClientResult};
use crate::traits::{MlNodeClient, NodeClientFactory};
use crate::types::PocInitDto;

/// A client bound to one `http://host:port/v{version}` ML node.
#[derive(Clone, Debug)]
pub struct HttpMlNodeClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMlNodeClient {
    pub fn new(host: &str, port: u16, version: &str) -> Self {
        Self {
            base_url: format!("http://{host}:{port}/v{version}"),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Races `fut` against cancellation, the way every operation in this
    /// trait must (§5 "all RPC calls are cancellable").
    async fn race<T>(
        &self,
        cancel: &CancelHandle,
        fut: impl std::future::Future<Output = NodeClientResult<T>>,
    ) -> NodeClientResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NodeClientError::Cancelled),
            res = fut => res,
        }
    }
}

#[derive(Deserialize)]
struct NodeStateResponse {
    mode: String,
}

#[derive(Deserialize)]
struct PowStatusResponse {
    status: String,
}

fn parse_mode(mode: &str) -> NodeClientResult<HardwareNodeStatus> {
    match mode {
        "inference" => Ok(HardwareNodeStatus::Inference),
        "poc" => Ok(HardwareNodeStatus::Poc),
        "training" => Ok(HardwareNodeStatus::Training),
        "stopped" => Ok(HardwareNodeStatus::Stopped),
        "failed" => Ok(HardwareNodeStatus::Failed),
        "unknown" => Ok(HardwareNodeStatus::Unknown),
        other => Err(NodeClientError::UnexpectedResponse(format!(
            "unknown node mode {other}"
        ))),
    }
}

fn parse_poc_status(status: &str) -> NodeClientResult<PocStatus> {
    match status {
        "idle" => Ok(PocStatus::Idle),
        "generating" => Ok(PocStatus::Generating),
        "validating" => Ok(PocStatus::Validating),
        other => Err(NodeClientError::UnexpectedResponse(format!(
            "unknown poc status {other}"
        ))),
    }
}

#[async_trait]
impl MlNodeClient for HttpMlNodeClient {
    async fn node_state(&self, cancel: &CancelHandle) -> NodeClientResult<HardwareNodeStatus> {
        self.race(cancel, async {
            let resp: NodeStateResponse = self
                .http
                .get(self.url("/state"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            parse_mode(&resp.mode)
        })
        .await
    }

    async fn pow_status(&self, cancel: &CancelHandle) -> NodeClientResult<PocStatus> {
        self.race(cancel, async {
            let resp: PowStatusResponse = self
                .http
                .get(self.url("/poc/status"))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            parse_poc_status(&resp.status)
        })
        .await
    }

    async fn inference_health(&self, cancel: &CancelHandle) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .get(self.url("/inference/health"))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn stop(&self, cancel: &CancelHandle) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .post(self.url("/stop"))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn init_generate(&self, cancel: &CancelHandle, dto: &PocInitDto) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .post(self.url("/poc/generate"))
                .json(&poc_body(dto))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn init_validate(&self, cancel: &CancelHandle, dto: &PocInitDto) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .post(self.url("/poc/validate"))
                .json(&poc_body(dto))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn inference_up(
        &self,
        cancel: &CancelHandle,
        model: &str,
        args: &[String],
    ) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .post(self.url("/inference/up"))
                .json(&json!({ "model": model, "args": args }))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn start_training(
        &self,
        cancel: &CancelHandle,
        task: &TrainingTask,
        participant: &str,
    ) -> NodeClientResult<()> {
        self.race(cancel, async {
            self.http
                .post(self.url("/training/start"))
                .json(&TrainingBody {
                    task_id: &task.id,
                    participant,
                    master_addr: &task.master_addr,
                    ranks: &task.ranks,
                    world_size: task.world_size,
                })
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }
}

#[derive(Serialize)]
struct TrainingBody<'a> {
    task_id: &'a str,
    participant: &'a str,
    master_addr: &'a str,
    ranks: &'a std::collections::BTreeMap<String, u32>,
    world_size: u32,
}

fn poc_body(dto: &PocInitDto) -> serde_json::Value {
    json!({
        "block_height": dto.block_height,
        "block_hash": dto.block_hash,
        "pubkey": dto.pubkey,
        "callback_url": dto.callback_url,
        "total_nodes": dto.total_nodes,
    })
}

/// Builds [`HttpMlNodeClient`]s bound to a version-prefixed URL (§4.2).
#[derive(Clone, Debug, Default)]
pub struct HttpNodeClientFactory;

impl NodeClientFactory for HttpNodeClientFactory {
    fn build(&self, host: &str, port: u16, version: &str) -> Arc<dyn MlNodeClient> {
        Arc::new(HttpMlNodeClient::new(host, port, version))
    }
}
