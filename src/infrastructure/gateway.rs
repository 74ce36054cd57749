//! Execution backend speaking JSON-RPC 2.0 to an execution gateway.
//!
//! The gateway hosts key custody, the bundler and the paymaster. Each chain
//! is served under `<base_url>/<chain_id>`.

use crate::domain::address::Address;
use crate::domain::call::{Call, FeeParameters, OperationReceipt, UserOperation};
use crate::domain::delegation::Delegation;
use crate::domain::network::Network;
use crate::domain::ports::ExecutionBackend;
use crate::error::BackendError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct GasPriceTiers {
    standard: FeeParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayReceipt {
    success: bool,
    #[serde(default)]
    reason: Option<String>,
    receipt: TransactionReceipt,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    transaction_hash: String,
}

impl From<GatewayReceipt> for OperationReceipt {
    fn from(receipt: GatewayReceipt) -> Self {
        Self {
            transaction_hash: receipt.receipt.transaction_hash,
            success: receipt.success,
            reason: receipt.reason,
        }
    }
}

pub struct GatewayBackend {
    client: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
}

impl GatewayBackend {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| BackendError::Unreachable(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    fn endpoint(&self, network: &Network) -> String {
        format!("{}/{}", self.base_url, network.chain_id)
    }

    async fn call<T: DeserializeOwned + Send>(
        &self,
        network: &Network,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, BackendError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, chain_id = network.chain_id, "gateway request");

        let response = self
            .client
            .post(self.endpoint(network))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    method,
                    error = %e,
                    is_connect = e.is_connect(),
                    is_timeout = e.is_timeout(),
                    "gateway request failed"
                );
                classify_send_error(method, &e)
            })?;

        if let Some(error) = classify_status(method, response.status()) {
            return Err(error);
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            return Err(BackendError::Rejected(format!(
                "{method}: {} (code {})",
                error.message, error.code
            )));
        }

        serde_json::from_value(body.result)
            .map_err(|e| BackendError::Protocol(format!("{method}: {e}")))
    }
}

fn classify_send_error(method: &str, error: &reqwest::Error) -> BackendError {
    if error.is_connect() || error.is_builder() {
        BackendError::Unreachable(format!("{method}: {error}"))
    } else {
        BackendError::Indeterminate(format!("{method}: {error}"))
    }
}

/// A 4xx means the gateway refused the request; a 5xx leaves it unknown
/// whether the request took effect.
fn classify_status(method: &str, status: StatusCode) -> Option<BackendError> {
    if status.is_server_error() {
        Some(BackendError::Indeterminate(format!("{method}: HTTP {status}")))
    } else if status.is_client_error() {
        Some(BackendError::Rejected(format!("{method}: HTTP {status}")))
    } else {
        None
    }
}

fn has_code(code: &str) -> bool {
    let digits = code.trim_start_matches("0x");
    !digits.is_empty() && digits.chars().any(|c| c != '0')
}

#[async_trait]
impl ExecutionBackend for GatewayBackend {
    async fn smart_account(&self, network: &Network) -> Result<Address, BackendError> {
        let raw: String = self
            .call(network, "wallet_getAddress", json!([format!("{:#x}", network.chain_id)]))
            .await?;
        Address::parse(&raw).map_err(|e| BackendError::Protocol(format!("wallet_getAddress: {e}")))
    }

    async fn is_deployed(&self, network: &Network, account: &Address) -> Result<bool, BackendError> {
        let code: String = self
            .call(network, "eth_getCode", json!([account, "latest"]))
            .await?;
        Ok(has_code(&code))
    }

    async fn fee_parameters(&self, network: &Network) -> Result<FeeParameters, BackendError> {
        let tiers: GasPriceTiers = self
            .call(network, "pimlico_getUserOperationGasPrice", json!([]))
            .await?;
        Ok(tiers.standard)
    }

    async fn encode_redemption(
        &self,
        network: &Network,
        delegation: &Delegation,
        execution: &Call,
    ) -> Result<Call, BackendError> {
        self.call(
            network,
            "delegation_encodeRedemption",
            json!([{
                "chainId": network.chain_id,
                "delegationManager": network.delegation_manager,
                "delegation": delegation,
                "execution": execution,
            }]),
        )
        .await
    }

    async fn submit_operation(
        &self,
        network: &Network,
        operation: UserOperation,
    ) -> Result<String, BackendError> {
        self.call(
            network,
            "eth_sendUserOperation",
            json!([operation, network.entry_point]),
        )
        .await
    }

    async fn operation_receipt(
        &self,
        network: &Network,
        operation_hash: &str,
    ) -> Result<Option<OperationReceipt>, BackendError> {
        let receipt: Option<GatewayReceipt> = self
            .call(network, "eth_getUserOperationReceipt", json!([operation_hash]))
            .await?;
        Ok(receipt.map(OperationReceipt::from))
    }
}
