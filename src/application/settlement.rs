//! Server-side settlement of a single redemption request.
//!
//! ```text
//! Received ─► Validated ─► AccountResolved ─┬─────────────────────────────┬─► OperationBuilt ─► Submitted ─► Confirmed
//!                                           └► DeploymentSubmitted ─► Deployed ┘
//! ```
//!
//! Every state may fall through to `Failed(kind, reason)`. Validation is pure
//! and runs before any backend call; the wallet is deployed with a separate
//! zero-value operation that must confirm before the redemption is built.

use crate::domain::address::Address;
use crate::domain::amount::TokenAmount;
use crate::domain::call::{Call, OperationReceipt, UserOperation};
use crate::domain::delegation::Delegation;
use crate::domain::network::{Network, NetworkRegistry};
use crate::domain::outcome::FailureKind;
use crate::domain::ports::{ExecutionBackendRef, Redeemer};
use crate::domain::redemption::{RedeemReply, RedeemRequest};
use crate::error::{BackendError, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Received,
    Validated,
    AccountResolved,
    DeploymentSubmitted,
    Deployed,
    OperationBuilt,
    Submitted,
    Confirmed,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementState::Received => "received",
            SettlementState::Validated => "validated",
            SettlementState::AccountResolved => "account_resolved",
            SettlementState::DeploymentSubmitted => "deployment_submitted",
            SettlementState::Deployed => "deployed",
            SettlementState::OperationBuilt => "operation_built",
            SettlementState::Submitted => "submitted",
            SettlementState::Confirmed => "confirmed",
        };
        f.write_str(name)
    }
}

/// Why a settlement stopped, and in which state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementFailure {
    pub state: SettlementState,
    pub kind: FailureKind,
    pub reason: String,
}

impl SettlementFailure {
    fn new(state: SettlementState, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            state,
            kind,
            reason: reason.into(),
        }
    }

    fn validation(reason: impl Into<String>) -> Self {
        Self::new(SettlementState::Received, FailureKind::Validation, reason)
    }
}

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    /// Upper bound on waiting for the redemption receipt.
    pub receipt_timeout: Duration,
    /// Upper bound on waiting for the bootstrap operation's receipt.
    pub deployment_timeout: Duration,
    pub poll_interval: Duration,
    /// Deadline applied when the service is called in-process.
    pub request_budget: Duration,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            receipt_timeout: Duration::from_secs(90),
            deployment_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(2),
            request_budget: Duration::from_secs(170),
        }
    }
}

/// Inputs that survived validation.
#[derive(Debug)]
struct ValidatedRequest<'a> {
    delegation: Delegation,
    network: &'a Network,
    merchant: Address,
    token: Address,
    amount: TokenAmount,
}

/// Source of the current time for delegation expiry checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The settlement state machine bound to an execution backend.
#[derive(Clone)]
pub struct RedemptionService {
    backend: ExecutionBackendRef,
    networks: Arc<NetworkRegistry>,
    settings: SettlementSettings,
    clock: Clock,
}

impl RedemptionService {
    pub fn new(
        backend: ExecutionBackendRef,
        networks: Arc<NetworkRegistry>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            backend,
            networks,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the wall clock used to judge delegation expiry.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    /// Runs one request to a terminal reply. Never returns an error: every
    /// failure is folded into `success = false` with its classification.
    #[instrument(skip_all, fields(chain_id = request.chain_id))]
    pub async fn execute(&self, request: &RedeemRequest, deadline: Instant) -> RedeemReply {
        match self.settle(request, deadline).await {
            Ok(transaction_hash) => {
                info!(tx_hash = %transaction_hash, state = %SettlementState::Confirmed, "redemption confirmed");
                RedeemReply::settled(transaction_hash)
            }
            Err(failure) => {
                warn!(
                    state = %failure.state,
                    kind = %failure.kind,
                    reason = %failure.reason,
                    "redemption failed"
                );
                RedeemReply::failed(failure.kind, failure.reason)
            }
        }
    }

    /// Drives the state machine, returning the transaction hash on success.
    pub async fn settle(
        &self,
        request: &RedeemRequest,
        deadline: Instant,
    ) -> Result<String, SettlementFailure> {
        let validated = self.validate(request, (self.clock)())?;
        debug!(state = %SettlementState::Validated, delegator = %validated.delegation.delegator);

        let account = self.resolve_account(&validated).await?;
        debug!(state = %SettlementState::AccountResolved, account = %account);

        self.ensure_deployed(&validated, &account, deadline).await?;
        debug!(state = %SettlementState::Deployed, account = %account);

        let call = self.build_operation(&validated).await?;
        debug!(state = %SettlementState::OperationBuilt, to = %call.to);

        let operation_hash = self.submit(validated.network, &account, call).await?;
        debug!(state = %SettlementState::Submitted, operation_hash = %operation_hash);

        self.confirm(validated.network, &operation_hash, deadline).await
    }

    /// Received → Validated. Pure: no backend calls, time comes from `now`.
    fn validate(
        &self,
        request: &RedeemRequest,
        now: DateTime<Utc>,
    ) -> Result<ValidatedRequest<'_>, SettlementFailure> {
        let delegation = Delegation::parse(request.delegation.as_bytes(), now)
            .map_err(|e| SettlementFailure::validation(e.to_string()))?;

        let amount = TokenAmount::new(request.amount, request.token_decimals)
            .map_err(|e| SettlementFailure::validation(e.to_string()))?;

        let merchant = Address::parse(&request.merchant_address)
            .map_err(|e| SettlementFailure::validation(format!("merchant_address: {e}")))?;
        let token = Address::parse(&request.token_contract_address)
            .map_err(|e| SettlementFailure::validation(format!("token_contract_address: {e}")))?;

        let network = self.networks.get(request.chain_id).ok_or_else(|| {
            SettlementFailure::validation(format!("unsupported chain id {}", request.chain_id))
        })?;
        if !network.matches_name(&request.network_name) {
            warn!(
                chain_id = request.chain_id,
                requested = %request.network_name,
                configured = %network.name,
                "network name disagrees with chain id; using chain id"
            );
        }

        Ok(ValidatedRequest {
            delegation,
            network,
            merchant,
            token,
            amount,
        })
    }

    /// Validated → AccountResolved. A delegate mismatch is permanent.
    async fn resolve_account(
        &self,
        validated: &ValidatedRequest<'_>,
    ) -> Result<Address, SettlementFailure> {
        let account = self
            .backend
            .smart_account(validated.network)
            .await
            .map_err(|e| {
                SettlementFailure::new(
                    SettlementState::Validated,
                    FailureKind::Redemption,
                    format!("resolving redeemer account: {e}"),
                )
            })?;

        if account != validated.delegation.delegate {
            return Err(SettlementFailure::new(
                SettlementState::Validated,
                FailureKind::Validation,
                format!(
                    "delegation delegate {} does not match redeemer account {}",
                    validated.delegation.delegate, account
                ),
            ));
        }

        Ok(account)
    }

    /// AccountResolved → Deployed, submitting a bootstrap operation first if
    /// the wallet has no code yet. A retry that finds it deployed skips ahead.
    async fn ensure_deployed(
        &self,
        validated: &ValidatedRequest<'_>,
        account: &Address,
        deadline: Instant,
    ) -> Result<(), SettlementFailure> {
        let state = SettlementState::AccountResolved;
        let network = validated.network;

        let deployed = self
            .backend
            .is_deployed(network, account)
            .await
            .map_err(|e| pre_submission(state, "checking deployment", e))?;
        if deployed {
            return Ok(());
        }

        info!(account = %account, chain_id = network.chain_id, "deploying smart wallet");
        let fees = self
            .backend
            .fee_parameters(network)
            .await
            .map_err(|e| pre_submission(state, "fetching fees for deployment", e))?;
        let operation = UserOperation {
            sender: account.clone(),
            calls: vec![Call::bootstrap(account)],
            fees,
        };
        // The bootstrap moves no value, so any failure here is safe to retry.
        let operation_hash = self
            .backend
            .submit_operation(network, operation)
            .await
            .map_err(|e| pre_submission(state, "submitting deployment", e))?;

        let state = SettlementState::DeploymentSubmitted;
        let wait = bounded_wait(self.settings.deployment_timeout, deadline);
        let receipt = self
            .await_receipt(network, &operation_hash, wait)
            .await
            .ok_or_else(|| {
                SettlementFailure::new(
                    state,
                    FailureKind::Redemption,
                    format!("deployment not confirmed within {wait:?}"),
                )
            })?;
        if !receipt.success {
            return Err(SettlementFailure::new(
                state,
                FailureKind::Redemption,
                format!(
                    "deployment reverted: {}",
                    receipt.reason.as_deref().unwrap_or("no reason")
                ),
            ));
        }

        let deployed = self
            .backend
            .is_deployed(network, account)
            .await
            .map_err(|e| pre_submission(state, "re-checking deployment", e))?;
        if !deployed {
            return Err(SettlementFailure::new(
                state,
                FailureKind::Redemption,
                "wallet still undeployed after bootstrap confirmed",
            ));
        }
        Ok(())
    }

    /// Deployed → OperationBuilt: transfer call wrapped in a redemption call.
    async fn build_operation(
        &self,
        validated: &ValidatedRequest<'_>,
    ) -> Result<Call, SettlementFailure> {
        let transfer = Call::erc20_transfer(&validated.token, &validated.merchant, &validated.amount);
        self.backend
            .encode_redemption(validated.network, &validated.delegation, &transfer)
            .await
            .map_err(|e| pre_submission(SettlementState::Deployed, "encoding redemption", e))
    }

    /// OperationBuilt → Submitted. Fees are fetched fresh for every attempt.
    async fn submit(
        &self,
        network: &Network,
        account: &Address,
        call: Call,
    ) -> Result<String, SettlementFailure> {
        let state = SettlementState::OperationBuilt;
        let fees = self
            .backend
            .fee_parameters(network)
            .await
            .map_err(|e| pre_submission(state, "fetching fees", e))?;

        let operation = UserOperation {
            sender: account.clone(),
            calls: vec![call],
            fees,
        };

        self.backend
            .submit_operation(network, operation)
            .await
            .map_err(|e| {
                let kind = if e.provably_not_applied() {
                    FailureKind::Redemption
                } else {
                    FailureKind::Transaction
                };
                SettlementFailure::new(state, kind, format!("submitting redemption: {e}"))
            })
    }

    /// Submitted → Confirmed. Timeouts and reverts are post-submission failures.
    async fn confirm(
        &self,
        network: &Network,
        operation_hash: &str,
        deadline: Instant,
    ) -> Result<String, SettlementFailure> {
        let state = SettlementState::Submitted;
        let wait = bounded_wait(self.settings.receipt_timeout, deadline);
        let receipt = self
            .await_receipt(network, operation_hash, wait)
            .await
            .ok_or_else(|| {
                SettlementFailure::new(
                    state,
                    FailureKind::Transaction,
                    format!("operation {operation_hash} not confirmed within {wait:?}"),
                )
            })?;

        if receipt.success && !receipt.transaction_hash.is_empty() {
            Ok(receipt.transaction_hash)
        } else {
            Err(SettlementFailure::new(
                state,
                FailureKind::Transaction,
                format!(
                    "operation reverted in transaction {}: {}",
                    receipt.transaction_hash,
                    receipt.reason.as_deref().unwrap_or("no reason")
                ),
            ))
        }
    }

    /// Polls for a receipt until `wait` elapses. Poll errors are logged and
    /// retried on the next tick.
    async fn await_receipt(
        &self,
        network: &Network,
        operation_hash: &str,
        wait: Duration,
    ) -> Option<OperationReceipt> {
        let poll = async {
            loop {
                match self.backend.operation_receipt(network, operation_hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => {
                        debug!(operation_hash, error = %e, "receipt poll failed");
                    }
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        tokio::time::timeout(wait, poll).await.ok()
    }
}

fn pre_submission(state: SettlementState, step: &str, error: BackendError) -> SettlementFailure {
    SettlementFailure::new(state, FailureKind::Redemption, format!("{step}: {error}"))
}

fn bounded_wait(limit: Duration, deadline: Instant) -> Duration {
    limit.min(deadline.saturating_duration_since(Instant::now()))
}

#[async_trait]
impl Redeemer for RedemptionService {
    async fn redeem(&self, request: RedeemRequest) -> Result<RedeemReply, TransportError> {
        let deadline = Instant::now() + self.settings.request_budget;
        Ok(self.execute(&request, deadline).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated::{BackendCall, SimulatedBackend, SimulatedBehavior};
    use serde_json::json;

    const ACCOUNT: &str = "0x2222222222222222222222222222222222222222";

    fn delegation(delegate: &str) -> String {
        json!({
            "delegator": "0x1111111111111111111111111111111111111111",
            "delegate": delegate,
            "authority": {
                "scheme": "root",
                "signature": "0x01",
                "signer": "0x1111111111111111111111111111111111111111"
            },
            "caveats": [],
            "salt": "1",
            "signature": "0xabcdef"
        })
        .to_string()
    }

    fn request(delegate: &str) -> RedeemRequest {
        RedeemRequest {
            delegation: delegation(delegate),
            merchant_address: "0x4444444444444444444444444444444444444444".to_string(),
            token_contract_address: "0x5555555555555555555555555555555555555555".to_string(),
            amount: 100_000_000,
            token_decimals: 6,
            chain_id: 11155111,
            network_name: "sepolia".to_string(),
        }
    }

    fn service(behavior: SimulatedBehavior) -> (RedemptionService, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::with_behavior(
            Address::parse(ACCOUNT).unwrap(),
            behavior,
        ));
        let settings = SettlementSettings {
            receipt_timeout: Duration::from_millis(300),
            deployment_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
            request_budget: Duration::from_secs(5),
        };
        let service = RedemptionService::new(
            backend.clone(),
            Arc::new(NetworkRegistry::builtin()),
            settings,
        );
        (service, backend)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_malformed_delegation_makes_no_backend_calls() {
        let (service, backend) = service(SimulatedBehavior::deployed());
        let mut req = request(ACCOUNT);
        req.delegation = "{\"delegator\":".to_string();

        let failure = service.settle(&req, deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.state, SettlementState::Received);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_judged_against_injected_clock() {
        let expiry: DateTime<Utc> = "2026-06-01T00:00:00Z".parse().unwrap();
        let mut req = request(ACCOUNT);
        let mut delegation: serde_json::Value = serde_json::from_str(&req.delegation).unwrap();
        delegation["expiry"] = json!(expiry.timestamp());
        req.delegation = delegation.to_string();

        let (early, _backend) = service(SimulatedBehavior::deployed());
        let before = early.with_clock(Arc::new(move || expiry - chrono::TimeDelta::seconds(1)));
        assert!(before.settle(&req, deadline()).await.is_ok());

        let (late, backend) = service(SimulatedBehavior::deployed());
        let at_expiry = late.with_clock(Arc::new(move || expiry));
        let failure = at_expiry.settle(&req, deadline()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(failure.reason.contains("expired"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_decimals_rejected_before_network() {
        let (service, backend) = service(SimulatedBehavior::deployed());
        let mut req = request(ACCOUNT);
        req.token_decimals = 0;

        let failure = service.settle(&req, deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_chain_rejected_before_network() {
        let (service, backend) = service(SimulatedBehavior::deployed());
        let mut req = request(ACCOUNT);
        req.chain_id = 424242;

        let failure = service.settle(&req, deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Validation);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delegate_mismatch_stops_after_account_resolution() {
        let (service, backend) = service(SimulatedBehavior::deployed());
        let req = request("0x9999999999999999999999999999999999999999");

        let failure = service.settle(&req, deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(backend.calls(), vec![BackendCall::SmartAccount]);
    }

    #[tokio::test]
    async fn test_happy_path_skips_deployment() {
        let (service, backend) = service(SimulatedBehavior::deployed());

        let hash = service.settle(&request(ACCOUNT), deadline()).await.unwrap();

        assert!(hash.starts_with("0x"));
        assert_eq!(backend.submitted_operations(), 1);
        assert!(!backend.calls().contains(&BackendCall::SubmitBootstrap));
    }

    #[tokio::test]
    async fn test_undeployed_wallet_bootstraps_first() {
        let (service, backend) = service(SimulatedBehavior::default());

        let hash = service.settle(&request(ACCOUNT), deadline()).await.unwrap();

        assert!(!hash.is_empty());
        let calls = backend.calls();
        let bootstrap = calls
            .iter()
            .position(|c| *c == BackendCall::SubmitBootstrap)
            .unwrap();
        let redemption = calls
            .iter()
            .position(|c| *c == BackendCall::SubmitOperation)
            .unwrap();
        assert!(bootstrap < redemption);
        assert_eq!(backend.submitted_operations(), 2);
    }

    #[tokio::test]
    async fn test_fee_failure_is_retry_safe() {
        let (service, backend) = service(SimulatedBehavior {
            fee_error: Some("rpc down".to_string()),
            ..SimulatedBehavior::deployed()
        });

        let failure = service.settle(&request(ACCOUNT), deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Redemption);
        assert_eq!(backend.submitted_operations(), 0);
    }

    #[tokio::test]
    async fn test_fees_fetched_for_every_submission() {
        let (service, backend) = service(SimulatedBehavior::default());

        service.settle(&request(ACCOUNT), deadline()).await.unwrap();

        let fee_calls = backend
            .calls()
            .into_iter()
            .filter(|c| *c == BackendCall::FeeParameters)
            .count();
        assert_eq!(fee_calls, 2);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_retry_safe() {
        let (service, _backend) = service(SimulatedBehavior {
            submit_error: Some(BackendError::Rejected("underpriced".to_string())),
            ..SimulatedBehavior::deployed()
        });

        let failure = service.settle(&request(ACCOUNT), deadline()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Redemption);
    }

    #[tokio::test]
    async fn test_indeterminate_submission_is_transaction_failure() {
        let (service, _backend) = service(SimulatedBehavior {
            submit_error: Some(BackendError::Indeterminate("gateway timeout".to_string())),
            ..SimulatedBehavior::deployed()
        });

        let failure = service.settle(&request(ACCOUNT), deadline()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transaction);
    }

    #[tokio::test]
    async fn test_revert_is_transaction_failure() {
        let (service, _backend) = service(SimulatedBehavior {
            revert_reason: Some("allowance exceeded".to_string()),
            ..SimulatedBehavior::deployed()
        });

        let failure = service.settle(&request(ACCOUNT), deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Transaction);
        assert_eq!(failure.state, SettlementState::Submitted);
        assert!(failure.reason.contains("allowance exceeded"));
    }

    #[tokio::test]
    async fn test_receipt_timeout_is_transaction_failure() {
        let (service, _backend) = service(SimulatedBehavior {
            never_confirm: true,
            ..SimulatedBehavior::deployed()
        });

        let failure = service.settle(&request(ACCOUNT), deadline()).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Transaction);
        assert!(failure.reason.contains("not confirmed"));
    }

    #[tokio::test]
    async fn test_execute_folds_failures_into_reply() {
        let (service, _backend) = service(SimulatedBehavior::deployed());
        let reply = service
            .execute(&request("0x9999999999999999999999999999999999999999"), deadline())
            .await;

        assert!(!reply.success);
        assert!(reply.transaction_hash.is_empty());
        assert_eq!(reply.failure_kind, Some(FailureKind::Validation));
    }
}
