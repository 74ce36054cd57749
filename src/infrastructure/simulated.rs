//! Deterministic in-process execution backend.
//!
//! Used for local runs and tests. Behaviour is scripted up front and every
//! call is logged so tests can assert on what the state machine did.

use crate::domain::address::Address;
use crate::domain::call::{Call, FeeParameters, OperationReceipt, UserOperation};
use crate::domain::delegation::Delegation;
use crate::domain::network::Network;
use crate::domain::ports::ExecutionBackend;
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// `redeemDelegations(bytes[],bytes32[],bytes[])`
const REDEEM_DELEGATIONS_SELECTOR: &str = "cef6d209";

#[derive(Debug, Clone, Default)]
pub struct SimulatedBehavior {
    /// Wallet already has code on every chain.
    pub deployed: bool,
    pub fee_error: Option<String>,
    pub submit_error: Option<BackendError>,
    /// Redemption operations land but revert with this reason.
    pub revert_reason: Option<String>,
    /// Receipt polls answered with "pending" before the receipt appears.
    pub pending_polls: u32,
    pub never_confirm: bool,
    /// Delay added to every call.
    pub latency: Duration,
}

impl SimulatedBehavior {
    pub fn deployed() -> Self {
        Self {
            deployed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    SmartAccount,
    IsDeployed,
    FeeParameters,
    EncodeRedemption,
    SubmitBootstrap,
    SubmitOperation,
    OperationReceipt,
}

struct PendingOperation {
    transaction_hash: String,
    bootstrap: bool,
    chain_id: u64,
    polls_left: u32,
}

#[derive(Default)]
struct ChainState {
    deployed: HashSet<u64>,
    operations: HashMap<String, PendingOperation>,
    calls: Vec<BackendCall>,
    submitted: usize,
}

pub struct SimulatedBackend {
    account: Address,
    behavior: SimulatedBehavior,
    state: Mutex<ChainState>,
}

impl SimulatedBackend {
    /// A backend whose wallet starts undeployed on every chain.
    pub fn new(account: Address) -> Self {
        Self::with_behavior(account, SimulatedBehavior::default())
    }

    pub fn with_behavior(account: Address, behavior: SimulatedBehavior) -> Self {
        Self {
            account,
            behavior,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    /// Operations accepted by `submit_operation`, bootstrap included.
    pub fn submitted_operations(&self) -> usize {
        self.state().submitted
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, call: BackendCall) {
        self.state().calls.push(call);
        if !self.behavior.latency.is_zero() {
            tokio::time::sleep(self.behavior.latency).await;
        }
    }

    fn is_deployed_on(&self, chain_id: u64) -> bool {
        self.behavior.deployed || self.state().deployed.contains(&chain_id)
    }
}

fn random_hash() -> String {
    format!("0x{}{}", Uuid::now_v7().simple(), Uuid::new_v4().simple())
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn smart_account(&self, _network: &Network) -> Result<Address, BackendError> {
        self.enter(BackendCall::SmartAccount).await;
        Ok(self.account.clone())
    }

    async fn is_deployed(&self, network: &Network, account: &Address) -> Result<bool, BackendError> {
        self.enter(BackendCall::IsDeployed).await;
        Ok(account == &self.account && self.is_deployed_on(network.chain_id))
    }

    async fn fee_parameters(&self, _network: &Network) -> Result<FeeParameters, BackendError> {
        self.enter(BackendCall::FeeParameters).await;
        match &self.behavior.fee_error {
            Some(reason) => Err(BackendError::Unreachable(reason.clone())),
            None => Ok(FeeParameters {
                max_fee_per_gas: 1_500_000_000,
                max_priority_fee_per_gas: 1_000_000_000,
            }),
        }
    }

    async fn encode_redemption(
        &self,
        network: &Network,
        delegation: &Delegation,
        execution: &Call,
    ) -> Result<Call, BackendError> {
        self.enter(BackendCall::EncodeRedemption).await;
        Ok(Call {
            to: network.delegation_manager.clone(),
            value: 0,
            data: format!(
                "0x{}{}{}{}",
                REDEEM_DELEGATIONS_SELECTOR,
                delegation.delegator.to_word(),
                execution.to.to_word(),
                execution.data.trim_start_matches("0x")
            ),
        })
    }

    async fn submit_operation(
        &self,
        network: &Network,
        operation: UserOperation,
    ) -> Result<String, BackendError> {
        let bootstrap = operation.is_bootstrap();
        self.enter(if bootstrap {
            BackendCall::SubmitBootstrap
        } else {
            BackendCall::SubmitOperation
        })
        .await;

        if let Some(error) = &self.behavior.submit_error {
            return Err(error.clone());
        }
        if operation.sender != self.account {
            return Err(BackendError::Rejected(format!(
                "unknown sender {}",
                operation.sender
            )));
        }
        if !bootstrap && !self.is_deployed_on(network.chain_id) {
            return Err(BackendError::Rejected(
                "AA20 account not deployed".to_string(),
            ));
        }

        let operation_hash = random_hash();
        let mut state = self.state();
        state.submitted += 1;
        state.operations.insert(
            operation_hash.clone(),
            PendingOperation {
                transaction_hash: random_hash(),
                bootstrap,
                chain_id: network.chain_id,
                polls_left: self.behavior.pending_polls,
            },
        );
        Ok(operation_hash)
    }

    async fn operation_receipt(
        &self,
        _network: &Network,
        operation_hash: &str,
    ) -> Result<Option<OperationReceipt>, BackendError> {
        self.enter(BackendCall::OperationReceipt).await;
        if self.behavior.never_confirm {
            return Ok(None);
        }

        let mut state = self.state();
        let Some(pending) = state.operations.get_mut(operation_hash) else {
            return Err(BackendError::Protocol(format!(
                "unknown operation {operation_hash}"
            )));
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(None);
        }

        let transaction_hash = pending.transaction_hash.clone();
        let receipt = if pending.bootstrap {
            let chain_id = pending.chain_id;
            state.deployed.insert(chain_id);
            OperationReceipt {
                transaction_hash,
                success: true,
                reason: None,
            }
        } else {
            OperationReceipt {
                transaction_hash,
                success: self.behavior.revert_reason.is_none(),
                reason: self.behavior.revert_reason.clone(),
            }
        };
        Ok(Some(receipt))
    }
}
