use super::address::Address;
use super::call::{Call, FeeParameters, OperationReceipt, UserOperation};
use super::delegation::Delegation;
use super::job::SubscriptionId;
use super::network::Network;
use super::outcome::{FailureKind, PriorSettlement, SubscriptionEvent};
use super::redemption::{RedeemReply, RedeemRequest};
use super::subscription::Subscription;
use crate::error::{BackendError, Result, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Account-abstraction primitives the settlement state machine runs on.
///
/// Signing and key custody live behind this trait.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Smart wallet address derived from the service's signing key.
    async fn smart_account(&self, network: &Network) -> std::result::Result<Address, BackendError>;
    async fn is_deployed(
        &self,
        network: &Network,
        account: &Address,
    ) -> std::result::Result<bool, BackendError>;
    async fn fee_parameters(&self, network: &Network)
    -> std::result::Result<FeeParameters, BackendError>;
    /// Wraps `execution` in a delegation-redemption call.
    async fn encode_redemption(
        &self,
        network: &Network,
        delegation: &Delegation,
        execution: &Call,
    ) -> std::result::Result<Call, BackendError>;
    /// Submits an operation and returns its operation hash.
    async fn submit_operation(
        &self,
        network: &Network,
        operation: UserOperation,
    ) -> std::result::Result<String, BackendError>;
    /// `None` while the operation is still pending.
    async fn operation_receipt(
        &self,
        network: &Network,
        operation_hash: &str,
    ) -> std::result::Result<Option<OperationReceipt>, BackendError>;
}

/// Append-only outcome log plus the subscription schedule it drives.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Appends an event. Fails with `DuplicateTransaction` when the event's
    /// transaction hash is already on record.
    async fn record(&self, event: SubscriptionEvent) -> Result<()>;
    async fn advance_schedule(
        &self,
        subscription_id: &SubscriptionId,
        amount: Decimal,
    ) -> Result<Subscription>;
    /// Records a settlement and advances the schedule. Concrete stores make
    /// the pair atomic.
    async fn record_settlement(&self, event: SubscriptionEvent) -> Result<Subscription> {
        let subscription_id = event.subscription_id.clone();
        let amount = event.amount;
        self.record(event).await?;
        self.advance_schedule(&subscription_id, amount).await
    }
    async fn mark_failed(&self, subscription_id: &SubscriptionId, kind: FailureKind) -> Result<()>;
    /// An earlier settlement of the charge due at `due_at`, recorded or not.
    async fn prior_settlement(
        &self,
        subscription_id: &SubscriptionId,
        due_at: DateTime<Utc>,
    ) -> Result<Option<PriorSettlement>>;
    async fn events(&self, subscription_id: &SubscriptionId) -> Result<Vec<SubscriptionEvent>>;
    async fn subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>>;
    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()>;
}

/// Delegations stored at subscribe time, keyed by subscription.
#[async_trait]
pub trait DelegationStore: Send + Sync {
    async fn delegation(&self, subscription_id: &SubscriptionId) -> Result<Option<Vec<u8>>>;
    async fn store_delegation(&self, subscription_id: &SubscriptionId, delegation: Vec<u8>)
    -> Result<()>;
}

/// The `Redeem` RPC as seen by the dispatcher.
#[async_trait]
pub trait Redeemer: Send + Sync {
    async fn redeem(&self, request: RedeemRequest) -> std::result::Result<RedeemReply, TransportError>;
}

pub type ExecutionBackendRef = Arc<dyn ExecutionBackend>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type DelegationStoreRef = Arc<dyn DelegationStore>;
pub type RedeemerRef = Arc<dyn Redeemer>;
