use crate::domain::job::SubscriptionId;
use crate::domain::outcome::{FailureKind, PriorSettlement, SubscriptionEvent};
use crate::domain::ports::{DelegationStore, EventRecorder};
use crate::domain::subscription::Subscription;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct RecorderState {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    events: HashMap<SubscriptionId, Vec<SubscriptionEvent>>,
    tx_hashes: HashSet<String>,
}

impl RecorderState {
    fn append(&mut self, event: SubscriptionEvent) -> Result<()> {
        if let Some(hash) = &event.transaction_hash {
            if self.tx_hashes.contains(hash) {
                return Err(PipelineError::DuplicateTransaction(hash.clone()));
            }
            self.tx_hashes.insert(hash.clone());
        }
        self.events
            .entry(event.subscription_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    fn subscription_mut(&mut self, subscription_id: &SubscriptionId) -> Result<&mut Subscription> {
        self.subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| PipelineError::SubscriptionNotFound(subscription_id.to_string()))
    }
}

/// Event Recorder held entirely in memory.
///
/// A single `RwLock` guards subscriptions, events and the hash index, so a
/// settlement and its schedule advance become visible together.
#[derive(Default, Clone)]
pub struct InMemoryEventRecorder {
    state: Arc<RwLock<RecorderState>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRecorder for InMemoryEventRecorder {
    async fn record(&self, event: SubscriptionEvent) -> Result<()> {
        self.state.write().await.append(event)
    }

    async fn advance_schedule(
        &self,
        subscription_id: &SubscriptionId,
        amount: Decimal,
    ) -> Result<Subscription> {
        let mut state = self.state.write().await;
        let subscription = state.subscription_mut(subscription_id)?;
        subscription.advance(amount);
        Ok(subscription.clone())
    }

    async fn record_settlement(&self, event: SubscriptionEvent) -> Result<Subscription> {
        let mut state = self.state.write().await;
        let subscription_id = event.subscription_id.clone();
        let amount = event.amount;

        // Fail before appending so a missing subscription leaves no orphan row.
        state.subscription_mut(&subscription_id)?;
        state.append(event)?;

        let subscription = state.subscription_mut(&subscription_id)?;
        subscription.advance(amount);
        Ok(subscription.clone())
    }

    async fn mark_failed(&self, subscription_id: &SubscriptionId, kind: FailureKind) -> Result<()> {
        let mut state = self.state.write().await;
        state.subscription_mut(subscription_id)?.apply_failure(kind);
        Ok(())
    }

    async fn prior_settlement(
        &self,
        subscription_id: &SubscriptionId,
        due_at: DateTime<Utc>,
    ) -> Result<Option<PriorSettlement>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .get(subscription_id)
            .and_then(|events| PriorSettlement::find(events, due_at)))
    }

    async fn events(&self, subscription_id: &SubscriptionId) -> Result<Vec<SubscriptionEvent>> {
        let state = self.state.read().await;
        Ok(state.events.get(subscription_id).cloned().unwrap_or_default())
    }

    async fn subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        let state = self.state.read().await;
        Ok(state.subscriptions.get(subscription_id).cloned())
    }

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }
}

/// Delegations kept in memory, keyed by subscription.
#[derive(Default, Clone)]
pub struct InMemoryDelegationStore {
    delegations: Arc<RwLock<HashMap<SubscriptionId, Vec<u8>>>>,
}

impl InMemoryDelegationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelegationStore for InMemoryDelegationStore {
    async fn delegation(&self, subscription_id: &SubscriptionId) -> Result<Option<Vec<u8>>> {
        let delegations = self.delegations.read().await;
        Ok(delegations.get(subscription_id).cloned())
    }

    async fn store_delegation(
        &self,
        subscription_id: &SubscriptionId,
        delegation: Vec<u8>,
    ) -> Result<()> {
        let mut delegations = self.delegations.write().await;
        delegations.insert(subscription_id.clone(), delegation);
        Ok(())
    }
}
