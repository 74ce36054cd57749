mod common;

use common::{ACCOUNT, delegation_json, job, request};
use redeemer::application::settlement::{RedemptionService, SettlementSettings};
use redeemer::domain::address::Address;
use redeemer::domain::job::SubscriptionId;
use redeemer::domain::network::NetworkRegistry;
use redeemer::domain::outcome::{PriorSettlement, RedemptionOutcome, SubscriptionEvent};
use redeemer::domain::ports::{DelegationStoreRef, EventRecorderRef, ExecutionBackendRef, RedeemerRef};
use redeemer::domain::subscription::Subscription;
use redeemer::infrastructure::in_memory::{InMemoryDelegationStore, InMemoryEventRecorder};
use redeemer::infrastructure::simulated::{SimulatedBackend, SimulatedBehavior};
use rust_decimal_macros::dec;
use std::sync::Arc;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let recorder: EventRecorderRef = Arc::new(InMemoryEventRecorder::new());
    let delegations: DelegationStoreRef = Arc::new(InMemoryDelegationStore::new());
    let id = SubscriptionId::new("S1");

    // Verify Send + Sync by spawning tasks
    let rec_handle = tokio::spawn({
        let recorder = recorder.clone();
        let id = id.clone();
        async move {
            recorder
                .upsert_subscription(Subscription::for_job(&job("S1"), 30))
                .await
                .unwrap();
            let event = SubscriptionEvent::from_outcome(
                id.clone(),
                &RedemptionOutcome::Settled {
                    transaction_hash: "0xaa".to_string(),
                },
                dec!(100),
                common::due(),
            );
            recorder.record_settlement(event).await.unwrap()
        }
    });

    let del_handle = tokio::spawn({
        let delegations = delegations.clone();
        let id = id.clone();
        async move {
            delegations
                .store_delegation(&id, delegation_json(ACCOUNT).into_bytes())
                .await
                .unwrap();
            delegations.delegation(&id).await.unwrap()
        }
    });

    let subscription = rec_handle.await.unwrap();
    assert_eq!(subscription.redemption_count, 1);
    assert_eq!(
        recorder
            .prior_settlement(&id, common::due())
            .await
            .unwrap()
            .as_ref()
            .map(PriorSettlement::hash),
        Some("0xaa")
    );

    let stored = del_handle.await.unwrap().unwrap();
    assert_eq!(stored, delegation_json(ACCOUNT).into_bytes());
}

#[tokio::test]
async fn test_backend_and_redeemer_as_trait_objects() {
    let backend: ExecutionBackendRef = Arc::new(SimulatedBackend::with_behavior(
        Address::parse(ACCOUNT).unwrap(),
        SimulatedBehavior::deployed(),
    ));
    let redeemer: RedeemerRef = Arc::new(RedemptionService::new(
        backend,
        Arc::new(NetworkRegistry::builtin()),
        SettlementSettings::default(),
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let redeemer = redeemer.clone();
            tokio::spawn(async move { redeemer.redeem(request(ACCOUNT)).await.unwrap() })
        })
        .collect();

    let mut hashes = Vec::new();
    for handle in handles {
        let reply = handle.await.unwrap();
        assert!(reply.success, "{}", reply.error_message);
        hashes.push(reply.transaction_hash);
    }
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), 4);
}
