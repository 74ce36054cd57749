#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redeemer::domain::address::Address;
use redeemer::domain::job::{RedemptionJob, SubscriptionId};
use redeemer::domain::outcome::FailureKind;
use redeemer::domain::ports::{DelegationStore, EventRecorder, Redeemer};
use redeemer::domain::redemption::{RedeemReply, RedeemRequest};
use redeemer::domain::subscription::Subscription;
use redeemer::error::TransportError;
use redeemer::infrastructure::in_memory::{InMemoryDelegationStore, InMemoryEventRecorder};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const ACCOUNT: &str = "0x2222222222222222222222222222222222222222";
pub const DELEGATOR: &str = "0x1111111111111111111111111111111111111111";
pub const MERCHANT: &str = "0x4444444444444444444444444444444444444444";
pub const TOKEN: &str = "0x5555555555555555555555555555555555555555";

/// Amount in base units that makes `ScriptedRedeemer` panic.
pub const PANIC_AMOUNT: u128 = 13;

pub fn due() -> DateTime<Utc> {
    "2026-01-01T00:00:00Z".parse().unwrap()
}

pub fn delegation_json(delegate: &str) -> String {
    json!({
        "delegator": DELEGATOR,
        "delegate": delegate,
        "authority": {
            "scheme": "root",
            "signature": "0xabcd",
            "signer": DELEGATOR
        },
        "caveats": [],
        "salt": "1",
        "signature": "0xdeadbeef"
    })
    .to_string()
}

/// 100 USDC on Sepolia, due on `due()`.
pub fn job(id: &str) -> RedemptionJob {
    RedemptionJob {
        subscription_id: SubscriptionId::new(id),
        payer_wallet: Address::parse(DELEGATOR).unwrap(),
        merchant_address: Address::parse(MERCHANT).unwrap(),
        token_contract_address: Address::parse(TOKEN).unwrap(),
        amount: 100_000_000,
        decimals: 6,
        chain_id: 11155111,
        network_name: "sepolia".to_string(),
        due_at: due(),
    }
}

pub fn request(delegate: &str) -> RedeemRequest {
    job("S1")
        .to_request(delegation_json(delegate).into_bytes())
        .unwrap()
}

/// Stores a subscription row and a delegation for each id.
pub async fn seed_stores(ids: &[&str]) -> (Arc<InMemoryEventRecorder>, Arc<InMemoryDelegationStore>) {
    let recorder = Arc::new(InMemoryEventRecorder::new());
    let delegations = Arc::new(InMemoryDelegationStore::new());
    for id in ids {
        let job = job(id);
        recorder
            .upsert_subscription(Subscription::for_job(&job, 30))
            .await
            .unwrap();
        delegations
            .store_delegation(&job.subscription_id, delegation_json(ACCOUNT).into_bytes())
            .await
            .unwrap();
    }
    (recorder, delegations)
}

#[derive(Debug, Clone)]
pub enum Script {
    /// Settle with a fresh hash per call.
    Settle,
    /// Settle every call with the same hash.
    SettleWith(String),
    Fail(FailureKind),
    ConnectError,
    TransportError,
}

/// Redeemer double that tracks how many calls overlap.
pub struct ScriptedRedeemer {
    script: Script,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<RedeemRequest>>,
}

impl ScriptedRedeemer {
    pub fn new(script: Script, delay: Duration) -> Self {
        Self {
            script,
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn settling(delay: Duration) -> Self {
        Self::new(Script::Settle, delay)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RedeemRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Redeemer for ScriptedRedeemer {
    async fn redeem(&self, request: RedeemRequest) -> Result<RedeemReply, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = Active(&self.active);

        let panic = request.amount == PANIC_AMOUNT;
        self.requests.lock().unwrap().push(request);
        if panic {
            panic!("scripted panic");
        }

        tokio::time::sleep(self.delay).await;

        match &self.script {
            Script::Settle => Ok(RedeemReply::settled(format!(
                "0x{}{}",
                uuid::Uuid::now_v7().simple(),
                uuid::Uuid::new_v4().simple()
            ))),
            Script::SettleWith(hash) => Ok(RedeemReply::settled(hash.clone())),
            Script::Fail(kind) => Ok(RedeemReply::failed(*kind, "scripted failure")),
            Script::ConnectError => Err(TransportError::Connect("connection refused".to_string())),
            Script::TransportError => Err(TransportError::Transport("connection reset".to_string())),
        }
    }
}
