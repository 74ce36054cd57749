use crate::domain::job::SubscriptionId;
use crate::domain::outcome::{FailureKind, PriorSettlement, SubscriptionEvent};
use crate::domain::ports::{DelegationStore, EventRecorder};
use crate::domain::subscription::Subscription;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Column Family for subscription rows, keyed by subscription id.
pub const CF_SUBSCRIPTIONS: &str = "subscriptions";
/// Column Family for the event log, keyed by `subscription_id \0 event uuid`.
pub const CF_EVENTS: &str = "events";
/// Column Family indexing every recorded transaction hash.
pub const CF_TX_HASHES: &str = "tx_hashes";
/// Column Family for delegations stored at subscribe time.
pub const CF_DELEGATIONS: &str = "delegations";

/// A persistent Event Recorder and Delegation store using RocksDB.
///
/// Event ids are UUIDv7, so a prefix scan over one subscription returns its
/// events in insertion order. Check-then-write sequences run under a single
/// writer lock and land in one `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_SUBSCRIPTIONS, CF_EVENTS, CF_TX_HASHES, CF_DELEGATIONS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PipelineError::StorageError(format!("{name} column family not found")))
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        let cf = self.cf(CF_SUBSCRIPTIONS)?;
        match self.db.get_cf(cf, subscription_id.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_subscription(&self, subscription_id: &SubscriptionId) -> Result<Subscription> {
        self.load_subscription(subscription_id)?
            .ok_or_else(|| PipelineError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// Queues the event row and its hash index entry, rejecting known hashes.
    fn stage_event(&self, batch: &mut WriteBatch, event: &SubscriptionEvent) -> Result<()> {
        let key = event_key(&event.subscription_id, event);
        if let Some(hash) = &event.transaction_hash {
            let hashes = self.cf(CF_TX_HASHES)?;
            if self.db.get_pinned_cf(hashes, hash.as_bytes())?.is_some() {
                return Err(PipelineError::DuplicateTransaction(hash.clone()));
            }
            batch.put_cf(hashes, hash.as_bytes(), &key);
        }
        batch.put_cf(self.cf(CF_EVENTS)?, key, serde_json::to_vec(event)?);
        Ok(())
    }

    fn stage_subscription(&self, batch: &mut WriteBatch, subscription: &Subscription) -> Result<()> {
        batch.put_cf(
            self.cf(CF_SUBSCRIPTIONS)?,
            subscription.id.as_str(),
            serde_json::to_vec(subscription)?,
        );
        Ok(())
    }

    fn append(&self, event: &SubscriptionEvent) -> Result<()> {
        let _guard = self.write_guard();
        let mut batch = WriteBatch::default();
        self.stage_event(&mut batch, event)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn update_subscription<F>(&self, subscription_id: &SubscriptionId, change: F) -> Result<Subscription>
    where
        F: FnOnce(&mut Subscription),
    {
        let _guard = self.write_guard();
        let mut subscription = self.require_subscription(subscription_id)?;
        change(&mut subscription);
        let mut batch = WriteBatch::default();
        self.stage_subscription(&mut batch, &subscription)?;
        self.db.write(batch)?;
        Ok(subscription)
    }

    fn settle(&self, event: &SubscriptionEvent) -> Result<Subscription> {
        let _guard = self.write_guard();
        let mut subscription = self.require_subscription(&event.subscription_id)?;
        subscription.advance(event.amount);

        let mut batch = WriteBatch::default();
        self.stage_event(&mut batch, event)?;
        self.stage_subscription(&mut batch, &subscription)?;
        self.db.write(batch)?;
        Ok(subscription)
    }

    fn scan_events(&self, subscription_id: &SubscriptionId) -> Result<Vec<SubscriptionEvent>> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = event_prefix(subscription_id);
        let mut events = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(serde_json::from_slice(&value)?);
        }

        Ok(events)
    }
}

fn event_prefix(subscription_id: &SubscriptionId) -> Vec<u8> {
    let mut prefix = subscription_id.as_str().as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn event_key(subscription_id: &SubscriptionId, event: &SubscriptionEvent) -> Vec<u8> {
    let mut key = event_prefix(subscription_id);
    key.extend_from_slice(event.id.as_bytes());
    key
}

#[async_trait]
impl EventRecorder for RocksDbStore {
    async fn record(&self, event: SubscriptionEvent) -> Result<()> {
        self.append(&event)
    }

    async fn advance_schedule(
        &self,
        subscription_id: &SubscriptionId,
        amount: Decimal,
    ) -> Result<Subscription> {
        self.update_subscription(subscription_id, |subscription| subscription.advance(amount))
    }

    async fn record_settlement(&self, event: SubscriptionEvent) -> Result<Subscription> {
        self.settle(&event)
    }

    async fn mark_failed(&self, subscription_id: &SubscriptionId, kind: FailureKind) -> Result<()> {
        self.update_subscription(subscription_id, |subscription| subscription.apply_failure(kind))?;
        Ok(())
    }

    async fn prior_settlement(
        &self,
        subscription_id: &SubscriptionId,
        due_at: DateTime<Utc>,
    ) -> Result<Option<PriorSettlement>> {
        Ok(PriorSettlement::find(&self.scan_events(subscription_id)?, due_at))
    }

    async fn events(&self, subscription_id: &SubscriptionId) -> Result<Vec<SubscriptionEvent>> {
        self.scan_events(subscription_id)
    }

    async fn subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.load_subscription(subscription_id)
    }

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        let _guard = self.write_guard();
        let mut batch = WriteBatch::default();
        self.stage_subscription(&mut batch, &subscription)?;
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl DelegationStore for RocksDbStore {
    async fn delegation(&self, subscription_id: &SubscriptionId) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(CF_DELEGATIONS)?;
        Ok(self.db.get_cf(cf, subscription_id.as_str())?)
    }

    async fn store_delegation(
        &self,
        subscription_id: &SubscriptionId,
        delegation: Vec<u8>,
    ) -> Result<()> {
        let cf = self.cf(CF_DELEGATIONS)?;
        self.db.put_cf(cf, subscription_id.as_str(), delegation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::RedemptionOutcome;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn due() -> DateTime<Utc> {
        "2026-02-01T00:00:00Z".parse().unwrap()
    }

    fn settled(id: &str, hash: &str) -> SubscriptionEvent {
        SubscriptionEvent::from_outcome(
            SubscriptionId::new(id),
            &RedemptionOutcome::Settled {
                transaction_hash: hash.to_string(),
            },
            dec!(100),
            due(),
        )
    }

    async fn seed(store: &RocksDbStore, id: &str) {
        store
            .upsert_subscription(Subscription::new(SubscriptionId::new(id), "c", "p", 30, due()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).expect("Failed to open RocksDB");

        for name in [CF_SUBSCRIPTIONS, CF_EVENTS, CF_TX_HASHES, CF_DELEGATIONS] {
            assert!(store.db.cf_handle(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_rocksdb_settlement_is_atomic() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).unwrap();
        seed(&store, "S1").await;
        seed(&store, "S2").await;

        let sub = store.record_settlement(settled("S1", "0xaa")).await.unwrap();
        assert_eq!(sub.redemption_count, 1);

        let err = store.record_settlement(settled("S2", "0xaa")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateTransaction(_)));

        let untouched = store.subscription(&SubscriptionId::new("S2")).await.unwrap().unwrap();
        assert_eq!(untouched.redemption_count, 0);
        assert!(store.events(&SubscriptionId::new("S2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rocksdb_prefix_scan_isolates_subscriptions() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).unwrap();
        seed(&store, "S1").await;
        seed(&store, "S10").await;

        store.record_settlement(settled("S1", "0x01")).await.unwrap();
        store.record_settlement(settled("S10", "0x02")).await.unwrap();

        let events = store.events(&SubscriptionId::new("S1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transaction_hash.as_deref(), Some("0x01"));
    }

    #[tokio::test]
    async fn test_rocksdb_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = SubscriptionId::new("S1");
        {
            let store = RocksDbStore::open(dir.path()).unwrap();
            seed(&store, "S1").await;
            store.store_delegation(&id, b"{}".to_vec()).await.unwrap();
            store.record_settlement(settled("S1", "0xaa")).await.unwrap();
        }

        let store = RocksDbStore::open(dir.path()).unwrap();
        assert_eq!(
            store.prior_settlement(&id, due()).await.unwrap(),
            Some(PriorSettlement::Recorded("0xaa".to_string()))
        );
        assert_eq!(store.delegation(&id).await.unwrap(), Some(b"{}".to_vec()));
        let sub = store.subscription(&id).await.unwrap().unwrap();
        assert_eq!(sub.total_redeemed, dec!(100));
    }
}
