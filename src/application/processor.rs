//! Bounded worker pool that dispatches due charges to the Execution Service.
//!
//! Jobs enter a fixed-capacity queue and are pulled by `workers` tasks. A
//! subscription is marked in flight from submission until its outcome is
//! recorded, so the same subscription is never redeemed twice concurrently.
//! Every accepted job ends in exactly one recorded event.

use crate::domain::job::{RedemptionJob, SubscriptionId};
use crate::domain::outcome::{FailureKind, PriorSettlement, RedemptionOutcome, SubscriptionEvent};
use crate::domain::ports::{DelegationStoreRef, EventRecorderRef, RedeemerRef};
use crate::error::{PipelineError, Result, SubmitError, TransportError};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Client-side bound on a single `Redeem` call.
    pub call_timeout: Duration,
    /// How long `stop` waits for in-flight attempts before cancelling them.
    pub shutdown_grace: Duration,
    pub record_attempts: u32,
    pub record_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 100,
            call_timeout: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(30),
            record_attempts: 3,
            record_backoff: Duration::from_millis(200),
        }
    }
}

/// Point-in-time view of the processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub rejected_busy: u64,
    pub rejected_in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates: u64,
    /// Outcomes that could not be written even after retries.
    pub unrecorded: u64,
    pub peak_concurrent_calls: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected_busy: AtomicU64,
    rejected_in_flight: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    unrecorded: AtomicU64,
    active_calls: AtomicUsize,
    peak_calls: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            rejected_in_flight: self.rejected_in_flight.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unrecorded: self.unrecorded.load(Ordering::Relaxed),
            peak_concurrent_calls: self.peak_calls.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one outstanding RPC call for the concurrency gauge.
struct CallGuard<'a>(&'a Counters);

impl<'a> CallGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let active = counters.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_calls.fetch_max(active, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a worker learned before recording.
enum Resolution {
    Outcome(RedemptionOutcome),
    /// An earlier attempt already settled this charge with the given hash.
    AlreadySettled(String),
    /// The subscription may not be charged in its current state.
    NotChargeable(String),
}

struct Shared {
    redeemer: RedeemerRef,
    recorder: EventRecorderRef,
    delegations: DelegationStoreRef,
    config: ProcessorConfig,
    in_flight: Mutex<HashSet<SubscriptionId>>,
    counters: Counters,
    /// Cancelled once the shutdown grace elapses.
    deadline: CancellationToken,
}

pub struct RedemptionProcessor {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<RedemptionJob>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<RedemptionJob>>>,
    workers: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

impl RedemptionProcessor {
    pub fn new(
        redeemer: RedeemerRef,
        recorder: EventRecorderRef,
        delegations: DelegationStoreRef,
        config: ProcessorConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                redeemer,
                recorder,
                delegations,
                config,
                in_flight: Mutex::new(HashSet::new()),
                counters: Counters::default(),
                deadline: CancellationToken::new(),
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(AsyncMutex::new(receiver)),
            workers: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker tasks. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.shared.config.workers.max(1);
        info!(
            workers,
            queue_capacity = self.shared.config.queue_capacity,
            "starting redemption processor"
        );
        let mut set = lock(&self.workers);
        for worker in 0..workers {
            set.spawn(worker_loop(
                worker,
                Arc::clone(&self.shared),
                Arc::clone(&self.receiver),
            ));
        }
    }

    /// Enqueues without waiting. A full queue returns `Busy` with the job.
    pub fn try_submit(&self, job: RedemptionJob) -> std::result::Result<(), SubmitError> {
        let sender = self.sender()?;
        self.shared.claim(&job.subscription_id)?;

        match sender.try_send(job) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.shared.release(&job.subscription_id);
                self.shared
                    .counters
                    .rejected_busy
                    .fetch_add(1, Ordering::Relaxed);
                debug!(subscription_id = %job.subscription_id, "queue full; rejecting job");
                Err(SubmitError::Busy(Box::new(job)))
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.shared.release(&job.subscription_id);
                Err(SubmitError::Stopped)
            }
        }
    }

    /// Enqueues, waiting for room when the queue is full.
    pub async fn submit(&self, job: RedemptionJob) -> std::result::Result<(), SubmitError> {
        let sender = self.sender()?;
        self.shared.claim(&job.subscription_id)?;

        let subscription_id = job.subscription_id.clone();
        match sender.send(job).await {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.shared.release(&subscription_id);
                Err(SubmitError::Stopped)
            }
        }
    }

    /// Stops accepting jobs and drains the queue.
    ///
    /// In-flight attempts get `shutdown_grace` to finish. After that their
    /// calls are cancelled and recorded as `fail_transaction`, and jobs still
    /// queued are recorded as `fail_redemption` without being dispatched.
    pub async fn stop(&self) -> ProcessorStats {
        drop(lock(&self.sender).take());

        if !self.started.load(Ordering::SeqCst) {
            // Nobody will dispatch what is queued; record it instead.
            self.shared.deadline.cancel();
            self.start();
        }

        let mut workers = std::mem::take(&mut *lock(&self.workers));
        let grace = self.shared.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, join_all(&mut workers)).await;
        if drained.is_err() {
            warn!(?grace, "shutdown grace elapsed; cancelling in-flight redemptions");
            self.shared.deadline.cancel();
            join_all(&mut workers).await;
        }

        let stats = self.stats();
        info!(?stats, "redemption processor stopped");
        stats
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared.counters.snapshot()
    }

    pub fn is_in_flight(&self, subscription_id: &SubscriptionId) -> bool {
        self.shared.is_in_flight(subscription_id)
    }

    fn sender(&self) -> std::result::Result<mpsc::Sender<RedemptionJob>, SubmitError> {
        lock(&self.sender).clone().ok_or(SubmitError::Stopped)
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "worker task ended abnormally");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<RedemptionJob>>>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker, "queue closed; worker exiting");
            break;
        };

        let subscription_id = job.subscription_id.clone();
        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            let job = job.clone();
            async move { shared.process(worker, job).await }
        });

        if let Err(e) = task.await {
            error!(worker, subscription_id = %subscription_id, error = %e, "redemption attempt panicked");
            if shared.is_in_flight(&subscription_id) {
                let outcome =
                    RedemptionOutcome::failed(FailureKind::Transaction, format!("worker panicked: {e}"));
                shared.finish(&job, Resolution::Outcome(outcome)).await;
                shared.release(&subscription_id);
            }
        }
    }
}

impl Shared {
    fn claim(&self, subscription_id: &SubscriptionId) -> std::result::Result<(), SubmitError> {
        if lock(&self.in_flight).insert(subscription_id.clone()) {
            Ok(())
        } else {
            self.counters
                .rejected_in_flight
                .fetch_add(1, Ordering::Relaxed);
            Err(SubmitError::AlreadyInFlight(subscription_id.clone()))
        }
    }

    fn release(&self, subscription_id: &SubscriptionId) {
        lock(&self.in_flight).remove(subscription_id);
    }

    fn is_in_flight(&self, subscription_id: &SubscriptionId) -> bool {
        lock(&self.in_flight).contains(subscription_id)
    }

    #[instrument(skip(self, job), fields(subscription_id = %job.subscription_id, due_at = %job.due_at))]
    async fn process(&self, worker: usize, job: RedemptionJob) {
        let resolution = self.attempt(&job).await;
        self.finish(&job, resolution).await;
        self.release(&job.subscription_id);
    }

    async fn attempt(&self, job: &RedemptionJob) -> Resolution {
        if self.deadline.is_cancelled() {
            return Resolution::Outcome(RedemptionOutcome::failed(
                FailureKind::Redemption,
                "processor stopped before dispatch",
            ));
        }

        match self.recorder.prior_settlement(&job.subscription_id, job.due_at).await {
            Ok(Some(PriorSettlement::Recorded(hash))) => return Resolution::AlreadySettled(hash),
            Ok(Some(PriorSettlement::Unrecorded(hash))) => {
                // Value already moved; only the recording is owed.
                info!(tx_hash = %hash, "recording an earlier unrecorded settlement");
                return Resolution::Outcome(RedemptionOutcome::Settled {
                    transaction_hash: hash,
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Resolution::Outcome(RedemptionOutcome::failed(
                    FailureKind::SubscriptionDb,
                    format!("checking for an earlier settlement: {e}"),
                ));
            }
        }

        match self.recorder.subscription(&job.subscription_id).await {
            Ok(Some(subscription)) => {
                if let Some(reason) = subscription.charge_blocker() {
                    return Resolution::NotChargeable(reason);
                }
            }
            Ok(None) => {
                return Resolution::Outcome(RedemptionOutcome::failed(
                    FailureKind::SubscriptionDb,
                    "no subscription on file",
                ));
            }
            Err(e) => {
                return Resolution::Outcome(RedemptionOutcome::failed(
                    FailureKind::SubscriptionDb,
                    format!("loading subscription: {e}"),
                ));
            }
        }

        let delegation = match self.delegations.delegation(&job.subscription_id).await {
            Ok(Some(delegation)) => delegation,
            Ok(None) => {
                return Resolution::Outcome(RedemptionOutcome::failed(
                    FailureKind::DelegationStorage,
                    "no delegation on file for subscription",
                ));
            }
            Err(e) => {
                return Resolution::Outcome(RedemptionOutcome::failed(
                    FailureKind::DelegationStorage,
                    format!("loading delegation: {e}"),
                ));
            }
        };

        Resolution::Outcome(self.dispatch(job, delegation).await)
    }

    async fn dispatch(&self, job: &RedemptionJob, delegation: Vec<u8>) -> RedemptionOutcome {
        let request = match job.to_request(delegation) {
            Ok(request) => request,
            Err(e) => return RedemptionOutcome::failed(FailureKind::Validation, e.to_string()),
        };
        let timeout = self.config.call_timeout;
        let _call = CallGuard::enter(&self.counters);
        debug!(chain_id = job.chain_id, "dispatching redemption");

        tokio::select! {
            result = tokio::time::timeout(timeout, self.redeemer.redeem(request)) => match result {
                Ok(Ok(reply)) => reply.into_outcome(),
                Ok(Err(e)) if e.request_not_processed() => {
                    RedemptionOutcome::failed(FailureKind::Redemption, e.to_string())
                }
                Ok(Err(e)) => RedemptionOutcome::failed(FailureKind::Transaction, e.to_string()),
                Err(_) => RedemptionOutcome::failed(
                    FailureKind::Transaction,
                    TransportError::Timeout(timeout).to_string(),
                ),
            },
            _ = self.deadline.cancelled() => RedemptionOutcome::failed(
                FailureKind::Transaction,
                "shutdown deadline elapsed before the redemption call returned",
            ),
        }
    }

    async fn finish(&self, job: &RedemptionJob, resolution: Resolution) {
        let amount = event_amount(job);

        match resolution {
            Resolution::AlreadySettled(hash) => {
                info!(subscription_id = %job.subscription_id, tx_hash = %hash, "charge already settled; skipping");
                self.record_duplicate(job, amount, hash).await;
            }
            Resolution::NotChargeable(reason) => {
                info!(subscription_id = %job.subscription_id, reason = %reason, "charge not dispatched");
                let outcome = RedemptionOutcome::failed(
                    FailureKind::Validation,
                    format!("{reason}; charge not dispatched"),
                );
                let event = SubscriptionEvent::from_outcome(job.subscription_id.clone(), &outcome, amount, job.due_at);
                // The row already carries its terminal status; leave it as is.
                if self.record_event(event).await {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Resolution::Outcome(outcome) if outcome.is_settled() => {
                self.record_settlement(job, amount, outcome).await;
            }
            Resolution::Outcome(outcome) => {
                self.record_failure(job, amount, outcome).await;
            }
        }
    }

    async fn record_settlement(&self, job: &RedemptionJob, amount: Decimal, outcome: RedemptionOutcome) {
        let RedemptionOutcome::Settled { transaction_hash } = &outcome else {
            return;
        };
        let event = SubscriptionEvent::from_outcome(job.subscription_id.clone(), &outcome, amount, job.due_at);

        let result = self
            .with_retry("recording settlement", || {
                self.recorder.record_settlement(event.clone())
            })
            .await;

        match result {
            Ok(subscription) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    subscription_id = %job.subscription_id,
                    tx_hash = %transaction_hash,
                    next_redemption = %subscription.next_redemption_date,
                    "redemption settled"
                );
            }
            Err(PipelineError::DuplicateTransaction(hash)) => {
                warn!(subscription_id = %job.subscription_id, tx_hash = %hash, "transaction hash already on record");
                self.record_duplicate(job, amount, hash).await;
            }
            Err(e) => {
                // Value moved but the ledger does not show it. Keep the hash
                // so the recording can be repaired without touching the chain.
                error!(
                    subscription_id = %job.subscription_id,
                    tx_hash = %transaction_hash,
                    error = %e,
                    "settled but could not record"
                );
                let outcome = RedemptionOutcome::failed(
                    FailureKind::SubscriptionDb,
                    format!("recording settlement: {e}"),
                );
                let event =
                    SubscriptionEvent::from_outcome(job.subscription_id.clone(), &outcome, amount, job.due_at)
                        .with_metadata(
                            "transaction_hash",
                            serde_json::Value::String(transaction_hash.clone()),
                        );
                if self.record_event(event).await {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn record_failure(&self, job: &RedemptionJob, amount: Decimal, outcome: RedemptionOutcome) {
        let Some(kind) = outcome.failure_kind() else {
            return;
        };
        warn!(
            subscription_id = %job.subscription_id,
            kind = %kind,
            retry_safe = kind.is_retry_safe(),
            "redemption failed"
        );

        let event = SubscriptionEvent::from_outcome(job.subscription_id.clone(), &outcome, amount, job.due_at);
        if !self.record_event(event).await {
            return;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        if matches!(kind, FailureKind::Validation | FailureKind::Transaction)
            && let Err(e) = self.recorder.mark_failed(&job.subscription_id, kind).await
        {
            warn!(subscription_id = %job.subscription_id, error = %e, "could not update subscription status");
        }
    }

    async fn record_duplicate(&self, job: &RedemptionJob, amount: Decimal, existing_hash: String) {
        let outcome = RedemptionOutcome::failed(
            FailureKind::Duplicate,
            format!("charge due {} already settled", job.due_at.to_rfc3339()),
        );
        let event = SubscriptionEvent::from_outcome(job.subscription_id.clone(), &outcome, amount, job.due_at)
            .with_metadata("existing_transaction_hash", serde_json::Value::String(existing_hash));
        if self.record_event(event).await {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Appends with retries; counts the event as unrecorded when all fail.
    async fn record_event(&self, event: SubscriptionEvent) -> bool {
        let subscription_id = event.subscription_id.clone();
        let event_type = event.event_type;
        match self
            .with_retry("recording outcome", || self.recorder.record(event.clone()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.counters.unrecorded.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscription_id = %subscription_id,
                    event_type = %event_type,
                    error = %e,
                    "outcome could not be recorded"
                );
                false
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, action: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.record_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %e, "{action} failed; retrying");
                    tokio::time::sleep(self.config.record_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Human amount for the event row; zero when the job's amount is invalid or
/// beyond what a `Decimal` can hold.
fn event_amount(job: &RedemptionJob) -> Decimal {
    job.token_amount()
        .ok()
        .and_then(|amount| amount.to_decimal())
        .unwrap_or(Decimal::ZERO)
}
