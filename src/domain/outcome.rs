//! Terminal outcomes of a redemption attempt and the persisted event rows.

use super::job::SubscriptionId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed failure taxonomy. Exactly one applies to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Malformed, expired or mismatched delegation. Never retried.
    #[serde(rename = "fail_validation")]
    Validation,
    #[serde(rename = "fail_customer_creation")]
    CustomerCreation,
    #[serde(rename = "fail_wallet_creation")]
    WalletCreation,
    #[serde(rename = "fail_delegation_storage")]
    DelegationStorage,
    /// Settlement happened but persisting it failed. Retry the recording only.
    #[serde(rename = "fail_subscription_db")]
    SubscriptionDb,
    /// Backend failure before submission. Safe to retry.
    #[serde(rename = "fail_redemption")]
    Redemption,
    /// Failure after submission. Chain state must be checked before a retry.
    #[serde(rename = "fail_transaction")]
    Transaction,
    /// An earlier attempt already settled this charge.
    #[serde(rename = "fail_duplicate")]
    Duplicate,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::Validation,
        FailureKind::CustomerCreation,
        FailureKind::WalletCreation,
        FailureKind::DelegationStorage,
        FailureKind::SubscriptionDb,
        FailureKind::Redemption,
        FailureKind::Transaction,
        FailureKind::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "fail_validation",
            FailureKind::CustomerCreation => "fail_customer_creation",
            FailureKind::WalletCreation => "fail_wallet_creation",
            FailureKind::DelegationStorage => "fail_delegation_storage",
            FailureKind::SubscriptionDb => "fail_subscription_db",
            FailureKind::Redemption => "fail_redemption",
            FailureKind::Transaction => "fail_transaction",
            FailureKind::Duplicate => "fail_duplicate",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            FailureKind::Validation => EventType::FailValidation,
            FailureKind::CustomerCreation => EventType::FailCustomerCreation,
            FailureKind::WalletCreation => EventType::FailWalletCreation,
            FailureKind::DelegationStorage => EventType::FailDelegationStorage,
            FailureKind::SubscriptionDb => EventType::FailSubscriptionDb,
            FailureKind::Redemption => EventType::FailRedemption,
            FailureKind::Transaction => EventType::FailTransaction,
            FailureKind::Duplicate => EventType::FailDuplicate,
        }
    }

    /// Whether the Job Source may resubmit the same charge without first
    /// reconciling on-chain state.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            FailureKind::Redemption
                | FailureKind::CustomerCreation
                | FailureKind::WalletCreation
                | FailureKind::DelegationStorage
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind {s:?}"))
    }
}

/// Event types of the append-only subscription log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Redeemed,
    Renewed,
    Canceled,
    Expired,
    Upgraded,
    Downgraded,
    Paused,
    Resumed,
    Reactivated,
    Completed,
    FailValidation,
    FailCustomerCreation,
    FailWalletCreation,
    FailDelegationStorage,
    FailSubscriptionDb,
    FailRedemption,
    FailTransaction,
    FailDuplicate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Redeemed => "redeemed",
            EventType::Renewed => "renewed",
            EventType::Canceled => "canceled",
            EventType::Expired => "expired",
            EventType::Upgraded => "upgraded",
            EventType::Downgraded => "downgraded",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
            EventType::Reactivated => "reactivated",
            EventType::Completed => "completed",
            EventType::FailValidation => "fail_validation",
            EventType::FailCustomerCreation => "fail_customer_creation",
            EventType::FailWalletCreation => "fail_wallet_creation",
            EventType::FailDelegationStorage => "fail_delegation_storage",
            EventType::FailSubscriptionDb => "fail_subscription_db",
            EventType::FailRedemption => "fail_redemption",
            EventType::FailTransaction => "fail_transaction",
            EventType::FailDuplicate => "fail_duplicate",
        }
    }

    pub fn is_settlement(&self) -> bool {
        matches!(self, EventType::Redeemed | EventType::Renewed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    Settled { transaction_hash: String },
    Failed { kind: FailureKind, reason: String },
}

impl RedemptionOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Settled { .. } => None,
            Self::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// One append-only row of the subscription event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub event_type: EventType,
    /// Globally unique when present.
    pub transaction_hash: Option<String>,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl SubscriptionEvent {
    pub fn new(subscription_id: SubscriptionId, event_type: EventType, amount: Decimal) -> Self {
        Self {
            id: Uuid::now_v7(),
            subscription_id,
            event_type,
            transaction_hash: None,
            amount,
            occurred_at: Utc::now(),
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Builds the row for an attempt outcome.
    pub fn from_outcome(
        subscription_id: SubscriptionId,
        outcome: &RedemptionOutcome,
        amount: Decimal,
        due_at: DateTime<Utc>,
    ) -> Self {
        let event = match outcome {
            RedemptionOutcome::Settled { transaction_hash } => {
                let mut event = Self::new(subscription_id, EventType::Redeemed, amount);
                event.transaction_hash = Some(transaction_hash.clone());
                event
            }
            RedemptionOutcome::Failed { kind, reason } => {
                let mut event = Self::new(subscription_id, kind.event_type(), amount)
                    .with_metadata("retry_safe", serde_json::Value::Bool(kind.is_retry_safe()));
                event.error_message = Some(reason.clone());
                event
            }
        };
        event.with_metadata("due_at", serde_json::Value::String(due_at.to_rfc3339()))
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("due_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Whether this row is the successful settlement of the charge due at `due_at`.
    pub fn settles(&self, due_at: DateTime<Utc>) -> bool {
        self.event_type.is_settlement()
            && self.transaction_hash.is_some()
            && self.due_at() == Some(due_at)
    }

    /// Hash of a settlement of the charge due at `due_at` that moved value
    /// but was logged only as `fail_subscription_db`.
    pub fn unrecorded_settlement(&self, due_at: DateTime<Utc>) -> Option<&str> {
        if self.event_type != EventType::FailSubscriptionDb || self.due_at() != Some(due_at) {
            return None;
        }
        self.metadata.get("transaction_hash").and_then(|v| v.as_str())
    }
}

/// What the log already holds for one charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorSettlement {
    /// Settled and recorded.
    Recorded(String),
    /// Settled on chain; only the recording is outstanding.
    Unrecorded(String),
}

impl PriorSettlement {
    /// Scans a subscription's events for the charge due at `due_at`. A
    /// recorded settlement wins over any unrecorded one.
    pub fn find<'a, I>(events: I, due_at: DateTime<Utc>) -> Option<Self>
    where
        I: IntoIterator<Item = &'a SubscriptionEvent>,
    {
        let mut unrecorded = None;
        for event in events {
            if event.settles(due_at)
                && let Some(hash) = &event.transaction_hash
            {
                return Some(Self::Recorded(hash.clone()));
            }
            if unrecorded.is_none() {
                unrecorded = event
                    .unrecorded_settlement(due_at)
                    .map(|hash| Self::Unrecorded(hash.to_string()));
            }
        }
        unrecorded
    }

    pub fn hash(&self) -> &str {
        match self {
            Self::Recorded(hash) | Self::Unrecorded(hash) => hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_failure_kind_wire_names() {
        for kind in FailureKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<FailureKind>().unwrap(), kind);
            assert_eq!(kind.event_type().as_str(), kind.as_str());
        }
    }

    #[test]
    fn test_retry_safety() {
        assert!(FailureKind::Redemption.is_retry_safe());
        assert!(!FailureKind::Transaction.is_retry_safe());
        assert!(!FailureKind::Validation.is_retry_safe());
        assert!(!FailureKind::SubscriptionDb.is_retry_safe());
        assert!(!FailureKind::Duplicate.is_retry_safe());
    }

    #[test]
    fn test_event_from_settled_outcome() {
        let due: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let outcome = RedemptionOutcome::Settled {
            transaction_hash: "0xabc".to_string(),
        };
        let event = SubscriptionEvent::from_outcome(SubscriptionId::new("S1"), &outcome, dec!(100), due);

        assert_eq!(event.event_type, EventType::Redeemed);
        assert_eq!(event.transaction_hash.as_deref(), Some("0xabc"));
        assert!(event.error_message.is_none());
        assert!(event.settles(due));
        assert!(!event.settles(due + chrono::TimeDelta::days(30)));
    }

    #[test]
    fn test_event_from_failed_outcome() {
        let due: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let outcome = RedemptionOutcome::failed(FailureKind::Redemption, "fee lookup failed");
        let event = SubscriptionEvent::from_outcome(SubscriptionId::new("S1"), &outcome, dec!(1), due);

        assert_eq!(event.event_type, EventType::FailRedemption);
        assert!(event.transaction_hash.is_none());
        assert_eq!(event.error_message.as_deref(), Some("fee lookup failed"));
        assert!(!event.settles(due));
    }

    #[test]
    fn test_failed_rows_carry_retry_safety() {
        let due: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let outcome = RedemptionOutcome::failed(FailureKind::Transaction, "receipt timed out");
        let event = SubscriptionEvent::from_outcome(SubscriptionId::new("S1"), &outcome, dec!(1), due);
        assert_eq!(event.metadata["retry_safe"], false);
    }

    #[test]
    fn test_prior_settlement_prefers_recorded_row() {
        let due: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let id = SubscriptionId::new("S1");
        let unrecorded = SubscriptionEvent::from_outcome(
            id.clone(),
            &RedemptionOutcome::failed(FailureKind::SubscriptionDb, "store down"),
            dec!(1),
            due,
        )
        .with_metadata("transaction_hash", serde_json::Value::String("0xaa".to_string()));
        let recorded = SubscriptionEvent::from_outcome(
            id.clone(),
            &RedemptionOutcome::Settled {
                transaction_hash: "0xaa".to_string(),
            },
            dec!(1),
            due,
        );

        assert_eq!(
            PriorSettlement::find([&unrecorded], due),
            Some(PriorSettlement::Unrecorded("0xaa".to_string()))
        );
        assert_eq!(
            PriorSettlement::find([&unrecorded, &recorded], due),
            Some(PriorSettlement::Recorded("0xaa".to_string()))
        );
        assert_eq!(PriorSettlement::find([&unrecorded], due + chrono::TimeDelta::days(30)), None);

        // A storage failure before any settlement carries no hash.
        let before_dispatch = SubscriptionEvent::from_outcome(
            id,
            &RedemptionOutcome::failed(FailureKind::SubscriptionDb, "no subscription on file"),
            dec!(1),
            due,
        );
        assert_eq!(PriorSettlement::find([&before_dispatch], due), None);
    }

    #[test]
    fn test_event_type_serialization() {
        assert_eq!(
            serde_json::to_string(&EventType::FailSubscriptionDb).unwrap(),
            "\"fail_subscription_db\""
        );
        assert_eq!(serde_json::to_string(&EventType::Redeemed).unwrap(), "\"redeemed\"");
    }
}
