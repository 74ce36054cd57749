use super::job::{RedemptionJob, SubscriptionId};
use super::outcome::FailureKind;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Paused,
    Canceled,
    Suspended,
    Failed,
    Completed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Failed => "failed",
            SubscriptionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing state of a subscription as far as the redemption pipeline sees it.
///
/// Advanced after every successful settlement; status moves to `Suspended` or
/// `Failed` after terminal failures. Rows are soft-deleted only.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub customer_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub interval_days: u32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_redemption_date: DateTime<Utc>,
    pub redemption_count: u32,
    pub max_redemptions: Option<u32>,
    pub total_redeemed: Decimal,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        customer_id: impl Into<String>,
        price_id: impl Into<String>,
        interval_days: u32,
        first_due: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            customer_id: customer_id.into(),
            price_id: price_id.into(),
            status: SubscriptionStatus::Active,
            interval_days,
            current_period_start: first_due - TimeDelta::days(i64::from(interval_days)),
            current_period_end: first_due,
            next_redemption_date: first_due,
            redemption_count: 0,
            max_redemptions: None,
            total_redeemed: Decimal::ZERO,
            deleted_at: None,
        }
    }

    /// Seeds a subscription for a job that arrived without one on file.
    pub fn for_job(job: &RedemptionJob, interval_days: u32) -> Self {
        Self::new(
            job.subscription_id.clone(),
            job.payer_wallet.to_string(),
            job.token_contract_address.to_string(),
            interval_days,
            job.due_at,
        )
    }

    /// Rolls the billing period forward after a successful settlement.
    pub fn advance(&mut self, amount: Decimal) {
        let interval = TimeDelta::days(i64::from(self.interval_days));
        self.current_period_start = self.current_period_end;
        self.current_period_end = self.current_period_end + interval;
        self.next_redemption_date = self.current_period_end;
        self.redemption_count += 1;
        self.total_redeemed += amount;

        if let Some(max) = self.max_redemptions
            && self.redemption_count >= max
        {
            self.status = SubscriptionStatus::Completed;
        } else if self.status == SubscriptionStatus::Trial {
            self.status = SubscriptionStatus::Active;
        }
    }

    /// Applies the status effect of a terminal failure.
    pub fn apply_failure(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Validation => self.status = SubscriptionStatus::Suspended,
            FailureKind::Transaction => self.status = SubscriptionStatus::Failed,
            _ => {}
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Why this subscription may not be charged now, if anything.
    ///
    /// Only live `trial` and `active` rows are billed. `suspended` and
    /// `failed` rows wait for an operator; the rest have ended.
    pub fn charge_blocker(&self) -> Option<String> {
        if self.is_deleted() {
            return Some("subscription is deleted".to_string());
        }
        match self.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => None,
            status => Some(format!("subscription is {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn subscription() -> Subscription {
        Subscription::new(
            SubscriptionId::new("S1"),
            "cus_1",
            "price_1",
            30,
            "2026-01-31T00:00:00Z".parse().unwrap(),
        )
    }

    #[test]
    fn test_advance_rolls_period() {
        let mut sub = subscription();
        let due = sub.next_redemption_date;

        sub.advance(dec!(100));

        assert_eq!(sub.current_period_start, due);
        assert_eq!(sub.next_redemption_date, due + TimeDelta::days(30));
        assert_eq!(sub.redemption_count, 1);
        assert_eq!(sub.total_redeemed, dec!(100));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_advance_completes_at_max_redemptions() {
        let mut sub = subscription();
        sub.max_redemptions = Some(2);
        sub.advance(dec!(1));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        sub.advance(dec!(1));
        assert_eq!(sub.status, SubscriptionStatus::Completed);
    }

    #[test]
    fn test_trial_becomes_active_after_first_charge() {
        let mut sub = subscription();
        sub.status = SubscriptionStatus::Trial;
        sub.advance(dec!(5));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_charge_blockers() {
        let mut sub = subscription();
        assert!(sub.charge_blocker().is_none());

        sub.status = SubscriptionStatus::Trial;
        assert!(sub.charge_blocker().is_none());

        for status in [
            SubscriptionStatus::Paused,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Failed,
            SubscriptionStatus::Completed,
        ] {
            sub.status = status;
            assert_eq!(sub.charge_blocker(), Some(format!("subscription is {status}")));
        }

        let mut deleted = subscription();
        deleted.deleted_at = Some("2026-01-15T00:00:00Z".parse().unwrap());
        assert!(deleted.is_deleted());
        assert!(deleted.charge_blocker().unwrap().contains("deleted"));
    }

    #[test]
    fn test_failure_effects() {
        let mut sub = subscription();
        sub.apply_failure(FailureKind::Redemption);
        assert_eq!(sub.status, SubscriptionStatus::Active);

        sub.apply_failure(FailureKind::Validation);
        assert_eq!(sub.status, SubscriptionStatus::Suspended);

        let mut sub = subscription();
        sub.apply_failure(FailureKind::Transaction);
        assert_eq!(sub.status, SubscriptionStatus::Failed);
    }
}
