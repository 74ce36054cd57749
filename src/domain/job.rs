use super::address::Address;
use super::amount::{TokenAmount, parse_units};
use super::redemption::RedeemRequest;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A due charge handed to the processor by the Job Source. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionJob {
    pub subscription_id: SubscriptionId,
    pub payer_wallet: Address,
    pub merchant_address: Address,
    pub token_contract_address: Address,
    /// Base units of the token.
    pub amount: u128,
    pub decimals: i64,
    pub chain_id: u64,
    pub network_name: String,
    /// Billing date this charge settles; the idempotency key together with
    /// the subscription id.
    pub due_at: DateTime<Utc>,
}

impl RedemptionJob {
    pub fn token_amount(&self) -> Result<TokenAmount, PipelineError> {
        TokenAmount::new(self.amount, self.decimals)
            .map_err(|e| PipelineError::ValidationError(e.to_string()))
    }

    /// Builds the `Redeem` request. Delegation bytes that are not UTF-8
    /// cannot be a serialized delegation and are rejected as they stand.
    pub fn to_request(&self, delegation: Vec<u8>) -> Result<RedeemRequest, PipelineError> {
        let delegation = String::from_utf8(delegation).map_err(|e| {
            PipelineError::ValidationError(format!("delegation is not valid UTF-8: {e}"))
        })?;

        Ok(RedeemRequest {
            delegation,
            merchant_address: self.merchant_address.to_string(),
            token_contract_address: self.token_contract_address.to_string(),
            amount: self.amount,
            token_decimals: self.decimals,
            chain_id: self.chain_id,
            network_name: self.network_name.clone(),
        })
    }
}

/// Row layout of the Job Source CSV export.
#[derive(Debug, Deserialize)]
pub struct JobRecord {
    pub subscription_id: String,
    pub payer_wallet: String,
    pub merchant_address: String,
    pub token_contract_address: String,
    pub amount: String,
    pub decimals: i64,
    pub chain_id: u64,
    pub network_name: String,
    pub due_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for RedemptionJob {
    type Error = PipelineError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let address = |field: &str, value: &str| {
            Address::parse(value)
                .map_err(|e| PipelineError::ValidationError(format!("{field}: {e}")))
        };

        if record.subscription_id.trim().is_empty() {
            return Err(PipelineError::ValidationError(
                "subscription_id is empty".to_string(),
            ));
        }

        Ok(Self {
            subscription_id: SubscriptionId::new(record.subscription_id.trim()),
            payer_wallet: address("payer_wallet", &record.payer_wallet)?,
            merchant_address: address("merchant_address", &record.merchant_address)?,
            token_contract_address: address(
                "token_contract_address",
                &record.token_contract_address,
            )?,
            amount: parse_units(&record.amount)
                .map_err(|e| PipelineError::ValidationError(e.to_string()))?,
            decimals: record.decimals,
            chain_id: record.chain_id,
            network_name: record.network_name,
            due_at: record.due_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord {
            subscription_id: "S1".to_string(),
            payer_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            merchant_address: "0x4444444444444444444444444444444444444444".to_string(),
            token_contract_address: "0x5555555555555555555555555555555555555555".to_string(),
            amount: "100000000".to_string(),
            decimals: 6,
            chain_id: 11155111,
            network_name: "sepolia".to_string(),
            due_at: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_job_from_record() {
        let job = RedemptionJob::try_from(record()).unwrap();
        assert_eq!(job.subscription_id.as_str(), "S1");
        assert_eq!(job.amount, 100_000_000);
        assert_eq!(job.token_amount().unwrap().to_string(), "100");
    }

    #[test]
    fn test_job_record_rejects_bad_address() {
        let mut bad = record();
        bad.merchant_address = "merchant".to_string();
        assert!(matches!(
            RedemptionJob::try_from(bad),
            Err(PipelineError::ValidationError(msg)) if msg.starts_with("merchant_address")
        ));
    }

    #[test]
    fn test_job_record_rejects_fractional_amount() {
        let mut bad = record();
        bad.amount = "1.5".to_string();
        assert!(RedemptionJob::try_from(bad).is_err());
    }

    #[test]
    fn test_request_carries_job_fields() {
        let job = RedemptionJob::try_from(record()).unwrap();
        let request = job.to_request(b"{\"delegate\":\"0x\"}".to_vec()).unwrap();
        assert_eq!(request.amount, 100_000_000);
        assert_eq!(request.token_decimals, 6);
        assert_eq!(request.chain_id, 11155111);
        assert_eq!(request.delegation, "{\"delegate\":\"0x\"}");
        assert_eq!(
            request.merchant_address,
            "0x4444444444444444444444444444444444444444"
        );
    }

    #[test]
    fn test_request_rejects_corrupted_delegation_bytes() {
        let job = RedemptionJob::try_from(record()).unwrap();
        let mut bytes = b"{\"salt\":\"1\"}".to_vec();
        bytes[9] = 0xff;

        assert!(matches!(
            job.to_request(bytes),
            Err(PipelineError::ValidationError(msg)) if msg.contains("UTF-8")
        ));
    }
}
