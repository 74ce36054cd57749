//! Request and reply of the `Redeem` RPC.
//!
//! Fields are emitted in snake_case and accepted in either snake_case or
//! camelCase so that clients generated with either convention interoperate.

use super::amount::deserialize_units;
use super::outcome::{FailureKind, RedemptionOutcome};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    /// Serialized delegation as stored at subscribe time.
    pub delegation: String,
    #[serde(alias = "merchantAddress")]
    pub merchant_address: String,
    #[serde(alias = "tokenContractAddress")]
    pub token_contract_address: String,
    #[serde(
        deserialize_with = "deserialize_units",
        serialize_with = "serialize_units"
    )]
    pub amount: u128,
    #[serde(alias = "tokenDecimals")]
    pub token_decimals: i64,
    #[serde(alias = "chainId")]
    pub chain_id: u64,
    #[serde(default, alias = "networkName")]
    pub network_name: String,
}

fn serialize_units<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match u64::try_from(*value) {
        Ok(small) => serializer.serialize_u64(small),
        Err(_) => serializer.serialize_str(&value.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemReply {
    #[serde(default, alias = "transactionHash")]
    pub transaction_hash: String,
    pub success: bool,
    #[serde(default, alias = "errorMessage")]
    pub error_message: String,
    #[serde(default, alias = "failureKind", skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl RedeemReply {
    pub fn settled(transaction_hash: impl Into<String>) -> Self {
        Self {
            transaction_hash: transaction_hash.into(),
            success: true,
            error_message: String::new(),
            failure_kind: None,
        }
    }

    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            transaction_hash: String::new(),
            success: false,
            error_message: reason.into(),
            failure_kind: Some(kind),
        }
    }

    /// Interprets the reply. A failure without a kind, or a success without a
    /// hash, leaves chain state unknown and is classified as `fail_transaction`.
    pub fn into_outcome(self) -> RedemptionOutcome {
        match (self.success, self.transaction_hash.trim().is_empty()) {
            (true, false) => RedemptionOutcome::Settled {
                transaction_hash: self.transaction_hash,
            },
            (true, true) => RedemptionOutcome::failed(
                FailureKind::Transaction,
                "service reported success without a transaction hash",
            ),
            (false, _) => RedemptionOutcome::failed(
                self.failure_kind.unwrap_or(FailureKind::Transaction),
                if self.error_message.is_empty() {
                    "redemption failed without a reason".to_string()
                } else {
                    self.error_message
                },
            ),
        }
    }
}
