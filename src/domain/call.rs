//! On-chain call and operation types shared by the settlement state machine
//! and the execution backends.

use super::address::Address;
use super::amount::TokenAmount;
use serde::{Deserialize, Serialize};

/// `transfer(address,uint256)`
pub const ERC20_TRANSFER_SELECTOR: &str = "a9059cbb";

/// A single contract call executed by a smart wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub to: Address,
    #[serde(with = "quantity")]
    pub value: u128,
    pub data: String,
}

impl Call {
    /// Zero-value self-call used only to get the wallet deployed.
    pub fn bootstrap(account: &Address) -> Self {
        Self {
            to: account.clone(),
            value: 0,
            data: "0x".to_string(),
        }
    }

    /// ERC-20 transfer of `amount` base units to `recipient`.
    pub fn erc20_transfer(token: &Address, recipient: &Address, amount: &TokenAmount) -> Self {
        Self {
            to: token.clone(),
            value: 0,
            data: format!(
                "0x{}{}{}",
                ERC20_TRANSFER_SELECTOR,
                recipient.to_word(),
                amount.to_word()
            ),
        }
    }

    pub fn is_bootstrap_for(&self, account: &Address) -> bool {
        &self.to == account && self.value == 0 && self.data == "0x"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeParameters {
    #[serde(with = "quantity")]
    pub max_fee_per_gas: u128,
    #[serde(with = "quantity")]
    pub max_priority_fee_per_gas: u128,
}

/// A batched operation submitted on behalf of a smart wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub calls: Vec<Call>,
    #[serde(flatten)]
    pub fees: FeeParameters,
}

impl UserOperation {
    pub fn is_bootstrap(&self) -> bool {
        self.calls.len() == 1 && self.calls[0].is_bootstrap_for(&self.sender)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReceipt {
    pub transaction_hash: String,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Hex quantity encoding (`0x1a`) used on JSON-RPC wires.
pub mod quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Option<u128> {
        let digits = value.strip_prefix("0x")?;
        if digits.is_empty() {
            return Some(0);
        }
        u128::from_str_radix(digits, 16).ok()
    }

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid quantity {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(last: &str) -> Address {
        Address::parse(&format!("0x{:0>40}", last)).unwrap()
    }

    #[test]
    fn test_erc20_transfer_encoding() {
        let token = address("aa");
        let merchant = address("bb");
        let amount = TokenAmount::new(500_000, 6).unwrap();

        let call = Call::erc20_transfer(&token, &merchant, &amount);

        assert_eq!(call.to, token);
        assert_eq!(call.value, 0);
        // selector + two words
        assert_eq!(call.data.len(), 2 + 8 + 64 + 64);
        assert!(call.data.starts_with("0xa9059cbb"));
        assert!(call.data.ends_with("7a120")); // 500000
        assert_eq!(&call.data[10..74], merchant.to_word());
    }

    #[test]
    fn test_bootstrap_detection() {
        let account = address("01");
        let op = UserOperation {
            sender: account.clone(),
            calls: vec![Call::bootstrap(&account)],
            fees: FeeParameters {
                max_fee_per_gas: 1,
                max_priority_fee_per_gas: 1,
            },
        };
        assert!(op.is_bootstrap());

        let transfer = Call::erc20_transfer(
            &address("aa"),
            &address("bb"),
            &TokenAmount::new(1, 6).unwrap(),
        );
        let op = UserOperation {
            calls: vec![transfer],
            ..op
        };
        assert!(!op.is_bootstrap());
    }

    #[test]
    fn test_quantity_wire_format() {
        let fees = FeeParameters {
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_500_000_000,
        };
        let json = serde_json::to_value(fees).unwrap();
        assert_eq!(json["maxFeePerGas"], "0x6fc23ac00");
        assert_eq!(json["maxPriorityFeePerGas"], "0x59682f00");

        let back: FeeParameters = serde_json::from_value(json).unwrap();
        assert_eq!(back, fees);
        assert_eq!(quantity::parse("0x"), Some(0));
        assert_eq!(quantity::parse("12"), None);
    }
}
