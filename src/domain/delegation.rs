//! Signed delegations as stored at subscribe time.
//!
//! A delegation is parsed from raw bytes and validated in one pure step so
//! that malformed or expired authorizations are rejected before any chain
//! interaction.

use super::address::{Address, is_hex_data};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DelegationError {
    #[error("malformed delegation: {0}")]
    Malformed(String),
    #[error("delegation is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("delegation field `{field}` is not a valid address: {value:?}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("delegation field `{0}` is not valid hex data")]
    InvalidHex(&'static str),
    #[error("delegation expired at {0}")]
    Expired(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub scheme: String,
    pub signature: String,
    pub signer: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    pub enforcer: Address,
    pub terms: String,
    #[serde(default = "empty_hex")]
    pub args: String,
}

fn empty_hex() -> String {
    "0x".to_string()
}

/// A validated, immutable delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegator: Address,
    pub delegate: Address,
    pub authority: Authority,
    pub caveats: Vec<Caveat>,
    pub salt: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawAuthority {
    scheme: Option<String>,
    signature: Option<String>,
    signer: Option<String>,
}

#[derive(Deserialize)]
struct RawDelegation {
    delegator: Option<String>,
    delegate: Option<String>,
    authority: Option<RawAuthority>,
    #[serde(default)]
    caveats: Vec<Caveat>,
    #[serde(default)]
    salt: Option<serde_json::Value>,
    signature: Option<String>,
    #[serde(default, alias = "expires_at", alias = "expiresAt")]
    expiry: Option<i64>,
}

impl Delegation {
    /// Parses and validates a serialized delegation against the clock `now`.
    pub fn parse(bytes: &[u8], now: DateTime<Utc>) -> Result<Self, DelegationError> {
        let raw: RawDelegation = serde_json::from_slice(bytes)
            .map_err(|e| DelegationError::Malformed(e.to_string()))?;

        let delegator = required_address("delegator", raw.delegator)?;
        let delegate = required_address("delegate", raw.delegate)?;

        let raw_authority = raw.authority.ok_or(DelegationError::MissingField("authority"))?;
        let authority = Authority {
            scheme: non_empty("authority.scheme", raw_authority.scheme)?,
            signature: required_hex("authority.signature", raw_authority.signature)?,
            signer: required_address("authority.signer", raw_authority.signer)?,
        };

        let signature = required_hex("signature", raw.signature)?;

        let salt = match raw.salt {
            None | Some(serde_json::Value::Null) => "0".to_string(),
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(DelegationError::Malformed(format!(
                    "salt must be a string or number, got {other}"
                )));
            }
        };

        let expiry = match raw.expiry {
            None | Some(0) => None,
            Some(seconds) => Some(DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(
                || DelegationError::Malformed(format!("expiry {seconds} is out of range")),
            )?),
        };

        if let Some(expiry) = expiry
            && expiry <= now
        {
            return Err(DelegationError::Expired(expiry));
        }

        Ok(Self {
            delegator,
            delegate,
            authority,
            caveats: raw.caveats,
            salt,
            signature,
            expiry,
        })
    }
}

fn non_empty(field: &'static str, value: Option<String>) -> Result<String, DelegationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(DelegationError::MissingField(field))
}

fn required_address(field: &'static str, value: Option<String>) -> Result<Address, DelegationError> {
    let value = non_empty(field, value)?;
    Address::parse(&value).map_err(|_| DelegationError::InvalidAddress { field, value })
}

fn required_hex(field: &'static str, value: Option<String>) -> Result<String, DelegationError> {
    let value = non_empty(field, value)?;
    if is_hex_data(&value) && value.len() > 2 {
        Ok(value)
    } else {
        Err(DelegationError::InvalidHex(field))
    }
}
