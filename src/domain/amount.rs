use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::fmt;
use thiserror::Error;

/// Largest scale a `Decimal` can carry.
pub const MAX_DECIMALS: u32 = 28;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("token decimals must be positive, got {0}")]
    NonPositiveDecimals(i64),
    #[error("token decimals {0} exceed the supported maximum of 28")]
    TooManyDecimals(i64),
    #[error("amount must be positive")]
    Zero,
    #[error("amount {0:?} is not an unsigned integer")]
    NotAnInteger(String),
}

/// A token quantity held as integer base units plus the token's decimals.
///
/// Arithmetic never goes through floating point: the human-readable figure is
/// derived from the integer with an explicit scale. Any `u128` is a valid
/// quantity; only the `Decimal` view is range-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAmount {
    units: u128,
    decimals: u32,
}

impl TokenAmount {
    pub fn new(units: u128, decimals: i64) -> Result<Self, AmountError> {
        if decimals <= 0 {
            return Err(AmountError::NonPositiveDecimals(decimals));
        }
        if decimals > i64::from(MAX_DECIMALS) {
            return Err(AmountError::TooManyDecimals(decimals));
        }
        if units == 0 {
            return Err(AmountError::Zero);
        }

        Ok(Self {
            units,
            decimals: decimals as u32,
        })
    }

    pub fn units(&self) -> u128 {
        self.units
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// The amount in whole tokens, e.g. `500000` at 6 decimals is `0.5`.
    ///
    /// `None` when the units exceed `Decimal`'s 96-bit mantissa.
    pub fn to_decimal(&self) -> Option<Decimal> {
        let signed = i128::try_from(self.units).ok()?;
        Decimal::try_from_i128_with_scale(signed, self.decimals)
            .ok()
            .map(|d| d.normalize())
    }

    /// The base units as a 32-byte ABI word, without prefix.
    pub fn to_word(&self) -> String {
        format!("{:064x}", self.units)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 10^28 fits in a u128, so the split is exact for every amount.
        let scale = 10u128.pow(self.decimals);
        let whole = self.units / scale;
        let fraction = self.units % scale;
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{fraction:0width$}", width = self.decimals as usize);
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

/// Parses base units from their decimal string form.
pub fn parse_units(value: &str) -> Result<u128, AmountError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::NotAnInteger(value.to_string()));
    }
    trimmed
        .parse::<u128>()
        .map_err(|_| AmountError::NotAnInteger(value.to_string()))
}

/// Accepts base units as either a JSON number or a decimal string, since
/// 18-decimal amounts routinely exceed the range of a JSON number.
pub fn deserialize_units<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Units {
        Number(u64),
        Text(String),
    }

    match Units::deserialize(deserializer)? {
        Units::Number(n) => Ok(u128::from(n)),
        Units::Text(s) => parse_units(&s).map_err(serde::de::Error::custom),
    }
}
