//! Environment configuration for the Execution Service and the Redemption
//! Client.
//!
//! Every loader has a `from_lookup` twin taking the variable source as a
//! closure; `from_env` is `from_lookup` over the process environment.

use crate::application::settlement::SettlementSettings;
use crate::domain::address::Address;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:50061";
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 180;
const RECEIPT_TIMEOUT_BOUNDS_SECS: (u64, u64) = (60, 120);

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Simulated,
    Gateway,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    /// When set, every call must carry `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    pub backend: BackendKind,
    pub gateway_url: Option<String>,
    /// Smart wallet of the simulated backend.
    pub account_address: Option<Address>,
    pub settlement: SettlementSettings,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = lookup("REDEEMER_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("REDEEMER_BIND"))?;

        let auth_token = lookup("REDEEMER_AUTH_TOKEN").filter(|token| !token.trim().is_empty());

        let backend = match lookup("REDEEMER_BACKEND").as_deref().unwrap_or("simulated") {
            "simulated" => BackendKind::Simulated,
            "gateway" => BackendKind::Gateway,
            _ => return Err(ConfigError::Invalid("REDEEMER_BACKEND")),
        };

        let gateway_url = lookup("REDEEMER_GATEWAY_URL");
        if backend == BackendKind::Gateway && gateway_url.is_none() {
            return Err(ConfigError::Missing("REDEEMER_GATEWAY_URL"));
        }

        let account_address = lookup("REDEEMER_ACCOUNT_ADDRESS")
            .map(|raw| Address::parse(&raw).map_err(|_| ConfigError::Invalid("REDEEMER_ACCOUNT_ADDRESS")))
            .transpose()?;
        if backend == BackendKind::Simulated && account_address.is_none() {
            return Err(ConfigError::Missing("REDEEMER_ACCOUNT_ADDRESS"));
        }

        let (min, max) = RECEIPT_TIMEOUT_BOUNDS_SECS;
        let receipt_timeout_secs =
            parse_or(&lookup, "REDEEMER_RECEIPT_TIMEOUT_SECS", 90)?.clamp(min, max);
        let poll_interval_ms = parse_or(&lookup, "REDEEMER_POLL_INTERVAL_MS", 2000)?;
        let request_budget_secs = parse_or(&lookup, "REDEEMER_REQUEST_BUDGET_SECS", 170)?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("REDEEMER_POLL_INTERVAL_MS"));
        }

        Ok(Self {
            bind,
            auth_token,
            backend,
            gateway_url,
            account_address,
            settlement: SettlementSettings {
                receipt_timeout: Duration::from_secs(receipt_timeout_secs),
                deployment_timeout: Duration::from_secs(receipt_timeout_secs),
                poll_interval: Duration::from_millis(poll_interval_ms),
                request_budget: Duration::from_secs(request_budget_secs),
            },
        })
    }
}

/// How the client reaches the Execution Service. Chosen once per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Plain `http://`, no credentials. Loopback and trusted networks only.
    Local,
    /// `https://` only, bearer token on every call.
    Secure { token: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub transport: Transport,
    pub call_timeout: Duration,
}

impl ClientConfig {
    /// Picks `Secure` when a token is given and `Local` otherwise, and
    /// rejects an endpoint whose scheme does not fit the mode.
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        call_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let transport = match auth_token.filter(|token| !token.trim().is_empty()) {
            Some(token) => {
                if !endpoint.starts_with("https://") {
                    return Err(ConfigError::Invalid("REDEEMER_ENDPOINT"));
                }
                Transport::Secure { token }
            }
            None => {
                if !endpoint.starts_with("http://") {
                    return Err(ConfigError::Invalid("REDEEMER_ENDPOINT"));
                }
                Transport::Local
            }
        };

        Ok(Self {
            endpoint,
            transport,
            call_timeout,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint =
            lookup("REDEEMER_ENDPOINT").ok_or(ConfigError::Missing("REDEEMER_ENDPOINT"))?;
        let call_timeout_secs =
            parse_or(&lookup, "REDEEMER_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS)?;

        Self::new(
            endpoint,
            lookup("REDEEMER_AUTH_TOKEN"),
            Duration::from_secs(call_timeout_secs),
        )
    }
}

fn parse_or<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}
