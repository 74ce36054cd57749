//! Redemption Client: the dispatcher side of the `Redeem` RPC.

use super::server::REDEEM_PATH;
use crate::config::{ClientConfig, Transport};
use crate::domain::ports::Redeemer;
use crate::domain::redemption::{RedeemReply, RedeemRequest};
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RedemptionClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    call_timeout: Duration,
}

impl RedemptionClient {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let secure = matches!(config.transport, Transport::Secure { .. });
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .connect_timeout(config.call_timeout.min(Duration::from_secs(10)))
            .https_only(secure)
            .build()
            .map_err(|e| TransportError::Connect(format!("building HTTP client: {e}")))?;

        let token = match &config.transport {
            Transport::Secure { token } => Some(token.clone()),
            Transport::Local => None,
        };

        Ok(Self {
            http,
            url: format!("{}{}", config.endpoint, REDEEM_PATH),
            token,
            call_timeout: config.call_timeout,
        })
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.call_timeout)
        } else if error.is_connect() || error.is_builder() {
            TransportError::Connect(error.to_string())
        } else if error.is_decode() {
            TransportError::Protocol(error.to_string())
        } else {
            TransportError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl Redeemer for RedemptionClient {
    async fn redeem(&self, request: RedeemRequest) -> Result<RedeemReply, TransportError> {
        let mut call = self.http.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }

        let response = call.send().await.map_err(|e| {
            warn!(
                error = %e,
                is_connect = e.is_connect(),
                is_timeout = e.is_timeout(),
                "redeem call failed"
            );
            self.classify(e)
        })?;

        let status = response.status();
        debug!(status = status.as_u16(), "redeem call answered");
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            return Err(TransportError::Transport(format!("HTTP {status}")));
        }

        response.json::<RedeemReply>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.call_timeout)
            } else {
                TransportError::Protocol(e.to_string())
            }
        })
    }
}
