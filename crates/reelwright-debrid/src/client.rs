// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::{classify, DebridError, Result};
use crate::models::{ApiErrorBody, UnrestrictedLink};
use crate::throttle::Throttle;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, trace};

const DEBRID_API_BASE: &str = "https://api.real-debrid.com/rest/1.0";
const USER_AGENT: &str = concat!("reelwright/", env!("CARGO_PKG_VERSION"));

/// Rate-limited client for the link resolution service.
#[derive(Debug, Clone)]
pub struct DebridClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    throttle: Throttle,
}

impl DebridClient {
    pub fn builder() -> DebridClientBuilder {
        DebridClientBuilder::default()
    }

    /// Exchange a hoster link for a direct download URL.
    ///
    /// Every call yields a fresh URL; callers should not persist it since
    /// the service expires them after a while.
    pub async fn unrestrict_link(&self, link: &str) -> Result<UnrestrictedLink> {
        let token = self.api_token.as_deref().ok_or(DebridError::MissingToken)?;
        self.throttle.wait_turn().await;

        let url = format!("{}/unrestrict/link", self.base_url.trim_end_matches('/'));
        trace!(target: "resolver", %url, "POST");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .form(&[("link", link)])
            .send()
            .await?;

        let status = response.status();
        debug!(target: "resolver", %status, "unrestrict response");

        let body = response.text().await?;
        if !status.is_success() {
            let err = error_from_body(status, &body);
            if matches!(err, DebridError::RateLimitExceeded) {
                self.throttle.cool_down().await;
            }
            return Err(err);
        }

        let parsed: UnrestrictedLink = serde_json::from_str(&body).map_err(|e| {
            DebridError::InvalidResponse(format!("failed to parse unrestrict response: {}", e))
        })?;
        if parsed.download.is_empty() {
            return Err(DebridError::InvalidResponse(
                "response carried no download URL".to_string(),
            ));
        }
        Ok(parsed)
    }
}

fn error_from_body(status: StatusCode, body: &str) -> DebridError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => classify(status.as_u16(), err.error_code, err.error),
        Err(_) => {
            let message = if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            } else {
                body.to_string()
            };
            classify(status.as_u16(), None, message)
        }
    }
}

/// Builder for configuring a [`DebridClient`].
#[derive(Debug)]
pub struct DebridClientBuilder {
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
    rate_limit_interval: Duration,
    rate_limit_cooldown: Duration,
}

impl Default for DebridClientBuilder {
    fn default() -> Self {
        Self {
            base_url: DEBRID_API_BASE.to_string(),
            api_token: None,
            timeout: Duration::from_secs(30),
            rate_limit_interval: Duration::from_millis(250),
            rate_limit_cooldown: Duration::from_secs(10),
        }
    }
}

impl DebridClientBuilder {
    /// Set a custom base URL (useful for testing with mock servers).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rate_limit_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_interval = interval;
        self
    }

    /// Pause after the service reports that we exceeded its request rate.
    pub fn rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn build(self) -> Result<DebridClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(DebridClient {
            client,
            base_url: self.base_url,
            api_token: self.api_token,
            throttle: Throttle::new(self.rate_limit_interval, self.rate_limit_cooldown),
        })
    }
}
