// SPDX-License-Identifier: GPL-3.0-or-later
//! Playback server library refresh.

use async_trait::async_trait;
use reelwright_domain::{ReleaseEvent, RELEASE_PLACED};
use reqwest::Client;
use tracing::{debug, warn};

use crate::events::EventPublisher;

/// Asks a Jellyfin server to rescan its libraries once a release is placed.
/// Failures are logged and never retried.
#[derive(Clone)]
pub struct JellyfinRefresher {
    client: Client,
    base_url: String,
    api_key: String,
}

impl JellyfinRefresher {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub async fn refresh(&self) -> Result<(), reqwest::Error> {
        let url = format!("{}/Library/Refresh", self.base_url);
        self.client
            .post(&url)
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        debug!(target: "events", "library refresh requested");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for JellyfinRefresher {
    async fn publish(&self, event: &ReleaseEvent) {
        if event.name != RELEASE_PLACED {
            return;
        }
        if let Err(err) = self.refresh().await {
            warn!(
                target: "events",
                release_id = %event.payload.release_id,
                error = %err,
                "library refresh failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelwright_domain::{
        DomainEvent, PipelineState, ReleaseEventPayload, ReleaseId, RELEASE_ABANDONED,
    };
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(name: &'static str, state: PipelineState) -> ReleaseEvent {
        DomainEvent::new(
            name,
            ReleaseEventPayload {
                release_id: ReleaseId::new(),
                state,
                note: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn placed_release_triggers_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Library/Refresh"))
            .and(header("X-Emby-Token", "jf-key"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let refresher = JellyfinRefresher::new(Client::new(), format!("{}/", server.uri()), "jf-key");
        refresher.publish(&event(RELEASE_PLACED, PipelineState::Placed)).await;
        refresher
            .publish(&event(RELEASE_ABANDONED, PipelineState::Abandoned))
            .await;
    }

    #[tokio::test]
    async fn refresh_reports_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let refresher = JellyfinRefresher::new(Client::new(), server.uri(), "wrong");
        assert!(refresher.refresh().await.is_err());
    }
}
