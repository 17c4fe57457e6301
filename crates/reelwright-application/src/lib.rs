// SPDX-License-Identifier: GPL-3.0-or-later
pub mod coordinator;
pub mod decision;
pub mod download;
pub mod events;
pub mod inspect;
pub mod notify;
pub mod pipeline;
pub mod placement;
pub mod resolver;
pub mod transcode;
pub mod verify;

pub use coordinator::{
    CancelOutcome, CoordinatorError, ResolutionAction, ResolutionCoordinator, ResolutionDecision,
    ResolutionOverrides,
};
pub use events::{EventPublisher, FanoutPublisher, InMemoryEventBus, TracingPublisher, WebhookPublisher};
pub use pipeline::{NewRelease, Pipeline, PipelineError, PipelineSettings};

use anyhow::Result;
use reelwright_config::AppConfig;
use reelwright_debrid::DebridClient;
use reelwright_infrastructure::{http_client, ReleaseRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::download::DownloadManager;
use crate::inspect::{FfprobeInspector, MediaProbe};
use crate::notify::JellyfinRefresher;
use crate::placement::PlacementEngine;
use crate::resolver::CachingResolver;
use crate::transcode::FfmpegTranscoder;

/// Everything the workers and the HTTP surface share.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ReleaseRepository>,
    pub pipeline: Arc<Pipeline>,
    pub coordinator: Arc<ResolutionCoordinator>,
}

impl Services {
    /// Wire the production collaborators described by `config` around `store`.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ReleaseRepository>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = http_client(&config.download)?;

        let debrid = DebridClient::builder()
            .base_url(config.resolver.base_url.clone())
            .api_token(config.resolver.api_token.clone())
            .timeout(Duration::from_secs(config.download.read_timeout_secs))
            .rate_limit_interval(Duration::from_millis(config.resolver.min_request_interval_ms))
            .rate_limit_cooldown(Duration::from_secs(config.resolver.throttle_cooldown_secs))
            .build()?;
        let resolver = CachingResolver::new(
            Arc::new(debrid),
            Duration::from_secs(config.resolver.link_ttl_secs),
        );
        let downloads = DownloadManager::new(client.clone(), resolver, config.pipeline.staging_dir.clone());

        let probe: Arc<dyn MediaProbe> = Arc::new(FfprobeInspector::new(
            config.transcoder.ffprobe_path.clone(),
            Duration::from_secs(config.transcoder.probe_timeout_secs),
        ));
        let transcoder = Arc::new(FfmpegTranscoder::new(
            config.transcoder.ffmpeg_path.clone(),
            probe.clone(),
            Duration::from_secs(config.transcoder.timeout_secs),
            Duration::from_secs(config.transcoder.decode_check_timeout_secs),
            config.transcoder.max_concurrent,
        ));
        let placement = PlacementEngine::new(config.library.root.clone());

        let mut events = FanoutPublisher::new().with(Arc::new(TracingPublisher));
        if let Some(url) = &config.notify.webhook_url {
            info!(target: "pipeline", "webhook notifications enabled");
            events = events.with(Arc::new(WebhookPublisher::new(client.clone(), url.clone())));
        }
        if let (Some(base_url), Some(api_key)) = (&config.jellyfin.base_url, &config.jellyfin.api_key) {
            info!(target: "pipeline", "jellyfin library refresh enabled");
            events = events.with(Arc::new(JellyfinRefresher::new(
                client.clone(),
                base_url.clone(),
                api_key.clone(),
            )));
        }
        let events: Arc<dyn EventPublisher> = Arc::new(events);

        let settings = PipelineSettings::from_config(config);
        let coordinator = ResolutionCoordinator::new(
            store.clone(),
            events.clone(),
            settings.holder.clone(),
            chrono::Duration::seconds(config.pipeline.lease_ttl_secs as i64),
        );
        let pipeline = Pipeline::new(
            store.clone(),
            downloads,
            probe,
            transcoder,
            placement,
            events,
            settings,
        )
        .with_shutdown(shutdown);

        Ok(Self {
            store,
            pipeline: Arc::new(pipeline),
            coordinator: Arc::new(coordinator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelwright_infrastructure::{init_memory_database, SqliteReleaseRepository};

    #[tokio::test]
    async fn services_build_from_default_config() {
        let pool = init_memory_database().await.unwrap();
        let store: Arc<dyn ReleaseRepository> = Arc::new(SqliteReleaseRepository::new(pool));
        let mut config = AppConfig::default();
        config.notify.webhook_url = Some("http://localhost:9/hook".to_string());

        let services = Services::from_config(&config, store, CancellationToken::new()).unwrap();
        assert!(services.coordinator.list_pending().await.unwrap().is_empty());
        assert_eq!(services.pipeline.settings().audio_target.codec, "ac3");
    }
}
