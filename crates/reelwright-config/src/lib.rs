// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://reelwright.db".to_string(),
            pool_max_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// When set, every `/api/v1` request must carry this key.
    pub api_key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5160,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub lease_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub staging_dir: PathBuf,
    pub worker_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_ttl_secs: 300,
            poll_interval_ms: 2000,
            staging_dir: PathBuf::from("staging"),
            worker_id: None,
        }
    }
}

impl PipelineConfig {
    /// Identity written into lease rows; unique per process unless configured.
    pub fn holder_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("reelwright-{}", std::process::id()))
    }
}

/// Bounded retry with exponential backoff, shared by the retrying stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Ceiling on the wall-clock time spent retrying one stage.
    pub max_elapsed_secs: u64,
}

impl RetryConfig {
    fn download_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 30 * 60,
            max_elapsed_secs: 6 * 60 * 60,
        }
    }

    fn transcode_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            max_delay_secs: 60 * 60,
            max_elapsed_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub retry: RetryConfig,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::download_default(),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub link_ttl_secs: u64,
    pub min_request_interval_ms: u64,
    /// Pause after the service reports its rate limit was hit.
    pub throttle_cooldown_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.real-debrid.com/rest/1.0".to_string(),
            api_token: None,
            link_ttl_secs: 60 * 60,
            min_request_interval_ms: 250,
            throttle_cooldown_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub decode_check_timeout_secs: u64,
    pub max_concurrent: usize,
    pub ac3_bitrate_kbps: u32,
    pub ac3_channels: u32,
    pub retry: RetryConfig,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            timeout_secs: 4 * 60 * 60,
            probe_timeout_secs: 60,
            decode_check_timeout_secs: 90,
            max_concurrent: 1,
            ac3_bitrate_kbps: 640,
            ac3_channels: 6,
            retry: RetryConfig::transcode_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub root: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("library"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JellyfinConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub telemetry: TelemetryConfig,
    pub pipeline: PipelineConfig,
    pub download: DownloadConfig,
    pub resolver: ResolverConfig,
    pub transcoder: TranscoderConfig,
    pub library: LibraryConfig,
    pub notify: NotifyConfig,
    pub jellyfin: JellyfinConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.lease_ttl_secs < 3 {
            bail!("pipeline.lease_ttl_secs must be at least 3 so the lease can be renewed");
        }
        for (name, retry) in [
            ("download.retry", &self.download.retry),
            ("transcoder.retry", &self.transcoder.retry),
        ] {
            if retry.max_attempts == 0 {
                bail!("{name}.max_attempts must be at least 1");
            }
            if retry.max_delay_secs < retry.base_delay_secs {
                bail!("{name}.max_delay_secs must not be below base_delay_secs");
            }
        }
        if self.transcoder.max_concurrent == 0 {
            bail!("transcoder.max_concurrent must be at least 1");
        }
        if self.library.root.as_os_str().is_empty() {
            bail!("library.root must not be empty");
        }
        Ok(())
    }
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: REELWRIGHT_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("REELWRIGHT_").split("__"));

    let config: AppConfig = figment.extract()?;
    config.validate()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
