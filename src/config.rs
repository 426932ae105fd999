use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::schedule::SchedulePolicy;

const DEFAULT_DAILY_HOUR: u32 = 1;
const DEFAULT_RETRY_DELAY_MINUTES: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;
/// Longest interval or retry delay accepted, one year.
const MAX_PERIOD_MINUTES: u64 = 366 * 24 * 60;

#[derive(Clone)]
pub struct Config {
    pub server_addr: SocketAddr,
    pub public_dir: PathBuf,
    pub news: Arc<NewsConfig>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
        let port = port
            .parse::<u16>()
            .map_err(|e| AppError::ConfigError(format!("Invalid port: {}", e)))?;
        let ip = IpAddr::from_str(&host)
            .map_err(|e| AppError::ConfigError(format!("Invalid host address: {}", e)))?;

        let public_dir = PathBuf::from(env::var("PUBLIC_DIR").unwrap_or_else(|_| "public".to_string()));
        let news_path = env::var("NEWS_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let news = NewsConfig::load(Path::new(&news_path))?;

        Ok(Config {
            server_addr: SocketAddr::new(ip, port),
            public_dir,
            news: Arc::new(news),
        })
    }
}

/// Connection settings for the generation endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl OllamaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub name: String,
    pub reporter: String,
    pub system_prompt: String,
    pub section_prompt: String,
}

/// Contents of the news config file.
///
/// `interval_minutes` selects the fixed-interval policy; without it the
/// service regenerates once a day at `daily_hour` and retries failures after
/// `retry_delay_minutes`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsConfig {
    pub ollama_config: OllamaConfig,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default)]
    pub daily_hour: Option<u32>,
    #[serde(default)]
    pub retry_delay_minutes: Option<u64>,
}

impl NewsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: NewsConfig = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid news config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ollama_config.base_url.trim().is_empty() {
            return Err(AppError::ConfigError("ollamaConfig.baseUrl is empty".to_string()));
        }
        if self.ollama_config.model.trim().is_empty() {
            return Err(AppError::ConfigError("ollamaConfig.model is empty".to_string()));
        }
        if self.interval_minutes == Some(0) {
            return Err(AppError::ConfigError("intervalMinutes must be positive".to_string()));
        }
        if self.retry_delay_minutes == Some(0) {
            return Err(AppError::ConfigError("retryDelayMinutes must be positive".to_string()));
        }
        for (field, value) in [
            ("intervalMinutes", self.interval_minutes),
            ("retryDelayMinutes", self.retry_delay_minutes),
        ] {
            if let Some(minutes) = value.filter(|m| *m > MAX_PERIOD_MINUTES) {
                return Err(AppError::ConfigError(format!(
                    "{} must be at most {} (one year), got {}",
                    field, MAX_PERIOD_MINUTES, minutes
                )));
            }
        }
        if let Some(hour) = self.daily_hour {
            if hour > 23 {
                return Err(AppError::ConfigError(format!("dailyHour out of range: {}", hour)));
            }
        }

        let mut seen = HashSet::new();
        for section in &self.sections {
            if !is_safe_slug(&section.id) {
                return Err(AppError::ConfigError(format!(
                    "Section id {:?} is not filesystem-safe",
                    section.id
                )));
            }
            if !seen.insert(section.id.as_str()) {
                return Err(AppError::ConfigError(format!("Duplicate section id {:?}", section.id)));
            }
        }
        Ok(())
    }

    /// Global prompt, if one is configured and non-empty.
    pub fn global_system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|p| !p.is_empty())
    }

    pub fn schedule_policy(&self) -> SchedulePolicy {
        match self.interval_minutes {
            Some(minutes) => SchedulePolicy::FixedInterval {
                period: Duration::from_secs(minutes.saturating_mul(60)),
                run_on_startup: self.run_on_startup,
            },
            None => SchedulePolicy::DailyAtHour {
                hour: self.daily_hour.unwrap_or(DEFAULT_DAILY_HOUR),
                retry_delay: Duration::from_secs(
                    self.retry_delay_minutes
                        .unwrap_or(DEFAULT_RETRY_DELAY_MINUTES)
                        .saturating_mul(60),
                ),
            },
        }
    }
}

fn is_safe_slug(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
