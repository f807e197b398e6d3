use std::time::Duration;
use std::{env, io};

use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::snapshot::FeedSchema;

const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
const MIN_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PULL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PUSH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_BASE_MS: u64 = 2_000;
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub feed_url: SecretString,
    pub sink_url: SecretString,
    pub feed_schema: FeedSchema,
    pub poll_interval_ms: u64,
    pub pull_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub telemetry_enabled: bool,
    pub telemetry_dir: Option<String>,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub feed_host: Option<String>,
    pub sink_host: Option<String>,
    pub feed_schema: &'static str,
    pub poll_interval_ms: u64,
    pub pull_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub telemetry_enabled: bool,
    pub telemetry_dir: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        load_dotenv_if_applicable();
        let feed_url = required_url("FEED_URL")?;
        let sink_url = required_url("SINK_URL")?;
        let feed_schema = match env::var("FEED_SCHEMA") {
            Ok(value) => FeedSchema::parse(&value)?,
            Err(_) => FeedSchema::default(),
        };

        Ok(Self {
            feed_schema,
            poll_interval_ms: parse_u64("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)
                .max(MIN_POLL_INTERVAL_MS),
            pull_timeout_ms: parse_u64("PULL_TIMEOUT_MS", DEFAULT_PULL_TIMEOUT_MS).max(1),
            push_timeout_ms: parse_u64("PUSH_TIMEOUT_MS", DEFAULT_PUSH_TIMEOUT_MS).max(1),
            retry_base_ms: parse_u64("RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS).max(1),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_dir: env::var("TELEMETRY_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
            ..Self::with_endpoints(feed_url, sink_url)
        })
    }

    pub fn with_endpoints(feed_url: impl Into<String>, sink_url: impl Into<String>) -> Self {
        Self {
            feed_url: SecretString::from(feed_url.into()),
            sink_url: SecretString::from(sink_url.into()),
            feed_schema: FeedSchema::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            pull_timeout_ms: DEFAULT_PULL_TIMEOUT_MS,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT_MS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            telemetry_enabled: false,
            telemetry_dir: None,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            feed_host: host_of(&self.feed_url),
            sink_host: host_of(&self.sink_url),
            feed_schema: self.feed_schema.as_str(),
            poll_interval_ms: self.poll_interval_ms,
            pull_timeout_ms: self.pull_timeout_ms,
            push_timeout_ms: self.push_timeout_ms,
            retry_base_ms: self.retry_base_ms,
            telemetry_enabled: self.telemetry_enabled,
            telemetry_dir: self.telemetry_dir.clone(),
        }
    }
}

fn required_url(key: &str) -> AppResult<String> {
    let value = env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Config(format!("{key} must be set")))?;
    Url::parse(&value).map_err(|err| AppError::Config(format!("{key} is not a valid URL: {err}")))?;
    Ok(value)
}

fn host_of(url: &SecretString) -> Option<String> {
    Url::parse(url.expose_secret())
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_endpoints_and_hides_them_in_public_profile() {
        env::remove_var("FEED_URL");
        env::set_var("SINK_URL", "https://script.example.com/macros/s/secret-id/exec");
        let missing = AppConfig::from_env();
        assert!(matches!(missing, Err(AppError::Config(_))));

        env::set_var("FEED_URL", "not a url");
        assert!(matches!(AppConfig::from_env(), Err(AppError::Config(_))));

        env::set_var(
            "FEED_URL",
            "https://docs.example.com/spreadsheets/d/secret-sheet/pub?output=csv",
        );
        env::set_var("POLL_INTERVAL_MS", "10");
        env::set_var("TELEMETRY_BUFFER_MAX_FILES", "0");
        let config = AppConfig::from_env().unwrap();
        let public = config.public_profile();

        assert_eq!(public.feed_host.as_deref(), Some("docs.example.com"));
        assert_eq!(public.sink_host.as_deref(), Some("script.example.com"));
        assert_eq!(config.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(config.telemetry_buffer_max_files, 1);
        assert_eq!(public.feed_schema, "v1");
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
        assert_eq!(public.pull_timeout_ms, DEFAULT_PULL_TIMEOUT_MS);

        env::remove_var("POLL_INTERVAL_MS");
        env::remove_var("TELEMETRY_BUFFER_MAX_FILES");
    }

    #[test]
    fn endpoint_defaults_leave_telemetry_off() {
        let config = AppConfig::with_endpoints("http://feed.local/csv", "http://sink.local/post");
        assert!(!config.telemetry_enabled);
        assert_eq!(config.pull_timeout(), Duration::from_millis(DEFAULT_PULL_TIMEOUT_MS));
        assert_eq!(config.feed_url.expose_secret(), "http://feed.local/csv");
    }

    #[test]
    fn poll_interval_keeps_its_floor_when_set_directly() {
        let mut config = AppConfig::with_endpoints("http://feed.local/csv", "http://sink.local/post");
        config.poll_interval_ms = 0;
        assert_eq!(
            config.poll_interval(),
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
    }
}
