use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::telemetry::TelemetryClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Sale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mutation {
    pub action: MutationKind,
    pub product: String,
    pub sent_at: DateTime<Utc>,
}

impl Mutation {
    pub fn sale(product: impl Into<String>) -> Self {
        Self {
            action: MutationKind::Sale,
            product: product.into(),
            sent_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn pull(&self) -> AppResult<String>;
}

#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Best-effort delivery. Failures are logged and dropped, never returned.
    async fn send(&self, mutation: &Mutation);
}

#[derive(Clone)]
pub struct Transport {
    feed: Arc<dyn FeedSource>,
    sink: Arc<dyn MutationSink>,
}

impl Transport {
    pub fn http(config: &AppConfig, telemetry: TelemetryClient) -> AppResult<Self> {
        let http = Arc::new(HttpTransport::new(config, telemetry)?);
        Ok(Self {
            feed: http.clone(),
            sink: http,
        })
    }

    pub fn from_parts(feed: Arc<dyn FeedSource>, sink: Arc<dyn MutationSink>) -> Self {
        Self { feed, sink }
    }

    pub async fn pull(&self) -> AppResult<String> {
        self.feed.pull().await
    }

    pub fn push(&self, mutation: Mutation) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.send(&mutation).await;
        });
    }
}

pub struct HttpTransport {
    http: Client,
    feed_url: SecretString,
    sink_url: SecretString,
    pull_timeout: Duration,
    push_timeout: Duration,
    telemetry: TelemetryClient,
}

impl HttpTransport {
    pub fn new(config: &AppConfig, telemetry: TelemetryClient) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("matrix-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            feed_url: config.feed_url.clone(),
            sink_url: config.sink_url.clone(),
            pull_timeout: config.pull_timeout(),
            push_timeout: config.push_timeout(),
            telemetry,
        })
    }

    async fn fetch_feed(&self) -> AppResult<String> {
        let response = self
            .http
            .get(self.feed_url.expose_secret())
            .timeout(self.pull_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    fn report_unknown_delivery(&self, mutation: &Mutation, reason: &str) {
        warn!(
            target: "sink",
            product = %mutation.product,
            reason,
            "sink delivery unknown; optimistic sale stays until the next pull"
        );
        let _ = self.telemetry.record(
            "sink_delivery_unknown",
            serde_json::json!({
                "product": mutation.product,
                "reason": reason,
            }),
        );
    }
}

#[async_trait]
impl FeedSource for HttpTransport {
    async fn pull(&self) -> AppResult<String> {
        let started = std::time::Instant::now();
        let result = match timeout(self.pull_timeout, self.fetch_feed()).await {
            Ok(Err(AppError::Transport(err))) if err.is_timeout() => {
                Err(AppError::Timeout(self.pull_timeout))
            }
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.pull_timeout)),
        };
        match &result {
            Ok(body) => trace!(
                target: "transport",
                bytes = body.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "feed pulled"
            ),
            Err(err) => debug!(target: "transport", ?err, "feed pull failed"),
        }
        result
    }
}

#[async_trait]
impl MutationSink for HttpTransport {
    async fn send(&self, mutation: &Mutation) {
        let request = self
            .http
            .post(self.sink_url.expose_secret())
            .timeout(self.push_timeout)
            .json(mutation)
            .send();

        match timeout(self.push_timeout, request).await {
            Ok(Ok(response)) => {
                debug!(
                    target: "sink",
                    product = %mutation.product,
                    status = response.status().as_u16(),
                    "mutation posted"
                );
                let _ = self.telemetry.record(
                    "mutation_sent",
                    serde_json::json!({ "product": mutation.product }),
                );
            }
            Ok(Err(err)) => self.report_unknown_delivery(mutation, &err.to_string()),
            Err(_) => self.report_unknown_delivery(mutation, "timed out"),
        }
    }
}
