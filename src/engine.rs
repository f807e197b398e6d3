use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::commands::SyncHealth;
use crate::config::{AppConfig, PublicAppConfig};
use crate::errors::{AppError, AppResult};
use crate::reconciler::{OptimisticDelta, Reconciler, SyncPhase};
use crate::scheduler::{PullDecision, PullGate, PullTrigger, RetryPolicy};
use crate::snapshot::{extract_snapshot, FeedSchema, MetricsSnapshot};
use crate::telemetry::TelemetryClient;
use crate::transport::{Mutation, Transport};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedView {
    pub phase: SyncPhase,
    pub snapshot: MetricsSnapshot,
    pub pending_deltas: usize,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for PublishedView {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            snapshot: MetricsSnapshot::default(),
            pending_deltas: 0,
            last_pull_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleAction {
    pub product: String,
    pub delta: OptimisticDelta,
}

impl SaleAction {
    pub fn new(product: impl Into<String>, sales_delta: f64, profit_delta: f64) -> Self {
        Self {
            product: product.into(),
            delta: OptimisticDelta::new(sales_delta, profit_delta),
        }
    }
}

enum Message {
    Tick,
    Refresh,
    Sale {
        action: SaleAction,
        reply: oneshot::Sender<PublishedView>,
    },
    PullFinished {
        trigger: PullTrigger,
        result: AppResult<String>,
    },
    RetryDue,
    Health(oneshot::Sender<SyncHealth>),
    Shutdown,
}

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<Message>,
    view: watch::Receiver<PublishedView>,
}

impl SyncHandle {
    pub fn tick(&self) -> AppResult<()> {
        self.send(Message::Tick)
    }

    pub fn refresh(&self) -> AppResult<()> {
        self.send(Message::Refresh)
    }

    pub async fn record_sale(&self, action: SaleAction) -> AppResult<PublishedView> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Sale { action, reply })?;
        rx.await.map_err(|_| AppError::EngineClosed)
    }

    pub async fn health(&self) -> AppResult<SyncHealth> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Health(reply))?;
        rx.await.map_err(|_| AppError::EngineClosed)
    }

    pub fn current(&self) -> PublishedView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedView> {
        self.view.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }

    fn send(&self, message: Message) -> AppResult<()> {
        self.tx.send(message).map_err(|_| AppError::EngineClosed)
    }
}

pub struct SyncEngine {
    reconciler: Reconciler,
    gate: PullGate,
    retry: RetryPolicy,
    retry_scheduled: bool,
    consecutive_failures: u32,
    transport: Transport,
    telemetry: TelemetryClient,
    schema: FeedSchema,
    pull_timeout: Duration,
    public_config: PublicAppConfig,
    last_pull_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    view: watch::Sender<PublishedView>,
    inbox: mpsc::UnboundedReceiver<Message>,
    outbox: mpsc::WeakUnboundedSender<Message>,
}

impl SyncEngine {
    pub fn start(
        config: &AppConfig,
        transport: Transport,
        telemetry: TelemetryClient,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (view, view_rx) = watch::channel(PublishedView::default());
        let engine = Self {
            reconciler: Reconciler::new(),
            gate: PullGate::new(),
            retry: RetryPolicy::new(config.retry_base(), config.poll_interval()),
            retry_scheduled: false,
            consecutive_failures: 0,
            transport,
            telemetry,
            schema: config.feed_schema,
            pull_timeout: config.pull_timeout(),
            public_config: config.public_profile(),
            last_pull_at: None,
            last_error: None,
            view,
            inbox,
            outbox: tx.downgrade(),
        };
        let task = tokio::spawn(engine.run());
        (SyncHandle { tx, view: view_rx }, task)
    }

    async fn run(mut self) {
        info!(target: "engine", schema = self.schema.as_str(), "sync engine started");
        self.request_pull(PullTrigger::Startup);

        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Tick => self.request_pull(PullTrigger::Tick),
                Message::Refresh => self.request_pull(PullTrigger::Manual),
                Message::Sale { action, reply } => {
                    let view = self.apply_sale(action);
                    let _ = reply.send(view);
                }
                Message::PullFinished { trigger, result } => self.finish_pull(trigger, result),
                Message::RetryDue => {
                    self.retry_scheduled = false;
                    if self.retry.consecutive_failures() > 0 {
                        self.request_pull(PullTrigger::Retry);
                    }
                }
                Message::Health(reply) => {
                    let _ = reply.send(self.health());
                }
                Message::Shutdown => break,
            }
        }

        if let Err(err) = self.telemetry.flush() {
            warn!(target: "engine", ?err, "failed to flush sync journal");
        }
        info!(target: "engine", "sync engine stopped");
    }

    fn apply_sale(&mut self, action: SaleAction) -> PublishedView {
        let SaleAction { product, delta } = action;
        self.reconciler.apply_optimistic(delta);
        let view = self.publish();
        debug!(
            target: "engine",
            product = %product,
            pending = view.pending_deltas,
            "optimistic sale applied"
        );

        self.transport.push(Mutation::sale(product));
        self.request_pull(PullTrigger::PostMutation);
        view
    }

    fn request_pull(&mut self, trigger: PullTrigger) {
        match self.gate.on_demand(trigger) {
            PullDecision::Start => self.start_pull(trigger),
            PullDecision::Coalesced => {
                debug!(target: "engine", ?trigger, "pull in flight; trigger coalesced")
            }
        }
    }

    fn start_pull(&self, trigger: PullTrigger) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        let limit = self.pull_timeout;
        tokio::spawn(async move {
            let result = match timeout(limit, transport.pull()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(limit)),
            };
            let _ = outbox.send(Message::PullFinished { trigger, result });
        });
    }

    fn finish_pull(&mut self, trigger: PullTrigger, result: AppResult<String>) {
        match result.and_then(|text| extract_snapshot(&text, self.schema)) {
            Ok(snapshot) => {
                let pending = self.reconciler.state().pending_deltas().len();
                self.reconciler.apply_authoritative(snapshot);
                self.retry.reset();
                self.consecutive_failures = 0;
                self.last_pull_at = Some(Utc::now());
                self.last_error = None;
                debug!(
                    target: "engine",
                    ?trigger,
                    discarded = pending,
                    sales = snapshot.sales,
                    profit = snapshot.profit,
                    "authoritative snapshot applied"
                );
                let _ = self.telemetry.record(
                    "pull_succeeded",
                    json!({
                        "trigger": trigger,
                        "discarded_deltas": pending,
                        "snapshot": snapshot,
                    }),
                );
            }
            Err(err) => {
                self.reconciler.pull_failed();
                warn!(target: "engine", ?trigger, %err, "pull produced no update; keeping last view");
                let _ = self.telemetry.record(
                    "pull_failed",
                    json!({ "trigger": trigger, "reason": err.to_string() }),
                );
                self.last_error = Some(err.to_string());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.schedule_retry();
            }
        }
        self.publish();

        if let Some(next) = self.gate.on_pull_complete() {
            self.start_pull(next);
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let delay = self.retry.next_delay();
        self.retry_scheduled = true;
        debug!(
            target: "engine",
            delay_ms = delay.as_millis() as u64,
            failures = self.retry.consecutive_failures(),
            "pull retry scheduled"
        );
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = outbox.send(Message::RetryDue);
        });
    }

    fn publish(&self) -> PublishedView {
        let state = self.reconciler.state();
        let next = PublishedView {
            phase: state.phase(),
            snapshot: *state.published(),
            pending_deltas: state.pending_deltas().len(),
            last_pull_at: self.last_pull_at,
            last_error: self.last_error.clone(),
        };
        let published = next.clone();
        self.view.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        published
    }

    fn health(&self) -> SyncHealth {
        let state = self.reconciler.state();
        SyncHealth {
            phase: state.phase(),
            published: *state.published(),
            pending_deltas: state.pending_deltas().len(),
            last_pull_at: self.last_pull_at,
            last_error: self.last_error.clone(),
            pull_in_flight: self.gate.is_in_flight(),
            pulls_issued: self.gate.issued(),
            consecutive_failures: self.consecutive_failures,
            journal_path: self
                .telemetry
                .journal_path()
                .map(|path| path.to_string_lossy().to_string()),
            journal_queue_depth: self.telemetry.queue_depth(),
            journal_dropped_events: self.telemetry.dropped_events(),
            config: self.public_config.clone(),
        }
    }
}
