mod cleaner;
mod commands;
mod config;
mod engine;
mod errors;
mod feed;
mod reconciler;
mod scheduler;
mod snapshot;
mod telemetry;
mod transport;

use anyhow::Context;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cleaner::clean;
pub use commands::{dispatch, parse_command, ConsoleCommand, SyncHealth};
pub use config::{AppConfig, PublicAppConfig};
pub use engine::{PublishedView, SaleAction, SyncEngine, SyncHandle};
pub use errors::{AppError, AppResult};
pub use feed::{parse_rows, take_row, RawRow};
pub use reconciler::{OptimisticDelta, Reconciler, SyncPhase, SyncState};
pub use scheduler::{spawn_ticker, PullDecision, PullGate, PullTrigger, RetryPolicy};
pub use snapshot::{build_snapshot, extract_snapshot, ColumnLayout, FeedSchema, MetricsSnapshot};
pub use telemetry::TelemetryClient;
pub use transport::{FeedSource, HttpTransport, Mutation, MutationKind, MutationSink, Transport};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,matrix_sync_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env().context("loading sync configuration")?;
    let telemetry = TelemetryClient::from_config(&config).context("opening sync journal")?;
    let transport =
        Transport::http(&config, telemetry.clone()).context("building feed transport")?;
    if let Err(err) = telemetry.record(
        "app_start",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "config": config.public_profile(),
        }),
    ) {
        warn!(?err, "failed to queue telemetry bootstrap event");
    }

    let (handle, engine_task) = SyncEngine::start(&config, transport, telemetry.clone());
    let ticker = {
        let handle = handle.clone();
        spawn_ticker(config.poll_interval(), move || handle.tick().is_ok())
    };
    let renderer = {
        let mut views = handle.subscribe();
        tokio::spawn(async move {
            while views.changed().await.is_ok() {
                let view = views.borrow_and_update().clone();
                info!(
                    phase = view.phase.as_str(),
                    sales = view.snapshot.sales,
                    cost = view.snapshot.cost,
                    labour = view.snapshot.labour,
                    profit = view.snapshot.profit,
                    gp_ratio = view.snapshot.gross_profit_ratio,
                    pending = view.pending_deltas,
                    "published view"
                );
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading console input")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            info!("console input closed; running until interrupted");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            break;
        };
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                warn!(%err, "ignoring console input");
                continue;
            }
        };
        match dispatch(&handle, command).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => break,
            Err(err) => warn!(%err, "command failed"),
        }
    }

    handle.shutdown();
    ticker.abort();
    engine_task.await.context("sync engine task panicked")?;
    renderer.abort();
    telemetry.flush().context("flushing sync journal")?;
    Ok(())
}
