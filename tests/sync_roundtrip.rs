use std::time::Duration;

use httptest::matchers::{json_decoded, request};
use httptest::responders::status_code;
use httptest::{all_of, cycle, Expectation, Server};
use tempfile::tempdir;

use matrix_sync_lib::{
    AppConfig, MetricsSnapshot, PublishedView, SaleAction, SyncEngine, SyncHandle, SyncPhase,
    TelemetryClient, Transport,
};

const OPENING_FEED: &str = "Date,Till,Staff,Covers,Voids,Comps,Tips,Cash,Card,Net Sales,Liquid Cost,GP,Labour,Net Profit\n\
Saturday,1,4,120,0,0,£35.00,£200.00,£846.25,\"£1,046.25\",£178.40,82.9%,£264.82,£488.74\n";

const AFTER_SALE_FEED: &str = "Date,Till,Staff,Covers,Voids,Comps,Tips,Cash,Card,Net Sales,Liquid Cost,GP,Labour,Net Profit\n\
Saturday,1,4,121,0,0,£35.00,£210.00,£846.25,£1056.25,£180.07,83.0%,£264.82,£497.07\n";

fn config_for(server: &Server) -> AppConfig {
    let mut config = AppConfig::with_endpoints(
        server.url("/feed").to_string(),
        server.url("/sink").to_string(),
    );
    config.pull_timeout_ms = 2_000;
    config.push_timeout_ms = 2_000;
    config.retry_base_ms = 60_000;
    config
}

async fn wait_for<F>(handle: &SyncHandle, mut accept: F) -> PublishedView
where
    F: FnMut(&PublishedView) -> bool,
{
    let mut views = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let view = views.borrow_and_update().clone();
            if accept(&view) {
                return view;
            }
            views.changed().await.expect("engine alive");
        }
    })
    .await
    .expect("view settled")
}

#[tokio::test]
async fn sale_round_trip_against_http_feed_and_sink() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/feed"))
            .times(2)
            .respond_with(cycle![
                status_code(200).body(OPENING_FEED),
                status_code(200).body(AFTER_SALE_FEED)
            ]),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/sink"),
            request::body(json_decoded(|body: &serde_json::Value| {
                body["action"] == "sale" && body["product"] == "house-red"
            }))
        ])
        .respond_with(status_code(200)),
    );

    let config = config_for(&server);
    let telemetry = TelemetryClient::disabled();
    let transport = Transport::http(&config, telemetry.clone()).expect("transport");
    let (handle, task) = SyncEngine::start(&config, transport, telemetry);

    // The quoted "£1,046.25" splits on its comma, so every column after it shifts by one.
    let opening = wait_for(&handle, |v| v.phase == SyncPhase::Authoritative).await;
    assert_eq!(opening.snapshot.sales, 1.0);
    assert_eq!(opening.snapshot.cost, 46.25);

    let optimistic = handle
        .record_sale(SaleAction::new("house-red", 10.0, 8.33))
        .await
        .expect("sale applied");
    assert_eq!(optimistic.phase, SyncPhase::Optimistic);
    assert!((optimistic.snapshot.sales - 11.0).abs() < 1e-9);

    let settled = wait_for(&handle, |v| v.snapshot.sales == 1056.25).await;
    assert_eq!(settled.phase, SyncPhase::Authoritative);
    assert_eq!(settled.pending_deltas, 0);
    assert_eq!(settled.snapshot.cost, 180.07);
    assert_eq!(settled.snapshot.labour, 264.82);
    assert_eq!(settled.snapshot.profit, 497.07);
    assert!((settled.snapshot.gross_profit_ratio - 0.83).abs() < 1e-9);

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();
    task.await.expect("engine stops cleanly");
}

#[tokio::test]
async fn lost_push_vanishes_after_next_pull() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/feed"))
            .times(2)
            .respond_with(status_code(200).body(AFTER_SALE_FEED)),
    );

    let mut config = config_for(&server);
    config.sink_url = "http://127.0.0.1:9/sink".to_string().into();
    let telemetry = TelemetryClient::disabled();
    let transport = Transport::http(&config, telemetry.clone()).expect("transport");
    let (handle, task) = SyncEngine::start(&config, transport, telemetry);

    let base = wait_for(&handle, |v| v.phase == SyncPhase::Authoritative).await;
    let optimistic = handle
        .record_sale(SaleAction::new("lager", 5.5, 4.0))
        .await
        .expect("sale applied");
    assert!((optimistic.snapshot.profit - (base.snapshot.profit + 4.0)).abs() < 1e-9);

    let settled = wait_for(&handle, |v| {
        v.phase == SyncPhase::Authoritative && v.last_pull_at > base.last_pull_at
    })
    .await;
    assert_eq!(settled.snapshot, base.snapshot);

    handle.shutdown();
    task.await.expect("engine stops cleanly");
}

#[tokio::test]
async fn failing_feed_keeps_view_and_journals_the_failure() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/feed"))
            .times(1)
            .respond_with(status_code(500)),
    );

    let dir = tempdir().unwrap();
    let mut config = config_for(&server);
    config.telemetry_enabled = true;
    config.telemetry_batch_size = 1;
    config.telemetry_dir = Some(dir.path().to_string_lossy().to_string());
    let telemetry = TelemetryClient::from_config(&config).expect("journal");
    let transport = Transport::http(&config, telemetry.clone()).expect("transport");
    let (handle, task) = SyncEngine::start(&config, transport, telemetry.clone());

    let view = wait_for(&handle, |v| v.last_error.is_some()).await;
    assert_eq!(view.phase, SyncPhase::Uninitialized);
    assert_eq!(view.snapshot, MetricsSnapshot::default());

    let health = handle.health().await.expect("health");
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.config.feed_host.is_some());

    handle.shutdown();
    task.await.expect("engine stops cleanly");

    let journal = std::fs::read_to_string(telemetry.journal_path().unwrap()).unwrap();
    assert!(journal.contains("pull_failed"));
    assert!(journal.contains("500"));
}
