use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use sheetbridge_core::FieldMap;
use sheetbridge_daemon::paths::socket_path;
use sheetbridge_daemon::{
    request_flush, request_ingest, request_poll, request_status, request_stop, request_write,
    subscribe, DaemonError,
};
use sheetbridge_sync::HubEvent;

fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn wait_for_socket(home: &Path) {
    for _ in 0..100 {
        if socket_path(home).exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon socket never appeared");
}

async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("blocking task")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_flush_poll_and_stop_over_socket() {
    let home = TempDir::new().expect("home");
    let home_path: PathBuf = home.path().to_path_buf();
    let daemon = tokio::spawn(sheetbridge_daemon::run(home_path.clone()));
    wait_for_socket(&home_path).await;

    let h = home_path.clone();
    let written = blocking(move || {
        request_write(&h, None, "DH001".into(), fields(&[("status", json!("Shipped"))]))
    })
    .await
    .expect("write");
    assert_eq!(written["queued"], json!(true));

    let h = home_path.clone();
    let flushed = blocking(move || request_flush(&h)).await.expect("flush");
    assert!(
        flushed["outcome"] == json!("completed") || flushed["outcome"] == json!("skipped"),
        "unexpected flush outcome: {flushed}"
    );

    // A timer tick may have taken the write first; wait for it to land.
    let mut status = json!(null);
    for _ in 0..50 {
        let h = home_path.clone();
        status = blocking(move || request_status(&h)).await.expect("status");
        if status["engine"]["tracked_records"] == json!(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["running"], json!(true));
    assert_eq!(status["engine"]["queue_depth"], json!(0));
    assert_eq!(status["engine"]["tracked_records"], json!(1));

    let h = home_path.clone();
    let polled = blocking(move || request_poll(&h, Some("orders".into()), 0))
        .await
        .expect("poll");
    let changes = polled["changes"].as_array().expect("changes");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["fields"]["status"], json!("shipped"));

    let sheet = home_path.join(".sheetbridge/sheets/orders.json");
    let mirrored = std::fs::read_to_string(&sheet).expect("mirrored sheet");
    assert!(mirrored.contains("\"Status\": \"shipped\""), "{mirrored}");

    let h = home_path.clone();
    blocking(move || request_stop(&h)).await.expect("stop");
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon exits")
        .expect("join")
        .expect("daemon result");
    assert!(!socket_path(&home_path).exists(), "socket removed on exit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_receives_connected_then_change() {
    let home = TempDir::new().expect("home");
    let home_path: PathBuf = home.path().to_path_buf();
    let daemon = tokio::spawn(sheetbridge_daemon::run(home_path.clone()));
    wait_for_socket(&home_path).await;

    let h = home_path.clone();
    let listener = tokio::task::spawn_blocking(move || {
        let mut events = Vec::new();
        subscribe(&h, Some("orders".into()), |event| {
            events.push(event);
            events.len() < 2
        })
        .map(|()| events)
    });

    // The subscription registers asynchronously; retry until a change
    // reaches it.
    for attempt in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let h = home_path.clone();
        let outcome = blocking(move || {
            request_ingest(
                &h,
                None,
                format!("DH{attempt:03}"),
                fields(&[("Status", json!("Open"))]),
                None,
            )
        })
        .await
        .expect("ingest");
        if outcome["delivered"] == json!(1) {
            break;
        }
    }

    let events = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener finishes")
        .expect("join")
        .expect("subscribe");
    assert!(matches!(events[0], HubEvent::Connected { .. }));
    assert!(matches!(events[1], HubEvent::Change { .. }));

    let h = home_path.clone();
    blocking(move || request_stop(&h)).await.expect("stop");
    let _ = tokio::time::timeout(Duration::from_secs(5), daemon).await;
}

#[test]
fn requests_without_daemon_report_not_running() {
    let home = TempDir::new().expect("home");
    let err = request_flush(home.path()).unwrap_err();
    assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
}
