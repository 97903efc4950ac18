use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use sheetbridge_core::{config, CollectionName, SyncConfig};
use sheetbridge_sync::sheet::{changed_rows, fingerprints, RowFingerprints};
use sheetbridge_sync::{
    ChangeNotification, ClientWrite, EventSink, HubEvent, MemoryStore, SheetFile, SyncEngine,
    TransportError,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{sheets_dir, sheetbridge_root, socket_path, DEBOUNCE_WINDOW, PRUNE_INTERVAL};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Last seen row digests per collection, used to tell which rows changed.
pub type SheetSnapshots = HashMap<CollectionName, RowFingerprints>;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = config::load_at(&home)?;
    let sheet = Arc::new(SheetFile::new(sheets_dir(&home)));
    let engine = Arc::new(SyncEngine::new(
        config.clone(),
        Arc::new(MemoryStore::new()),
        sheet.clone(),
    )?);
    let started_at = Utc::now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let flush_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let interval = config.flush_interval();
        tokio::spawn(async move {
            let result = flush_task(engine, interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let heartbeat_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let interval = config.heartbeat_interval();
        tokio::spawn(async move {
            let result = heartbeat_task(engine, interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let prune_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = prune_task(engine, PRUNE_INTERVAL, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        let sheet = sheet.clone();
        tokio::spawn(async move {
            let result = watcher_task(engine, sheet, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, engine, started_at, shutdown.clone(), shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    tracing::info!(
        home = %home.display(),
        collection = %config.default_collection,
        flush_interval_ms = config.flush_interval_ms,
        "sheetbridge daemon started",
    );

    let (flush_result, heartbeat_result, prune_result, watcher_result, socket_result, signal_result) = tokio::join!(
        flush_handle,
        heartbeat_handle,
        prune_handle,
        watcher_handle,
        socket_handle,
        signal_handle
    );

    // Last chance for writes accepted just before shutdown.
    let engine_for_drain = engine.clone();
    if let Ok(outcome) = tokio::task::spawn_blocking(move || engine_for_drain.flush()).await {
        tracing::info!(outcome = ?outcome, "final flush before exit");
    }

    handle_join("flush", flush_result)?;
    handle_join("heartbeat", heartbeat_result)?;
    handle_join("prune", prune_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Flush tick. Each flush runs on the blocking pool and is awaited before
/// the next tick, and ticks missed meanwhile are dropped rather than
/// replayed.
async fn flush_task(
    engine: Arc<SyncEngine>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let engine = engine.clone();
                let outcome = tokio::task::spawn_blocking(move || engine.flush())
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("flush task join error: {err}")))?;
                tracing::trace!(outcome = ?outcome, "flush tick");
            }
        }
    }
    Ok(())
}

async fn heartbeat_task(
    engine: Arc<SyncEngine>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let delivered = engine.hub().heartbeat_at(Utc::now());
                tracing::debug!(delivered, "heartbeat sent");
            }
        }
    }
    Ok(())
}

async fn prune_task(
    engine: Arc<SyncEngine>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let (changes, locks) = engine.prune_at(Utc::now());
                if changes > 0 || locks > 0 {
                    tracing::debug!(changes, locks, "pruned history and expired locks");
                }
            }
        }
    }
    Ok(())
}

async fn watcher_task(
    engine: Arc<SyncEngine>,
    sheet: Arc<SheetFile>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = sheet.root().to_path_buf();
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let mut snapshots = {
        let sheet = sheet.clone();
        tokio::task::spawn_blocking(move || initial_snapshots(&sheet))
            .await
            .map_err(|err| DaemonError::Protocol(format!("sheet snapshot join error: {err}")))??
    };

    // FSEvents reports canonical paths (/private/var/... on macOS); watch
    // the canonical directory and map event paths back onto `root`.
    let canonical_root = fs::canonicalize(&root).unwrap_or_else(|_| root.clone());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&canonical_root, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %canonical_root.display(), "watching sheets directory");

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    let path = match path.strip_prefix(&canonical_root) {
                        Ok(relative) => root.join(relative),
                        Err(_) => path,
                    };
                    let Some(collection) = sheet.collection_for_path(&path) else {
                        continue;
                    };
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }

                    let previous = snapshots.remove(&collection).unwrap_or_default();
                    let scan = {
                        let sheet = sheet.clone();
                        let collection = collection.clone();
                        tokio::task::spawn_blocking(move || {
                            let result = scan_sheet(&sheet, &collection, &previous);
                            (previous, result)
                        })
                        .await
                        .map_err(|err| DaemonError::Protocol(format!("sheet scan join error: {err}")))?
                    };

                    match scan {
                        (_, Ok((current, notifications))) => {
                            snapshots.insert(collection.clone(), current);
                            ingest_sheet_changes(&engine, &collection, notifications);
                        }
                        (previous, Err(err)) => {
                            snapshots.insert(collection.clone(), previous);
                            tracing::warn!(collection = %collection, error = %err, "failed to read sheet");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn initial_snapshots(sheet: &SheetFile) -> Result<SheetSnapshots, DaemonError> {
    let root = sheet.root();
    let mut snapshots = SheetSnapshots::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(snapshots),
        Err(err) => return Err(io_err(root, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(root, e))?;
        let Some(collection) = sheet.collection_for_path(&entry.path()) else {
            continue;
        };
        match sheet.load(&collection) {
            Ok(contents) => {
                snapshots.insert(collection, fingerprints(&contents));
            }
            Err(err) => {
                tracing::warn!(collection = %collection, error = %err, "skipping unreadable sheet");
            }
        }
    }
    Ok(snapshots)
}

/// Diff a collection's sheet file against `previous`. Returns the new
/// fingerprints and one notification per changed row, stamped with the
/// file's modification time.
pub(crate) fn scan_sheet(
    sheet: &SheetFile,
    collection: &CollectionName,
    previous: &RowFingerprints,
) -> Result<(RowFingerprints, Vec<ChangeNotification>), DaemonError> {
    let path = sheet.path_for(collection)?;
    let contents = sheet.load(collection)?;
    let modified: Option<DateTime<Utc>> = fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    let notifications = changed_rows(previous, &contents)
        .into_iter()
        .map(|(key, row)| ChangeNotification {
            collection: collection.clone(),
            key: Some(key.to_string()),
            fields: row,
            row: None,
            timestamp: modified,
        })
        .collect();
    Ok((fingerprints(&contents), notifications))
}

fn ingest_sheet_changes(
    engine: &SyncEngine,
    collection: &CollectionName,
    notifications: Vec<ChangeNotification>,
) {
    for notification in notifications {
        let key = notification.key.clone().unwrap_or_default();
        match engine.ingest(notification) {
            Ok(outcome) if outcome.verdict.queued => {
                tracing::info!(collection = %collection, key = %key, "sheet edit queued");
            }
            Ok(outcome) if outcome.verdict.conflict => {
                tracing::info!(collection = %collection, key = %key, "sheet edit lost to a newer pending write");
            }
            Ok(_) => {
                tracing::debug!(collection = %collection, key = %key, "sheet echo suppressed");
            }
            Err(err) => {
                tracing::warn!(collection = %collection, key = %key, error = %err, "invalid sheet row");
            }
        }
    }
}

/// Forwards hub events into a subscriber's socket writer.
struct SocketSink(mpsc::UnboundedSender<HubEvent>);

impl EventSink for SocketSink {
    fn send(&self, event: &HubEvent) -> Result<(), TransportError> {
        self.0
            .send(event.clone())
            .map_err(|_| TransportError("subscriber stream closed".to_string()))
    }
}

async fn socket_server_task(
    home: PathBuf,
    engine: Arc<SyncEngine>,
    started_at: DateTime<Utc>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let engine = engine.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, engine, started_at, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    engine: Arc<SyncEngine>,
    started_at: DateTime<Utc>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<DaemonRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "subscribe" => {
                let collection = collection_or_default(engine.config(), request.collection);
                return stream_events(engine, collection, lines, writer, shutdown_tx.subscribe()).await;
            }
            "flush" => {
                let engine = engine.clone();
                match tokio::task::spawn_blocking(move || engine.flush()).await {
                    Ok(outcome) => DaemonResponse::ok(json!(outcome)),
                    Err(err) => DaemonResponse::error(format!("flush join error: {err}")),
                }
            }
            "status" => DaemonResponse::ok(build_status_payload(&home, &engine, started_at)),
            "stop" => {
                let _ = shutdown_tx.send(());
                write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true }))).await?;
                break;
            }
            _ => dispatch(&engine, request),
        };

        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Handle the request/response commands that only touch in-memory state.
fn dispatch(engine: &SyncEngine, request: DaemonRequest) -> DaemonResponse {
    match request.cmd.as_str() {
        "ingest" => {
            let notification = ChangeNotification {
                collection: collection_or_default(engine.config(), request.collection),
                key: request.key,
                fields: request.fields.unwrap_or_default(),
                row: request.row,
                timestamp: request.timestamp,
            };
            match engine.ingest(notification) {
                Ok(outcome) => DaemonResponse::ok(json!(outcome)),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "write" => {
            let write = ClientWrite {
                collection: request.collection.map(CollectionName::from),
                key: request.key,
                fields: request.fields.unwrap_or_default(),
            };
            match engine.client_write(write) {
                Ok(outcome) => DaemonResponse::ok(json!(outcome)),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "poll" => {
            let collection = collection_or_default(engine.config(), request.collection);
            let since = request.since.unwrap_or(0);
            let changes = engine.versions().changes_since(&collection, since);
            DaemonResponse::ok(json!({
                "collection": collection,
                "changes": changes,
                "last_version": engine.versions().last_version(&collection),
            }))
        }
        "requeue-dead" => {
            let requeued = engine.requeue_dead_letters();
            DaemonResponse::ok(json!({ "requeued": requeued }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn collection_or_default(config: &SyncConfig, collection: Option<String>) -> CollectionName {
    collection
        .filter(|name| !name.trim().is_empty())
        .map(CollectionName::from)
        .unwrap_or_else(|| config.default_collection.clone())
}

/// Serve one subscription until the client hangs up, a write fails, or the
/// daemon shuts down. The hub registration is always removed on exit.
async fn stream_events(
    engine: Arc<SyncEngine>,
    collection: CollectionName,
    mut lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<HubEvent>();
    let id = match engine
        .hub()
        .subscribe(&collection, Arc::new(SocketSink(event_tx)))
    {
        Ok(id) => id,
        Err(err) => {
            write_response(&mut writer, &DaemonResponse::error(err.to_string())).await?;
            return Ok(());
        }
    };
    tracing::info!(collection = %collection, subscriber = %id, "subscriber connected");

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            event = event_rx.recv() => {
                // The sender lives in the hub; `None` means we were evicted.
                let Some(event) = event else { break Ok(()) };
                if let Err(err) = write_line(&mut writer, &event).await {
                    break Err(err);
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break Ok(()),
                }
            }
        }
    };

    engine.hub().unsubscribe(id);
    tracing::info!(collection = %collection, subscriber = %id, "subscriber disconnected");
    result
}

fn build_status_payload(home: &Path, engine: &SyncEngine, started_at: DateTime<Utc>) -> Value {
    json!({
        "running": true,
        "started_at": started_at,
        "default_collection": engine.config().default_collection,
        "engine": engine.status(),
        "socket": socket_path(home).display().to_string(),
        "sheets_dir": sheets_dir(home).display().to_string(),
    })
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [sheetbridge_root(home), sheets_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    write_line(writer, response).await
}

async fn write_line<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    message: &T,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(message)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use std::sync::Mutex;

    use serde_json::json;
    use sheetbridge_core::{FieldMap, RecordKey};
    use sheetbridge_sync::sheet::SheetContents;
    use sheetbridge_sync::{FlushOutcome, MemorySheet, RecordStore, SheetDocument, SheetWrite};
    use tempfile::TempDir;
    use tokio::time::advance;

    fn engine() -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                SyncConfig::default(),
                Arc::new(MemoryStore::new()),
                Arc::new(MemorySheet::new()),
            )
            .expect("engine"),
        )
    }

    fn row(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[derive(Default)]
    struct CountingSink {
        heartbeats: Mutex<usize>,
    }

    impl EventSink for CountingSink {
        fn send(&self, event: &HubEvent) -> Result<(), TransportError> {
            if matches!(event, HubEvent::Heartbeat { .. }) {
                *self.heartbeats.lock().unwrap() += 1;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let threshold = Duration::from_millis(100);
        let mut debounce = HashMap::<PathBuf, Instant>::new();
        let path = PathBuf::from("/tmp/orders.json");
        let mut triggers = 0usize;

        for _ in 0..5 {
            if should_process_event_with_threshold(&mut debounce, &path, Instant::now(), threshold)
            {
                triggers += 1;
            }
            advance(Duration::from_millis(10)).await;
        }

        advance(Duration::from_millis(150)).await;
        assert!(should_process_event_with_threshold(
            &mut debounce,
            &path,
            Instant::now(),
            threshold
        ));
        assert_eq!(triggers, 1, "rapid saves should collapse to one scan");
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn heartbeat_task_ticks_on_interval_until_shutdown() {
        let engine = engine();
        let sink = Arc::new(CountingSink::default());
        engine.hub().subscribe(&"orders".into(), sink.clone()).unwrap();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(heartbeat_task(
            engine.clone(),
            Duration::from_secs(25),
            shutdown_tx.subscribe(),
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(*sink.heartbeats.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn flush_task_drains_queue() {
        let engine = engine();
        engine
            .client_write(ClientWrite {
                key: Some("DH001".into()),
                fields: row(&[("status", json!("A"))]),
                ..Default::default()
            })
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(flush_task(
            engine.clone(),
            Duration::from_millis(20),
            shutdown_tx.subscribe(),
        ));

        for _ in 0..100 {
            if engine.queue().depth() == 0 && engine.status().last_flush.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(engine.queue().depth(), 0);
        assert_eq!(engine.store().count().unwrap(), 1);
    }

    #[test]
    fn dispatch_write_then_poll() {
        let engine = engine();
        let response = dispatch(
            &engine,
            DaemonRequest {
                key: Some("DH001".into()),
                fields: Some(row(&[("status", json!("A"))])),
                ..DaemonRequest::new("write")
            },
        );
        assert!(response.ok);
        assert_eq!(response.data.unwrap()["queued"], json!(true));

        assert!(matches!(engine.flush(), FlushOutcome::Completed(_)));

        let poll = dispatch(&engine, DaemonRequest::new("poll"));
        let data = poll.data.unwrap();
        assert_eq!(data["collection"], json!("orders"));
        assert_eq!(data["changes"].as_array().unwrap().len(), 1);
        assert_eq!(data["changes"][0]["key"], json!("DH001"));

        let last = data["last_version"].as_u64().unwrap();
        let after = dispatch(
            &engine,
            DaemonRequest {
                since: Some(last),
                ..DaemonRequest::new("poll")
            },
        );
        assert!(after.data.unwrap()["changes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn dispatch_rejects_invalid_and_unknown() {
        let engine = engine();
        let missing_key = dispatch(
            &engine,
            DaemonRequest {
                fields: Some(row(&[("Status", json!("x"))])),
                ..DaemonRequest::new("ingest")
            },
        );
        assert!(!missing_key.ok);
        assert_eq!(missing_key.error.as_deref(), Some("missing business key"));

        let unknown = dispatch(&engine, DaemonRequest::new("sync"));
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'sync'"));
    }

    #[test]
    fn dispatch_ingest_reports_version() {
        let engine = engine();
        let response = dispatch(
            &engine,
            DaemonRequest {
                collection: Some("orders".into()),
                key: Some("DH007".into()),
                fields: Some(row(&[("Status", json!("Packed"))])),
                ..DaemonRequest::new("ingest")
            },
        );
        let data = response.data.unwrap();
        assert_eq!(data["queued"], json!(true));
        assert!(data["version"].as_u64().is_some());
        assert_eq!(data["delivered"], json!(0));
    }

    #[test]
    fn status_payload_reports_engine_state() {
        let home = TempDir::new().expect("home");
        let engine = engine();
        engine
            .client_write(ClientWrite {
                key: Some("DH001".into()),
                fields: row(&[("price", json!(1))]),
                ..Default::default()
            })
            .unwrap();

        let payload = build_status_payload(home.path(), &engine, Utc::now());
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["engine"]["queue_depth"], json!(1));
        assert_eq!(payload["engine"]["flush_in_progress"], json!(false));
        assert_eq!(payload["engine"]["tracked_records"], json!(0));
        assert_eq!(payload["engine"]["subscribers"]["total_subscribers"], json!(0));
    }

    #[test]
    fn scan_sheet_reports_only_changed_rows() {
        let home = TempDir::new().expect("home");
        let sheet = SheetFile::new(sheets_dir(home.path()));
        let orders = CollectionName::from("orders");

        let mut rows = BTreeMap::new();
        rows.insert(RecordKey::from("DH001"), row(&[("Status", json!("Open"))]));
        rows.insert(RecordKey::from("DH002"), row(&[("Status", json!("Open"))]));
        let mut contents = SheetContents {
            updated_at: None,
            rows,
        };
        sheet.save(&orders, &contents).expect("save");

        let (baseline, first) = scan_sheet(&sheet, &orders, &RowFingerprints::new()).expect("scan");
        assert_eq!(first.len(), 2);

        contents
            .rows
            .insert(RecordKey::from("DH002"), row(&[("Status", json!("Shipped"))]));
        sheet.save(&orders, &contents).expect("save");

        let (_, changed) = scan_sheet(&sheet, &orders, &baseline).expect("scan");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key.as_deref(), Some("DH002"));
        assert!(changed[0].timestamp.is_some(), "stamped with file mtime");
    }

    #[test]
    fn mirror_write_echo_is_suppressed() {
        let home = TempDir::new().expect("home");
        let sheet = Arc::new(SheetFile::new(sheets_dir(home.path())));
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Arc::new(MemoryStore::new()),
            sheet.clone(),
        )
        .expect("engine");
        let orders = CollectionName::from("orders");

        engine
            .client_write(ClientWrite {
                key: Some("DH001".into()),
                fields: row(&[("status", json!("A"))]),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(engine.flush(), FlushOutcome::Completed(r) if r.propagated == 1));

        let (_, echoes) = scan_sheet(&sheet, &orders, &RowFingerprints::new()).expect("scan");
        assert_eq!(echoes.len(), 1);
        let outcome = engine.ingest(echoes[0].clone()).unwrap();
        assert!(!outcome.verdict.queued);
        assert!(!outcome.verdict.conflict);
        assert_eq!(engine.queue().depth(), 0);

        // A write of the identical row is hash-gated and leaves the file alone.
        let unchanged = sheet
            .write_row(&orders, &"DH001".into(), &row(&[("Status", json!("a"))]))
            .expect("write");
        assert_eq!(unchanged, SheetWrite::Unchanged);
    }

    #[test]
    fn blank_collection_falls_back_to_default() {
        let config = SyncConfig::default();
        assert_eq!(collection_or_default(&config, Some("  ".into())).as_str(), "orders");
        assert_eq!(collection_or_default(&config, Some("f3".into())).as_str(), "f3");
        assert_eq!(collection_or_default(&config, None).as_str(), "orders");
    }
}
