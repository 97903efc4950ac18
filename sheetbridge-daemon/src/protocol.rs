use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sheetbridge_core::FieldMap;
use sheetbridge_sync::HubEvent;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    home: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket_path(home), e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

pub fn request_flush(home: &Path) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, &DaemonRequest::new("flush"))?)
}

pub fn request_requeue_dead(home: &Path) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, &DaemonRequest::new("requeue-dead"))?)
}

pub fn request_write(
    home: &Path,
    collection: Option<String>,
    key: String,
    fields: FieldMap,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        collection,
        key: Some(key),
        fields: Some(fields),
        ..DaemonRequest::new("write")
    };
    response_into_data(send_request(home, &request)?)
}

pub fn request_ingest(
    home: &Path,
    collection: Option<String>,
    key: String,
    fields: FieldMap,
    timestamp: Option<DateTime<Utc>>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        collection,
        key: Some(key),
        fields: Some(fields),
        timestamp,
        ..DaemonRequest::new("ingest")
    };
    response_into_data(send_request(home, &request)?)
}

pub fn request_poll(
    home: &Path,
    collection: Option<String>,
    since: u64,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        collection,
        since: Some(since),
        ..DaemonRequest::new("poll")
    };
    response_into_data(send_request(home, &request)?)
}

/// Open a subscription stream and hand each event to `on_event` until it
/// returns `false` or the daemon closes the stream.
pub fn subscribe<F>(home: &Path, collection: Option<String>, mut on_event: F) -> Result<(), DaemonError>
where
    F: FnMut(HubEvent) -> bool,
{
    let mut stream = connect(home)?;
    let request = DaemonRequest {
        collection,
        ..DaemonRequest::new("subscribe")
    };
    write_request(&mut stream, home, &request)?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.map_err(|e| io_err(socket_path(home), e))?;
        if line.trim().is_empty() {
            continue;
        }
        // A refused subscription comes back as a plain error response.
        if let Ok(response) = serde_json::from_str::<DaemonResponse>(&line) {
            return response_into_data(response).map(|_| ());
        }
        let event: HubEvent = serde_json::from_str(&line)?;
        if !on_event(event) {
            break;
        }
    }
    Ok(())
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
