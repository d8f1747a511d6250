//! busd client library
//!
//! One connection to the broker socket, shared by any number of concurrent
//! calls. Responses are matched to calls by request id, so a long `poll` does
//! not hold up a `submit` made on the same client.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::unix::OwnedWriteHalf;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SOCKET_ENV: &str = "BUSD_SOCKET";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected")]
    Disconnected,
    #[error("broker not available at {}: {source}", .path.display())]
    BrokerUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

impl ClientError {
    /// Wire error code when the broker rejected the call.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireResponse {
    id: Value,
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Unsolicited broker record, e.g. the shutdown notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub event: String,
    pub message: String,
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub worker: String,
    pub registered: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub title: Option<String>,
    pub assigned_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOutcome {
    pub task: Option<TaskAssignment>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckOutcome {
    pub worker: String,
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub task_id: String,
    pub worker: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: String,
    pub title: Option<String>,
    pub queued: bool,
    pub assigned_to: Option<String>,
    pub delivered: bool,
    pub queue_position: Option<usize>,
    #[serde(default)]
    pub previous_failure: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub worker: String,
    pub status: String,
    pub requeued_task: Option<String>,
}

type Waiting = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, ClientError>>>>>;

/// Connection to a running broker.
#[cfg(unix)]
pub struct BusClient {
    writer: Mutex<OwnedWriteHalf>,
    waiting: Waiting,
    notices: watch::Receiver<Option<Notice>>,
    reader: JoinHandle<()>,
}

#[cfg(unix)]
impl BusClient {
    pub async fn connect<P: AsRef<Path>>(sock: P) -> Result<Self, ClientError> {
        let path = sock.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::BrokerUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Connected to {}", path.display());

        let (reader, writer) = stream.into_split();
        let waiting: Waiting = Arc::default();
        let (notice_tx, notices) = watch::channel(None);
        let reader = tokio::spawn(read_responses(
            BufReader::new(reader),
            waiting.clone(),
            notice_tx,
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            waiting,
            notices,
            reader,
        })
    }

    /// Connect to the socket named by `BUSD_SOCKET`, else the one derived
    /// from the current directory.
    pub async fn connect_default() -> Result<Self, ClientError> {
        Self::connect(default_socket_path()).await
    }

    /// Send one operation and wait for its response `data`.
    pub async fn call(&self, operation: &str, params: Value) -> Result<Value, ClientError> {
        let id = Uuid::new_v4().to_string();
        let line = serde_json::to_string(&json!({
            "id": id,
            "operation": operation,
            "params": params,
        }))
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))?
            + "\n";

        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id.clone(), tx);

        let written = {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await
        };
        if let Err(err) = written {
            self.waiting.lock().await.remove(&id);
            return Err(err.into());
        }

        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    async fn call_typed<T: DeserializeOwned>(&self, operation: &str, params: Value) -> Result<T, ClientError> {
        let data = self.call(operation, params).await?;
        serde_json::from_value(data)
            .map_err(|err| ClientError::InvalidResponse(format!("{operation}: {err}")))
    }

    pub async fn register(&self, name: &str) -> Result<Registration, ClientError> {
        self.call_typed("register", json!({ "name": name })).await
    }

    /// Long-poll for a task; `None` uses the broker's default timeout.
    pub async fn poll(&self, name: &str, timeout: Option<Duration>) -> Result<PollOutcome, ClientError> {
        let mut params = json!({ "name": name });
        if let Some(timeout) = timeout {
            params["timeout_ms"] = json!(timeout.as_millis() as u64);
        }
        self.call_typed("poll", params).await
    }

    /// Poll until a task arrives.
    pub async fn wait_for_task(&self, name: &str, poll_timeout: Duration) -> Result<TaskAssignment, ClientError> {
        loop {
            let outcome = self.poll(name, Some(poll_timeout)).await?;
            if let Some(task) = outcome.task {
                return Ok(task);
            }
            debug!(worker = %name, "Poll timed out; polling again");
        }
    }

    pub async fn ack(&self, name: &str, task_id: &str) -> Result<AckOutcome, ClientError> {
        self.call_typed("ack", json!({ "name": name, "task_id": task_id }))
            .await
    }

    pub async fn done(&self, task_id: &str) -> Result<Release, ClientError> {
        self.call_typed("done", json!({ "task_id": task_id })).await
    }

    pub async fn failed(&self, task_id: &str, reason: &str) -> Result<Release, ClientError> {
        self.call_typed("failed", json!({ "task_id": task_id, "reason": reason }))
            .await
    }

    pub async fn submit(&self, task_id: &str) -> Result<Submission, ClientError> {
        self.call_typed("submit", json!({ "task_id": task_id })).await
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call("get_status", json!({})).await
    }

    pub async fn reset_worker(&self, name: &str) -> Result<ResetOutcome, ClientError> {
        self.call_typed("reset_worker", json!({ "name": name })).await
    }

    pub async fn retry_task(&self, task_id: &str) -> Result<Submission, ClientError> {
        self.call_typed("retry_task", json!({ "task_id": task_id }))
            .await
    }

    /// Resolves once the broker announces it is shutting down.
    pub async fn shutdown_notice(&self) -> Option<Notice> {
        let mut notices = self.notices.clone();
        loop {
            if let Some(notice) = notices.borrow_and_update().clone() {
                if notice.event == "shutdown" {
                    return Some(notice);
                }
            }
            if notices.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(unix)]
impl Drop for BusClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses<R>(mut reader: R, waiting: Waiting, notices: watch::Sender<Option<Notice>>)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("Failed to read from broker: {}", err);
                break;
            }
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!("Unparsable record from broker: {}", err);
                continue;
            }
        };

        if value.get("event").is_some() {
            match serde_json::from_value::<Notice>(value) {
                Ok(notice) => {
                    info!(event = %notice.event, "Broker notice: {}", notice.message);
                    let _ = notices.send(Some(notice));
                }
                Err(err) => warn!("Malformed notice: {}", err),
            }
            continue;
        }

        let response: WireResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(err) => {
                warn!("Malformed response: {}", err);
                continue;
            }
        };
        let Some(id) = response.id.as_str().map(str::to_string) else {
            warn!(
                "Broker rejected a record: {}",
                response.message.as_deref().unwrap_or("no message")
            );
            continue;
        };
        let Some(tx) = waiting.lock().await.remove(&id) else {
            debug!(%id, "Response for unknown request");
            continue;
        };

        let result = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Remote {
                code: response.error_code.unwrap_or_else(|| "INTERNAL".to_string()),
                message: response.message.unwrap_or_default(),
            })
        };
        let _ = tx.send(result);
    }

    // Dropping the senders fails every outstanding call with `Disconnected`.
    waiting.lock().await.clear();
}

fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// Socket a broker started in `dir` listens on.
pub fn project_socket_path(dir: &Path) -> PathBuf {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let tag = hex::encode(Sha256::digest(canonical.to_string_lossy().as_bytes()));
    runtime_dir().join(format!("busd-{}.sock", &tag[..16]))
}

pub fn default_socket_path() -> PathBuf {
    if let Some(socket) = std::env::var_os(SOCKET_ENV).filter(|s| !s.is_empty()) {
        return PathBuf::from(socket);
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    project_socket_path(&cwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_socket_name_is_short_hash() {
        let dir = std::env::temp_dir();
        let path = project_socket_path(&dir);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("busd-"));
        assert_eq!(name.len(), 5 + 16 + 5);
        assert_eq!(path, project_socket_path(&dir));
    }

    #[test]
    fn remote_errors_expose_their_code() {
        let err = ClientError::Remote {
            code: "UNKNOWN_WORKER".into(),
            message: "unknown worker 'w'".into(),
        };
        assert_eq!(err.code(), Some("UNKNOWN_WORKER"));
        assert_eq!(err.to_string(), "UNKNOWN_WORKER: unknown worker 'w'");
        assert_eq!(ClientError::Disconnected.code(), None);
    }

    #[tokio::test]
    async fn reader_routes_responses_and_notices() {
        let input = concat!(
            "{\"id\":\"b\",\"success\":false,\"error_code\":\"TASK_MISMATCH\",\"message\":\"nope\"}\n",
            "{\"event\":\"shutdown\",\"message\":\"bye\",\"drain_timeout_ms\":5000}\n",
            "{\"id\":\"a\",\"success\":true,\"data\":{\"ok\":1}}\n",
        );
        let waiting: Waiting = Arc::default();
        let (a_tx, a_rx) = oneshot::channel();
        let (b_tx, b_rx) = oneshot::channel();
        let (c_tx, c_rx) = oneshot::channel();
        {
            let mut map = waiting.lock().await;
            map.insert("a".to_string(), a_tx);
            map.insert("b".to_string(), b_tx);
            map.insert("c".to_string(), c_tx);
        }
        let (notice_tx, notice_rx) = watch::channel(None);

        read_responses(BufReader::new(input.as_bytes()), waiting.clone(), notice_tx).await;

        assert_eq!(a_rx.await.unwrap().unwrap(), json!({"ok": 1}));
        let err = b_rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some("TASK_MISMATCH"));
        // Never answered: the sender is dropped when the stream ends.
        assert!(c_rx.await.is_err());
        assert_eq!(notice_rx.borrow().as_ref().map(|n| n.event.as_str()), Some("shutdown"));
    }
}
