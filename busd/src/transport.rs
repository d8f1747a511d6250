//! Socket transport: newline-delimited JSON over a Unix domain socket.
//!
//! Each connection gets a reader loop and a writer task. Requests are run as
//! independent tasks so a parked `poll` never holds up later records on the
//! same connection; responses go out in completion order and clients match
//! them by `id`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::longpoll::ConnId;
use crate::protocol::{decode_request, encode_line, ErrorCode, Request, Response};

#[derive(Debug, PartialEq, Eq)]
pub enum Record {
    Line(Vec<u8>),
    /// Longer than the limit; the bytes up to the next newline were discarded.
    Oversized,
    Eof,
}

/// Read one newline-terminated record of at most `max` bytes into `buf`.
/// A final record without a trailing newline is still returned.
pub async fn read_record<R>(reader: &mut R, max: usize, buf: &mut Vec<u8>) -> io::Result<Record>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if overflow {
                Record::Oversized
            } else if buf.is_empty() {
                Record::Eof
            } else {
                Record::Line(std::mem::take(buf))
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = match newline {
            Some(index) => &available[..index],
            None => available,
        };
        if !overflow {
            if buf.len() + chunk.len() > max {
                overflow = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        let consumed = newline.map(|index| index + 1).unwrap_or(available.len());
        reader.consume(consumed);

        if newline.is_some() {
            return Ok(if overflow {
                Record::Oversized
            } else {
                Record::Line(std::mem::take(buf))
            });
        }
    }
}

struct OpenConnection {
    outbound: mpsc::UnboundedSender<String>,
    task: AbortHandle,
}

#[derive(Default)]
struct ConnectionsInner {
    next_id: AtomicU64,
    open: Mutex<HashMap<ConnId, OpenConnection>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Open connections plus the count of requests still being served.
#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<ConnectionsInner>,
}

/// Held for the lifetime of one request.
pub struct InFlight {
    inner: Arc<ConnectionsInner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ConnId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn remove(&self, id: ConnId) {
        self.inner.open.lock().await.remove(&id);
    }

    pub fn begin_request(&self) -> InFlight {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.open.lock().await.len()
    }

    /// Push one line to every open connection. Returns how many accepted it.
    pub async fn broadcast(&self, line: &str) -> usize {
        let open = self.inner.open.lock().await;
        open.values()
            .filter(|conn| conn.outbound.send(line.to_string()).is_ok())
            .count()
    }

    /// Wait until no request is in flight or `deadline` passes. Returns
    /// `true` when drained.
    pub async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Abort every connection task still running.
    pub async fn close_all(&self) -> usize {
        let mut open = self.inner.open.lock().await;
        let count = open.len();
        for (_, conn) in open.drain() {
            conn.task.abort();
        }
        count
    }
}

#[derive(Clone)]
pub struct Server {
    coordinator: Coordinator,
    connections: Connections,
    max_record_bytes: usize,
}

impl Server {
    pub fn new(coordinator: Coordinator, connections: Connections, max_record_bytes: usize) -> Self {
        Self {
            coordinator,
            connections,
            max_record_bytes,
        }
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn serve(&self, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_connection(stream).await,
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Accept loop stopped");
    }

    async fn spawn_connection(&self, stream: UnixStream) {
        let conn_id = self.connections.next_id();
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let server = self.clone();
        let sender = outbound.clone();

        // The map entry must exist before the task can remove it.
        let mut open = self.connections.inner.open.lock().await;
        let handle = tokio::spawn(async move {
            debug!(conn = conn_id, "Connection opened");
            if let Err(err) = server.handle_connection(stream, conn_id, sender, outbound_rx).await {
                debug!(conn = conn_id, "Connection error: {}", err);
            }
            debug!(conn = conn_id, "Connection closed");
        });
        open.insert(
            conn_id,
            OpenConnection {
                outbound,
                task: handle.abort_handle(),
            },
        );
    }

    async fn handle_connection(
        &self,
        stream: UnixStream,
        conn_id: ConnId,
        outbound: mpsc::UnboundedSender<String>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    debug!(conn = conn_id, "Write failed: {}", err);
                    break;
                }
            }
        });

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut requests = JoinSet::new();
        let result = loop {
            let record = match read_record(&mut reader, self.max_record_bytes, &mut buf).await {
                Ok(record) => record,
                Err(err) => break Err(err),
            };
            match record {
                Record::Eof => break Ok(()),
                Record::Oversized => {
                    warn!(conn = conn_id, limit = self.max_record_bytes, "Oversized record discarded");
                    send(
                        &outbound,
                        &Response::error(
                            Value::Null,
                            ErrorCode::InvalidParams,
                            format!("record exceeds {} bytes", self.max_record_bytes),
                        ),
                    );
                }
                Record::Line(line) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match decode_request(&line) {
                        Ok(request) => {
                            let guard = self.connections.begin_request();
                            let coordinator = self.coordinator.clone();
                            let outbound = outbound.clone();
                            requests.spawn(async move {
                                let _guard = guard;
                                let response = respond(&coordinator, request, Some(conn_id)).await;
                                send(&outbound, &response);
                            });
                        }
                        Err(err) => {
                            debug!(conn = conn_id, "Rejected record: {}", err.message);
                            send(&outbound, &Response::from(err));
                        }
                    }
                }
            }
            // Reap finished request tasks as we go.
            while requests.try_join_next().is_some() {}
        };

        // Parked polls from this connection are cancelled right away; other
        // requests still finish so their state changes are not lost.
        self.coordinator.disconnect(conn_id).await;
        while requests.join_next().await.is_some() {}

        drop(outbound);
        self.connections.remove(conn_id).await;
        if let Err(err) = writer_task.await {
            debug!(conn = conn_id, "Writer task ended abnormally: {}", err);
        }
        result
    }
}

/// Run one decoded request against the coordinator.
pub async fn respond(coordinator: &Coordinator, request: Request, conn: Option<ConnId>) -> Response {
    let operation = request.operation.name();
    match coordinator.execute(request.operation, conn).await {
        Ok(data) => Response::ok(request.id, data),
        Err(err) => {
            let code = err.code();
            debug!(operation, code = code.as_str(), "Request failed: {}", err);
            Response::error(request.id, code, err.to_string())
        }
    }
}

fn send(outbound: &mpsc::UnboundedSender<String>, response: &Response) {
    match encode_line(response) {
        Ok(line) => {
            // The peer may already be gone.
            let _ = outbound.send(line);
        }
        Err(err) => error!("Failed to encode response: {}", err),
    }
}
