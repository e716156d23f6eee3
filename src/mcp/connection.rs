//! JSON-RPC connection multiplexing concurrent requests over one pipe pair.
//!
//! A writer task owns the outbound half and a reader task owns the inbound
//! half, so callers never lock around I/O. Each request gets a fresh id and
//! a oneshot slot in the pending map; the reader completes the slot whose id
//! matches an incoming response and discards responses nobody is waiting for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rmcp::model::{ErrorCode, ErrorData};

use super::protocol::{decode_line, encode_line, Incoming, Notification, Request, RequestId, Response};
use crate::error::TurnloopError;

type Reply = Result<serde_json::Value, TurnloopError>;
type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>>;

/// Options for one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Name used in logs and error messages.
    pub label: String,
    /// Queue requests FIFO, one in flight at a time.
    pub sequential: bool,
}

/// Client side of a JSON-RPC peer reachable over a byte stream pair.
pub struct RpcConnection {
    label: String,
    next_id: AtomicI64,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<String>,
    /// Set when no further requests may be sent.
    stopping: CancellationToken,
    /// Set when the inbound stream has ended.
    closed: CancellationToken,
    /// Set when the writer task has closed the outbound stream.
    writer_done: CancellationToken,
    sequential: Option<tokio::sync::Mutex<()>>,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Start the reader and writer tasks over the given halves.
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::default();
        let (outbound, rx) = mpsc::unbounded_channel();
        let stopping = CancellationToken::new();
        let closed = CancellationToken::new();
        let writer_done = CancellationToken::new();

        tokio::spawn(write_loop(
            writer,
            rx,
            stopping.clone(),
            writer_done.clone(),
            options.label.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            outbound.clone(),
            closed.clone(),
            options.label.clone(),
        ));

        Self {
            label: options.label,
            next_id: AtomicI64::new(1),
            pending,
            outbound,
            stopping,
            closed,
            writer_done,
            sequential: options.sequential.then(|| tokio::sync::Mutex::new(())),
            reader,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the peer has gone away or the connection was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.stopping.is_cancelled()
    }

    /// Resolves once the inbound stream ends.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a request and await the response carrying the same id.
    ///
    /// On timeout or cancellation the pending slot is released and the peer
    /// is sent `notifications/cancelled` for that id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TurnloopError> {
        let exchange = self.exchange(method, params);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(TurnloopError::Cancelled(format!("{method} request cancelled")))
            }
            reply = tokio::time::timeout(timeout, exchange) => match reply {
                Ok(reply) => reply,
                Err(_) => Err(TurnloopError::Timeout(timeout.as_millis() as u64)),
            },
        }
    }

    /// Queue (in sequential mode), write the request and wait for its reply.
    /// Dropping this future mid-flight releases the slot through the guard.
    async fn exchange(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TurnloopError> {
        let _turn = match &self.sequential {
            Some(queue) => Some(queue.lock().await),
            None => None,
        };
        self.ensure_open()?;

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _guard = PendingGuard {
            id: id.clone(),
            pending: self.pending.clone(),
            outbound: self.outbound.clone(),
        };
        // The reader may have drained the map just before our insert.
        self.ensure_open()?;

        let line = encode_line(&Request::new(&id, method, params.as_ref()))?;
        debug!(connection = %self.label, %id, method, "-> request");
        self.outbound
            .send(line)
            .map_err(|_| self.closed_error())?;

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TurnloopError::Transport(format!(
                "{}: connection closed before response",
                self.label
            ))),
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TurnloopError> {
        self.ensure_open()?;
        let line = encode_line(&Notification::new(method, params.as_ref()))?;
        debug!(connection = %self.label, method, "-> notification");
        self.outbound.send(line).map_err(|_| self.closed_error())
    }

    /// Stop sending and close the outbound stream. Pending requests fail
    /// once the peer closes its side.
    pub async fn shutdown(&self) {
        self.stopping.cancel();
        self.writer_done.cancelled().await;
    }

    /// Fail everything pending and stop both tasks.
    pub fn abort(&self) {
        self.stopping.cancel();
        self.reader.abort();
        fail_pending(&self.pending, &self.label, "connection aborted");
        self.closed.cancel();
    }

    fn ensure_open(&self) -> Result<(), TurnloopError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> TurnloopError {
        TurnloopError::Transport(format!("{}: connection closed", self.label))
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.stopping.cancel();
        self.reader.abort();
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("label", &self.label)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Releases a pending slot when its request stops waiting. If no response
/// arrived, the peer is told the request was cancelled.
struct PendingGuard {
    id: RequestId,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<String>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if lock(&self.pending).remove(&self.id).is_none() {
            return;
        }
        let params = serde_json::json!({
            "requestId": self.id,
            "reason": "request abandoned by client",
        });
        if let Ok(line) = encode_line(&Notification::new("notifications/cancelled", Some(&params))) {
            let _ = self.outbound.send(line);
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    stopping: CancellationToken,
    done: CancellationToken,
    label: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            biased;
            _ = stopping.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = tokio::select! {
            biased;
            _ = stopping.cancelled() => break,
            written = write_frame(&mut writer, &line) => written,
        };
        if let Err(err) = written {
            warn!(connection = %label, error = %err, "write failed; stopping writer");
            stopping.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
    done.cancel();
    debug!(connection = %label, "outbound stream closed");
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn read_loop<R>(
    reader: R,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(connection = %label, error = %err, "read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(message) => dispatch(message, &pending, &outbound, &label),
            Err(err) => warn!(connection = %label, error = %err, "discarding unparseable frame"),
        }
    }

    closed.cancel();
    fail_pending(&pending, &label, "connection closed by peer");
    debug!(connection = %label, "inbound stream closed");
}

fn dispatch(
    message: Incoming,
    pending: &PendingMap,
    outbound: &mpsc::UnboundedSender<String>,
    label: &str,
) {
    match message {
        Incoming::Response { id, outcome } => {
            let slot = lock(pending).remove(&id);
            match slot {
                Some(tx) => {
                    debug!(connection = %label, %id, "<- response");
                    let _ = tx.send(outcome.map_err(TurnloopError::from));
                }
                None => warn!(connection = %label, %id, "discarding unmatched response"),
            }
        }
        Incoming::Request { id, method, .. } => {
            let reply = if method == "ping" {
                Response::success(&id, serde_json::json!({}))
            } else {
                debug!(connection = %label, %method, "rejecting server request");
                Response::failure(
                    &id,
                    ErrorData::new(
                        ErrorCode::METHOD_NOT_FOUND,
                        format!("method not found: {method}"),
                        None,
                    ),
                )
            };
            if let Ok(line) = encode_line(&reply) {
                let _ = outbound.send(line);
            }
        }
        Incoming::Notification { method, .. } => {
            debug!(connection = %label, %method, "<- notification (ignored)");
        }
        Incoming::Invalid(reason) => {
            warn!(connection = %label, %reason, "discarding invalid frame");
        }
    }
}

fn fail_pending(pending: &PendingMap, label: &str, why: &str) {
    let drained: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(TurnloopError::Transport(format!("{label}: {why}"))));
    }
}

fn lock(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// Scripted server side of a duplex pipe.
    struct Peer {
        lines: LinesStream<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn recv(&mut self) -> serde_json::Value {
            let line = self.lines.next().await.expect("frame").expect("io");
            serde_json::from_str(&line).expect("json")
        }

        async fn send(&mut self, value: serde_json::Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn pair(sequential: bool) -> (Arc<RpcConnection>, Peer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let connection = RpcConnection::new(
            client_read,
            client_write,
            ConnectionOptions {
                label: "test".into(),
                sequential,
            },
        );
        let peer = Peer {
            lines: LinesStream::new(BufReader::new(server_read).lines()),
            writer: server_write,
        };
        (Arc::new(connection), peer)
    }

    fn call(
        connection: &Arc<RpcConnection>,
        tag: &str,
        timeout: Duration,
    ) -> JoinHandle<Reply> {
        let connection = connection.clone();
        let params = json!({ "tag": tag });
        tokio::spawn(async move {
            connection
                .request("tools/call", Some(params), timeout, &CancellationToken::new())
                .await
        })
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (connection, mut peer) = pair(false);
        let budget = Duration::from_secs(5);

        let a = call(&connection, "a", budget);
        let first = peer.recv().await;
        let b = call(&connection, "b", budget);
        let second = peer.recv().await;
        let c = call(&connection, "c", budget);
        let third = peer.recv().await;

        // Answer N+1, then N-1, then N.
        for frame in [&third, &first, &second] {
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "result": { "tag": frame["params"]["tag"] },
            }))
            .await;
        }

        assert_eq!(a.await.unwrap().unwrap(), json!({ "tag": "a" }));
        assert_eq!(b.await.unwrap().unwrap(), json!({ "tag": "b" }));
        assert_eq!(c.await.unwrap().unwrap(), json!({ "tag": "c" }));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let (connection, mut peer) = pair(false);
        let _a = call(&connection, "a", Duration::from_secs(5));
        let _b = call(&connection, "b", Duration::from_secs(5));
        let first = peer.recv().await["id"].as_i64().unwrap();
        let second = peer.recv().await["id"].as_i64().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unmatched_responses_are_discarded() {
        let (connection, mut peer) = pair(false);
        let pending = call(&connection, "real", Duration::from_secs(5));
        let frame = peer.recv().await;

        peer.send(json!({ "jsonrpc": "2.0", "id": 999, "result": "stray" })).await;
        peer.send(json!({ "jsonrpc": "2.0", "id": frame["id"], "result": "mine" })).await;

        assert_eq!(pending.await.unwrap().unwrap(), json!("mine"));
    }

    #[tokio::test]
    async fn rpc_errors_are_surfaced() {
        let (connection, mut peer) = pair(false);
        let pending = call(&connection, "x", Duration::from_secs(5));
        let frame = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": frame["id"],
            "error": { "code": -32602, "message": "bad params" },
        }))
        .await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TurnloopError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn timeout_releases_slot_and_notifies_peer() {
        let (connection, mut peer) = pair(false);
        let pending = call(&connection, "slow", Duration::from_millis(30));
        let frame = peer.recv().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TurnloopError::Timeout(30)));
        assert_eq!(connection.pending_count(), 0);

        let cancelled = peer.recv().await;
        assert_eq!(cancelled["method"], "notifications/cancelled");
        assert_eq!(cancelled["params"]["requestId"], frame["id"]);
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_cancelled() {
        let (connection, mut peer) = pair(false);
        let cancel = CancellationToken::new();
        let task = {
            let connection = connection.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                connection
                    .request("tools/call", None, Duration::from_secs(5), &cancel)
                    .await
            })
        };
        let _ = peer.recv().await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.reason(), "cancelled");
        assert_eq!(peer.recv().await["method"], "notifications/cancelled");
    }

    #[tokio::test]
    async fn peer_close_fails_pending_requests() {
        let (connection, peer) = pair(false);
        let pending = call(&connection, "x", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(peer);

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_transport_failure());
        connection.closed().await;
        assert!(connection
            .request("ping", None, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err()
            .is_transport_failure());
    }

    #[tokio::test]
    async fn server_ping_is_answered_and_unknown_requests_rejected() {
        let (_connection, mut peer) = pair(false);

        peer.send(json!({ "jsonrpc": "2.0", "id": "p1", "method": "ping" })).await;
        let pong = peer.recv().await;
        assert_eq!(pong["id"], "p1");
        assert_eq!(pong["result"], json!({}));

        peer.send(json!({ "jsonrpc": "2.0", "id": 5, "method": "sampling/createMessage" }))
            .await;
        let rejected = peer.recv().await;
        assert_eq!(rejected["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn sequential_mode_keeps_one_request_in_flight() {
        let (connection, mut peer) = pair(true);
        let budget = Duration::from_secs(5);
        let a = call(&connection, "a", budget);
        let first = peer.recv().await;
        let b = call(&connection, "b", budget);

        // b must not be written while a is outstanding.
        let early = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(early.is_err());

        peer.send(json!({ "jsonrpc": "2.0", "id": first["id"], "result": 1 })).await;
        let second = peer.recv().await;
        assert_eq!(second["params"]["tag"], "b");
        peer.send(json!({ "jsonrpc": "2.0", "id": second["id"], "result": 2 })).await;

        assert_eq!(a.await.unwrap().unwrap(), json!(1));
        assert_eq!(b.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn shutdown_closes_outbound_stream() {
        let (connection, mut peer) = pair(false);
        connection.shutdown().await;

        assert!(peer.lines.next().await.is_none());
        assert!(connection.notify("notifications/initialized", None).is_err());
    }
}
