//! Duplex RPC over one stream connection.
//!
//! `RpcChannel` is the supervisor end: it multiplexes concurrent calls over
//! the connection and hands worker pushes to a registered handler.
//! `ServerChannel` is the worker end. Both sides own a writer task fed by a
//! queue, so any task can send without holding the stream.
//!
//! A single reader task per side processes frames in arrival order, so a
//! push written before a response is handled before that response resolves
//! its call.
//!
//! Frames are encoded by the sender before they are queued. An oversized
//! frame is therefore refused at its source and never reaches the stream;
//! a failed write on the stream closes the whole connection.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::protocol::{
    Frame, Push, Request, Response, decode_frame, encode_frame, read_frame, write_frame,
};

type PushHandler = Arc<dyn Fn(Push) + Send + Sync>;
type PendingCalls = Arc<Mutex<FxHashMap<u64, oneshot::Sender<Result<Response>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_error() -> Error {
    Error::RpcCommunicationFailure("connection to worker closed".to_string())
}

/// Drain the outgoing queue into the write half until the queue closes,
/// a write fails or `shutdown` fires.
///
/// A failed write cancels `shutdown`, which also stops this side's reader,
/// so the peer sees the connection close instead of a silent half-open
/// stream.
fn spawn_writer<S>(
    mut writer: WriteHalf<S>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let bytes = tokio::select! {
                biased;
                bytes = outgoing.recv() => bytes,
                _ = shutdown.cancelled() => None,
            };
            let Some(bytes) = bytes else {
                break;
            };
            let written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                tracing::warn!("Write to peer failed; closing connection: {}", e);
                shutdown.cancel();
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Supervisor end of the duplex channel.
pub struct RpcChannel {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingCalls,
    push_handler: Arc<RwLock<Option<PushHandler>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    remote_pid: u32,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcChannel {
    /// Connect to a worker listening at `address` and present `token`.
    pub async fn connect(address: &Path, token: &str) -> Result<Self> {
        let stream = UnixStream::connect(address).await.map_err(|e| {
            Error::ConnectFailure(format!("{}: {}", address.display(), e))
        })?;
        Self::handshake(stream, token).await
    }

    /// Perform the token handshake over an established stream.
    pub async fn handshake<S>(stream: S, token: &str) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(
            &mut writer,
            &Frame::Hello {
                token: token.to_string(),
            },
        )
        .await
        .map_err(|e| Error::ConnectFailure(format!("failed to send handshake: {}", e)))?;

        let body = read_frame(&mut reader)
            .await
            .map_err(|e| Error::ConnectFailure(format!("failed to read handshake: {}", e)))?
            .ok_or_else(|| {
                Error::ConnectFailure("connection closed during handshake".to_string())
            })?;

        let remote_pid = match decode_frame(&body)? {
            Frame::Welcome { pid } => pid,
            Frame::Rejected { reason } => {
                return Err(Error::ConnectFailure(format!(
                    "handshake rejected: {}",
                    reason
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected frame during handshake: {:?}",
                    other
                )));
            }
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(FxHashMap::default()));
        let push_handler: Arc<RwLock<Option<PushHandler>>> = Arc::new(RwLock::new(None));
        let closed = CancellationToken::new();

        let writer = spawn_writer(writer, outgoing_rx, closed.clone());
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            push_handler.clone(),
            closed.clone(),
        ));

        Ok(Self {
            outgoing,
            pending,
            push_handler,
            next_id: AtomicU64::new(1),
            closed,
            remote_pid,
            reader,
            writer,
        })
    }

    /// Process id the worker reported in its `Welcome`.
    pub fn remote_pid(&self) -> u32 {
        self.remote_pid
    }

    /// Register the handler for worker pushes, replacing any previous one.
    ///
    /// The handler runs on the reader task and must not block.
    pub fn on_push(&self, handler: impl Fn(Push) + Send + Sync + 'static) {
        let handler: PushHandler = Arc::new(handler);
        *self
            .push_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with `RpcCommunicationFailure` if the connection closes first
    /// or `timeout` elapses, with `Remote` if the worker reports an error
    /// for this request, and with `Protocol` if the request is too large to
    /// send.
    pub async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = request.name();
        let bytes = encode_frame(&Frame::Request { id, body: request })?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // The reader marks the channel closed before draining `pending`, so
        // a call registered after the drain is caught here.
        if self.closed.is_cancelled() {
            lock(&self.pending).remove(&id);
            return Err(closed_error());
        }
        if self.outgoing.send(bytes).is_err() {
            lock(&self.pending).remove(&id);
            return Err(closed_error());
        }

        tracing::debug!("Sent {} request {}", name, id);

        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    lock(&self.pending).remove(&id);
                    return Err(Error::RpcCommunicationFailure(format!(
                        "{} call timed out after {:?}",
                        name, limit
                    )));
                }
            },
            None => rx.await,
        };

        response.map_err(|_| closed_error())?
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    pending: PendingCalls,
    push_handler: Arc<RwLock<Option<PushHandler>>>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let read = tokio::select! {
            read = read_frame(&mut reader) => read,
            _ = closed.cancelled() => {
                tracing::debug!("Connection shut down locally");
                break;
            }
        };
        let body = match read {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!("Worker connection closed");
                break;
            }
            Err(e) => {
                tracing::warn!("Worker connection failed: {}", e);
                break;
            }
        };

        match decode_frame(&body) {
            Ok(Frame::Response { id, body }) => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body.map_err(Error::Remote));
                    }
                    None => tracing::debug!("Dropping response for abandoned call {}", id),
                }
            }
            Ok(Frame::Push { body }) => {
                let handler = push_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler(body),
                    None => tracing::debug!("No push handler registered; dropping push"),
                }
            }
            Ok(other) => tracing::warn!("Ignoring unexpected frame from worker: {:?}", other),
            Err(e) => tracing::warn!("Skipping malformed frame from worker: {}", e),
        }
    }

    closed.cancel();
    let waiters = std::mem::take(&mut *lock(&pending));
    for (_, tx) in waiters {
        let _ = tx.send(Err(closed_error()));
    }
}

/// Worker end of the duplex channel.
pub struct ServerChannel<S> {
    reader: ReadHalf<S>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl<S> ServerChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wait for the supervisor's `Hello` and check its token.
    ///
    /// A mismatched token is answered with `Rejected` and fails with
    /// `ConnectFailure`.
    pub async fn accept(stream: S, token: &str, pid: u32) -> Result<Self> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let body = read_frame(&mut reader).await?.ok_or_else(|| {
            Error::ConnectFailure("connection closed before handshake".to_string())
        })?;

        match decode_frame(&body)? {
            Frame::Hello { token: presented } if presented == token => {}
            Frame::Hello { .. } => {
                let _ = write_frame(
                    &mut writer,
                    &Frame::Rejected {
                        reason: "invalid handshake token".to_string(),
                    },
                )
                .await;
                return Err(Error::ConnectFailure(
                    "client presented an invalid handshake token".to_string(),
                ));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected hello, got {:?}",
                    other
                )));
            }
        }

        write_frame(&mut writer, &Frame::Welcome { pid }).await?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        spawn_writer(writer, outgoing_rx, shutdown.clone());

        Ok(Self {
            reader,
            outgoing,
            shutdown,
        })
    }

    /// Next request from the supervisor, or `None` once the connection
    /// closes or a write to it has failed. Malformed frames are skipped.
    pub async fn next_request(&mut self) -> Result<Option<(u64, Request)>> {
        loop {
            let read = tokio::select! {
                read = read_frame(&mut self.reader) => read?,
                _ = self.shutdown.cancelled() => None,
            };
            let Some(body) = read else {
                return Ok(None);
            };
            match decode_frame(&body) {
                Ok(Frame::Request { id, body }) => return Ok(Some((id, body))),
                Ok(other) => tracing::warn!("Ignoring unexpected frame: {:?}", other),
                Err(e) => tracing::warn!("Skipping malformed frame: {}", e),
            }
        }
    }

    pub fn responder(&self) -> Responder {
        Responder {
            outgoing: self.outgoing.clone(),
        }
    }

    pub fn push_sender(&self) -> PushSender {
        PushSender {
            outgoing: self.outgoing.clone(),
        }
    }
}

impl<S> Drop for ServerChannel<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sends responses back over a `ServerChannel`.
#[derive(Clone)]
pub struct Responder {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl Responder {
    /// Queue the response to request `id`.
    ///
    /// A response too large to send is replaced by an error response, so
    /// the caller is answered either way.
    pub fn respond(&self, id: u64, body: Result<Response>) {
        let body = body.map_err(|e| match e {
            Error::Remote(message) => message,
            other => other.to_string(),
        });
        let bytes = match encode_frame(&Frame::Response { id, body }) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Response {} could not be sent: {}", id, e);
                let body = Err(format!("response could not be sent: {}", e));
                match encode_frame(&Frame::Response { id, body }) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Dropping response {}: {}", id, e);
                        return;
                    }
                }
            }
        };
        if self.outgoing.send(bytes).is_err() {
            tracing::debug!("Connection closed before response {} was sent", id);
        }
    }
}

/// Sends pushes to the supervisor.
#[derive(Clone)]
pub struct PushSender {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl PushSender {
    /// Queue a push. Fails once the connection's writer has stopped, or
    /// with `Protocol` if the push is too large to send.
    pub fn push(&self, body: Push) -> Result<()> {
        let bytes = encode_frame(&Frame::Push { body })?;
        self.outgoing
            .send(bytes)
            .map_err(|_| Error::RpcCommunicationFailure("supervisor disconnected".to_string()))
    }

    /// A sender whose pushes are decoded into a local queue, for tests.
    #[cfg(test)]
    pub(crate) fn pair() -> (Self, FrameReceiver) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (Self { outgoing }, FrameReceiver { rx })
    }
}

/// Receiving end of `PushSender::pair`.
#[cfg(test)]
pub(crate) struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[cfg(test)]
impl FrameReceiver {
    pub(crate) fn try_recv(&mut self) -> std::result::Result<Frame, mpsc::error::TryRecvError> {
        let bytes = self.rx.try_recv()?;
        Ok(decode_frame(&bytes[4..]).unwrap())
    }
}
