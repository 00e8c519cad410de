//! JSON-RPC session with an OVSDB server
//!
//! Messages are concatenated JSON values without framing. A reader task
//! routes replies to the pending callers by request id and answers the
//! server's "echo" keepalives; a writer task owns the write half.

use crate::{OvsdbError, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Decoder of a stream of concatenated JSON values
pub(crate) struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
    decoded: VecDeque<Value>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(64 * 1024),
            decoded: VecDeque::new(),
        }
    }

    /// Next complete message, `None` once the peer closed the stream
    pub(crate) async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(message) = self.decoded.pop_front() {
                return Ok(Some(message));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(OvsdbError::Disconnected)
                };
            }
            self.decode()?;
        }
    }

    fn decode(&mut self) -> Result<()> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(message)) => {
                    consumed = stream.byte_offset();
                    self.decoded.push_back(message);
                }
                // incomplete message, wait for more bytes
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        self.buf.drain(..consumed);
        Ok(())
    }
}

/// Multiplexed JSON-RPC client over one connection
#[derive(Debug)]
pub struct RpcClient {
    next_id: AtomicU64,
    pending: Pending,
    outgoing: UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl RpcClient {
    /// Start a session over an established stream
    pub fn new<S>(stream: S, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (outgoing, rx) = mpsc::unbounded_channel();
        let pending = Pending::default();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(write, rx, closed.clone()));
        tokio::spawn(read_loop(
            MessageReader::new(read),
            pending.clone(),
            outgoing.downgrade(),
            closed.clone(),
        ));

        Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            closed,
            timeout,
        }
    }

    /// Connect to `tcp:host:port` or `unix:/path`. A comma separated list is
    /// tried in order, as for a clustered database.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let mut last_error = None;
        for target in address.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Self::connect_one(target, timeout).await {
                Ok(client) => {
                    info!("Connected to OVSDB server at {}", target);
                    return Ok(client);
                }
                Err(e) => {
                    warn!("Failed to connect to OVSDB server at {}: {}", target, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| OvsdbError::InvalidAddress(address.to_string())))
    }

    async fn connect_one(target: &str, timeout: Duration) -> Result<Self> {
        let (scheme, rest) = target
            .split_once(':')
            .ok_or_else(|| OvsdbError::InvalidAddress(target.to_string()))?;
        match scheme {
            "tcp" => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect(rest))
                    .await
                    .map_err(|_| OvsdbError::Timeout(timeout))??;
                stream.set_nodelay(true)?;
                Ok(Self::new(stream, timeout))
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(rest))
                    .await
                    .map_err(|_| OvsdbError::Timeout(timeout))??;
                Ok(Self::new(stream, timeout))
            }
            _ => Err(OvsdbError::InvalidAddress(format!("unsupported scheme in {}", target))),
        }
    }

    /// Whether the connection is gone; every further call fails
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_vec(&json!({
            "method": method,
            "params": params,
            "id": id,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // the reader marks the session closed before failing pending calls
        if self.is_closed() || self.outgoing.send(request).is_err() {
            self.pending.lock().remove(&id);
            return Err(OvsdbError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(OvsdbError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(OvsdbError::Timeout(self.timeout))
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: UnboundedReceiver<Vec<u8>>, closed: Arc<AtomicBool>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write to OVSDB server: {}", e);
            closed.store(true, Ordering::SeqCst);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut reader: MessageReader<R>,
    pending: Pending,
    outgoing: WeakUnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Ok(Some(message)) => dispatch(message, &pending, &outgoing),
            Ok(None) => {
                debug!("OVSDB server closed the connection");
                break;
            }
            Err(e) => {
                warn!("OVSDB connection failed: {}", e);
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // dropping the senders fails every waiting call
    pending.lock().clear();
}

fn dispatch(message: Value, pending: &Pending, outgoing: &WeakUnboundedSender<Vec<u8>>) {
    match message.get("method").and_then(Value::as_str) {
        Some("echo") => {
            let reply = json!({
                "id": message["id"].clone(),
                "result": message["params"].clone(),
                "error": null,
            });
            if let (Some(tx), Ok(bytes)) = (outgoing.upgrade(), serde_json::to_vec(&reply)) {
                let _ = tx.send(bytes);
            }
            return;
        }
        Some(method) => {
            debug!("Ignoring OVSDB notification {}", method);
            return;
        }
        None => {}
    }

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        debug!("Ignoring OVSDB reply without a request id");
        return;
    };
    let Some(tx) = pending.lock().remove(&id) else {
        debug!("Ignoring OVSDB reply to unknown request {}", id);
        return;
    };
    let reply = match message.get("error") {
        Some(error) if !error.is_null() => Err(OvsdbError::Rpc(error_text(error))),
        _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(reply);
}

fn error_text(error: &Value) -> String {
    match error.as_str() {
        Some(text) => text.to_string(),
        None => error.to_string(),
    }
}
