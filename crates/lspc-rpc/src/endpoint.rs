//! JSON-RPC endpoint over a pair of byte streams.
//!
//! Owns the outbound writer, the local id counter and the pending-request
//! registry. A background reader task decodes inbound frames and dispatches
//! them strictly in arrival order:
//! - responses resolve the pending call with the same id
//! - peer requests and notifications go to handlers registered with [`RpcEndpoint::on`]

use crate::codec::{FrameStream, encode_frame};
use crate::error::RpcError;
use crate::jsonrpc::{Message, Notification, Request, RequestId, Response, ResponseError};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Handler = Arc<dyn Fn(&Incoming) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&RpcError) + Send + Sync>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = oneshot::Sender<Result<Value, ResponseError>>;

/// How long [`RpcEndpoint::close`] waits to flush and shut down the writer.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A request or notification sent to us by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub method: String,
    /// Set for peer requests; pass it to [`RpcEndpoint::respond`].
    pub id: Option<RequestId>,
    pub params: Option<Value>,
}

impl Incoming {
    /// Whether the peer expects a reply.
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }

    /// Deserialize the params into a concrete type (`null` when absent).
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }
}

/// Which inbound messages a handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accepts {
    All,
    Requests,
    Notifications,
}

impl Accepts {
    fn matches(self, incoming: &Incoming) -> bool {
        match self {
            Accepts::All => true,
            Accepts::Requests => incoming.is_request(),
            Accepts::Notifications => !incoming.is_request(),
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Handler,
    accepts: Accepts,
    /// Dropped from the registry after the first message it accepts.
    once: bool,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<i64, Reply>,
    closed: bool,
}

struct Shared {
    next_id: AtomicI64,
    writer: tokio::sync::Mutex<BoxWriter>,
    pending: Mutex<Pending>,
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    unhandled: Mutex<Option<Handler>>,
    attached: AtomicBool,
    cancel: CancellationToken,
}

/// Client side of a JSON-RPC connection.
///
/// Cloning is cheap and every clone talks to the same connection, so a
/// handler can capture a clone to reply to peer requests.
#[derive(Clone)]
pub struct RpcEndpoint {
    shared: Arc<Shared>,
}

impl RpcEndpoint {
    /// Create an endpoint that writes to `writer`. Nothing is read until
    /// [`attach`](Self::attach) is called, so handlers registered before
    /// that see every inbound message.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicI64::new(0),
                writer: tokio::sync::Mutex::new(Box::new(writer)),
                pending: Mutex::new(Pending::default()),
                handlers: Mutex::new(HashMap::new()),
                error_handlers: Mutex::new(Vec::new()),
                unhandled: Mutex::new(None),
                attached: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Create an endpoint and immediately start reading from `reader`.
    pub fn connect<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let endpoint = Self::new(writer);
        endpoint.shared.attached.store(true, Ordering::SeqCst);
        tokio::spawn(read_loop(Arc::clone(&endpoint.shared), reader));
        endpoint
    }

    /// Start the background reader task on `reader`.
    ///
    /// The task ends on EOF, on the first framing error, or on
    /// [`close`](Self::close). Pending calls are rejected with
    /// [`RpcError::ConnectionClosed`] when it ends.
    pub fn attach<R>(&self, reader: R) -> Result<JoinHandle<()>, RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.shared.attached.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyAttached);
        }
        Ok(tokio::spawn(read_loop(Arc::clone(&self.shared), reader)))
    }

    /// Send a request and wait for the peer's result.
    ///
    /// Params that serialize to `null` (such as `()`) are left off the wire.
    pub async fn call<R>(&self, method: &str, params: impl Serialize) -> Result<R, RpcError>
    where
        R: DeserializeOwned,
    {
        let params = to_params(params)?;
        let result = self.call_raw(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request with untyped params and return the untyped result.
    pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.shared.register(id)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let request = Request::new(RequestId::Number(id), method, params);
        self.shared.write(&request).await?;

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RpcError::Remote(error)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Send a notification. No id is consumed and no reply is expected.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), RpcError> {
        let notification = Notification::new(method, to_params(params)?);
        self.shared.write(&notification).await
    }

    /// Reply to a peer request with a result.
    pub async fn respond(&self, id: RequestId, result: impl Serialize) -> Result<(), RpcError> {
        let response = Response::success(id, serde_json::to_value(result)?);
        self.shared.write(&response).await
    }

    /// Reply to a peer request with an error.
    pub async fn respond_error(&self, id: RequestId, error: ResponseError) -> Result<(), RpcError> {
        self.shared.write(&Response::failure(id, error)).await
    }

    /// Register a handler for inbound requests and notifications named
    /// `method`. Handlers run in registration order on the reader task, so
    /// they must not block; spawn a task to do async work such as replying.
    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        self.shared.subscribe(method.into(), Arc::new(handler), Accepts::All, false);
    }

    /// Like [`on`](Self::on), but only for peer requests. A request counts
    /// as handled only when a handler that accepts requests exists.
    pub fn on_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        self.shared
            .subscribe(method.into(), Arc::new(handler), Accepts::Requests, false);
    }

    /// Like [`on`](Self::on), but only for notifications.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        self.shared
            .subscribe(method.into(), Arc::new(handler), Accepts::Notifications, false);
    }

    /// Wait for the next inbound message named `method`.
    ///
    /// The subscription is registered when this is called, not when the
    /// future is first polled, and is removed once a message is delivered.
    pub fn once(&self, method: impl Into<String>) -> BoxFuture<'static, Result<Incoming, RpcError>> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handler: Handler = Arc::new(move |incoming: &Incoming| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(incoming.clone());
            }
        });
        self.shared.subscribe(method.into(), handler, Accepts::All, true);

        Box::pin(async move { rx.await.map_err(|_| RpcError::ConnectionClosed) })
    }

    /// Set a fallback for peer requests that no handler is registered for,
    /// typically to reply with [`ResponseError::method_not_found`]. Without
    /// one such requests get no reply. Notifications never reach it.
    pub fn on_unhandled_request<F>(&self, handler: F)
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        *self.shared.unhandled.lock() = Some(Arc::new(handler));
    }

    /// Register a handler for errors raised on the read path: unmatched
    /// responses, unclassifiable or invalid frames, and framing errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        self.shared.error_handlers.lock().push(Arc::new(handler));
    }

    /// Dispatch one decoded payload as if it had been read from the stream.
    pub fn dispatch(&self, payload: &[u8]) {
        self.shared.dispatch(payload);
    }

    /// Stop reading, reject pending calls and shut down the writer.
    ///
    /// A write stuck on a peer that stopped reading holds the writer, so the
    /// shutdown is abandoned after [`WRITER_SHUTDOWN_TIMEOUT`].
    pub async fn close(&self) -> Result<(), RpcError> {
        self.shared.cancel.cancel();
        self.shared.close_pending();
        let shutdown = async { self.shared.writer.lock().await.shutdown().await };
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(result) => result?,
            Err(_) => tracing::warn!(
                "Writer still busy after {}ms; closing without shutting it down",
                WRITER_SHUTDOWN_TIMEOUT.as_millis()
            ),
        }
        Ok(())
    }

    /// Whether the inbound side has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().closed
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().calls.len()
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a call's registry entry when the call finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().calls.remove(&self.id);
    }
}

impl Shared {
    fn subscribe(&self, method: String, handler: Handler, accepts: Accepts, once: bool) {
        // Hold the pending lock so a concurrent close cannot miss this handler.
        let pending = self.pending.lock();
        if pending.closed {
            return;
        }
        self.handlers.lock().entry(method).or_default().push(Registration {
            handler,
            accepts,
            once,
        });
    }

    fn register(&self, id: i64) -> Result<oneshot::Receiver<Result<Value, ResponseError>>, RpcError> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(id, tx);
        Ok(rx)
    }

    async fn write(&self, message: &impl Serialize) -> Result<(), RpcError> {
        let payload = serde_json::to_vec(message)?;
        tracing::debug!("--> {}", String::from_utf8_lossy(&payload));
        let frame = encode_frame(&payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn dispatch(&self, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Inbound frame is not valid JSON: {e}");
                self.emit_error(&RpcError::Json(e));
                return;
            }
        };
        tracing::debug!("<-- {value}");

        match Message::classify(value) {
            Ok(Message::Response { id, outcome }) => self.resolve(id, outcome),
            Ok(Message::Request { id, method, params }) => self.deliver(Incoming {
                method,
                id: Some(id),
                params,
            }),
            Ok(Message::Notification { method, params }) => self.deliver(Incoming {
                method,
                id: None,
                params,
            }),
            Err(e) => {
                tracing::warn!("{e}");
                self.emit_error(&e);
            }
        }
    }

    fn resolve(&self, id: Option<RequestId>, outcome: Result<Value, ResponseError>) {
        let (reply, outstanding) = {
            let mut pending = self.pending.lock();
            let reply = match &id {
                Some(RequestId::Number(n)) => pending.calls.remove(n),
                _ => None,
            };
            let outstanding = if reply.is_none() {
                let mut ids: Vec<i64> = pending.calls.keys().copied().collect();
                ids.sort_unstable();
                ids
            } else {
                Vec::new()
            };
            (reply, outstanding)
        };

        let Some(reply) = reply else {
            let err = RpcError::UnmatchedResponse {
                id: id.map_or_else(|| "null".to_string(), |id| id.to_string()),
                pending: outstanding,
            };
            tracing::warn!("{err}");
            self.emit_error(&err);
            return;
        };

        if reply.send(outcome).is_err() {
            tracing::debug!("Caller dropped before its response arrived");
        }
    }

    fn deliver(&self, incoming: Incoming) {
        let handlers: Vec<Handler> = {
            let mut registry = self.handlers.lock();
            match registry.get_mut(&incoming.method) {
                Some(registrations) => {
                    let matched: Vec<Handler> = registrations
                        .iter()
                        .filter(|r| r.accepts.matches(&incoming))
                        .map(|r| Arc::clone(&r.handler))
                        .collect();
                    registrations.retain(|r| !(r.once && r.accepts.matches(&incoming)));
                    if registrations.is_empty() {
                        registry.remove(&incoming.method);
                    }
                    matched
                }
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            return self.deliver_unhandled(&incoming);
        }

        for handler in handlers {
            handler(&incoming);
        }
    }

    fn deliver_unhandled(&self, incoming: &Incoming) {
        match &incoming.id {
            Some(id) => {
                let fallback = self.unhandled.lock().clone();
                match fallback {
                    Some(fallback) => fallback(incoming),
                    None => tracing::warn!(
                        "No handler for peer request '{}' (id {id}); not replying",
                        incoming.method
                    ),
                }
            }
            None => tracing::debug!("No handler for notification '{}'", incoming.method),
        }
    }

    fn emit_error(&self, err: &RpcError) {
        let handlers = self.error_handlers.lock().clone();
        for handler in handlers {
            handler(err);
        }
    }

    /// Mark the connection closed and reject every pending call.
    fn close_pending(&self) {
        let calls = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
            // Dropping handlers releases any `once` waiters.
            self.handlers.lock().clear();
            self.unhandled.lock().take();
            std::mem::take(&mut pending.calls)
        };
        if !calls.is_empty() {
            tracing::debug!("Rejecting {} pending calls: connection closed", calls.len());
        }
        // Dropping the senders wakes each caller with ConnectionClosed.
        drop(calls);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FrameStream::new(reader);
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => {
                tracing::debug!("Reader cancelled");
                break;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => shared.dispatch(frame.as_bytes()),
            Some(Err(e)) => {
                tracing::error!("Closing connection on framing error: {e}");
                shared.emit_error(&RpcError::Framing(e));
                break;
            }
            None => {
                tracing::debug!("Inbound stream ended");
                break;
            }
        }
    }
    shared.close_pending();
}

fn to_params(params: impl Serialize) -> Result<Option<Value>, RpcError> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}
