//! The bidirectional engine that owns the codec, dispatcher, id
//! allocator and outgoing channel.
//!
//! Grounded in the teacher's real, compiled `server.rs`: the
//! `TConnectionTx`/`TConnectionRx` channel pair and the `Connection<M>`
//! struct that owns them, generalized from `crossbeam_channel` to
//! `tokio::sync::mpsc`/`oneshot` per the concurrent scheduling model this
//! crate targets (see `dispatcher.rs`'s doc comment and the design notes
//! in `DESIGN.md`).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::codec::{encode_message, Codec, ProtocolError};
use crate::config::ConnectionConfig;
use crate::dispatcher::{Dispatcher, NotificationHandler, RequestHandler};
use crate::error::RpcError;
use crate::lifecycle::LifecycleGate;
use crate::msg::{Message, Notification, Request, RequestId, Response};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whatever routes incoming requests/notifications for a [`Connection`]:
/// either a bare [`Dispatcher`], or one wrapped in a [`LifecycleGate`].
/// Lets `Connection` stay agnostic to whether lifecycle discipline is in
/// effect.
pub trait RequestRouter: Send + Sync {
    /// Dispatches an incoming request, producing the response to send.
    fn route_request(&self, req: Request) -> BoxFuture<'_, Response>;
    /// Dispatches an incoming notification.
    fn route_notification(&self, notif: Notification) -> BoxFuture<'_, ()>;
    /// Whether the router has processed an `exit` notification and the
    /// owning `Connection` should now close. Bare `Dispatcher`s have no
    /// lifecycle, so they never ask for this; only [`LifecycleGate`] can.
    fn is_exited(&self) -> bool {
        false
    }
}

impl RequestRouter for Dispatcher {
    fn route_request(&self, req: Request) -> BoxFuture<'_, Response> {
        Box::pin(self.dispatch_request(req))
    }

    fn route_notification(&self, notif: Notification) -> BoxFuture<'_, ()> {
        Box::pin(self.dispatch_notification(notif))
    }
}

impl RequestRouter for LifecycleGate {
    fn route_request(&self, req: Request) -> BoxFuture<'_, Response> {
        Box::pin(self.dispatch_request(req))
    }

    fn route_notification(&self, notif: Notification) -> BoxFuture<'_, ()> {
        Box::pin(self.dispatch_notification(notif))
    }

    fn is_exited(&self) -> bool {
        LifecycleGate::is_exited(self)
    }
}

/// The central multiplexer: decodes incoming bytes, routes them to
/// handlers, and correlates outbound requests with their responses.
///
/// `receive` and `send_*` are safe to call concurrently from different
/// tasks except `receive` itself, which the spec requires to be called
/// serially (a single transport reader feeds bytes in order; see §5).
pub struct Connection {
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn RequestRouter>,
    codec: Mutex<Codec>,
    next_id: AtomicI64,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: AtomicBool,
    config: ConnectionConfig,
}

impl Connection {
    /// Builds a connection with a bare dispatcher: no lifecycle gating,
    /// every registered handler is reachable from the first received
    /// message. Suitable for a client role, or a server that manages its
    /// own lifecycle externally.
    pub fn new(config: ConnectionConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.include_exception_details_in_errors));
        let router = dispatcher.clone() as Arc<dyn RequestRouter>;
        Self::with_router(dispatcher, router, config)
    }

    /// Builds a connection gated by a fresh [`LifecycleGate`] in the
    /// `Starting` state, returning both. `capabilities`/`server_info` are
    /// the values echoed verbatim in `initialize`'s response.
    pub fn with_lifecycle(
        capabilities: JsonValue,
        server_info: Option<JsonValue>,
        config: ConnectionConfig,
    ) -> (Self, Arc<LifecycleGate>) {
        let dispatcher = Arc::new(Dispatcher::new(config.include_exception_details_in_errors));
        let gate = Arc::new(LifecycleGate::new(dispatcher.clone(), capabilities, server_info));
        let router = gate.clone() as Arc<dyn RequestRouter>;
        let conn = Self::with_router(dispatcher, router, config);
        (conn, gate)
    }

    fn with_router(dispatcher: Arc<Dispatcher>, router: Arc<dyn RequestRouter>, config: ConnectionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Connection {
            dispatcher,
            router,
            codec: Mutex::new(Codec::new(config.max_content_length)),
            next_id: AtomicI64::new(1),
            outgoing_tx: tx,
            outgoing_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Registers (or replaces) the handler for an incoming request
    /// method. Always targets the underlying dispatcher, bypassing any
    /// lifecycle gate — the gate only affects when a registered handler
    /// is reachable, not how it's registered.
    pub fn register_request(&self, method: impl Into<String>, handler: RequestHandler) {
        self.dispatcher.register_request(method, handler);
    }

    /// Registers (or replaces) the handler for an incoming notification
    /// method.
    pub fn register_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.dispatcher.register_notification(method, handler);
    }

    /// Feeds raw transport bytes in. Every complete frame is decoded and
    /// routed: incoming requests are dispatched on spawned tasks (so
    /// slow handlers don't block later frames), incoming notifications
    /// are awaited in arrival order before the next frame is processed,
    /// and incoming responses complete their pending entry synchronously.
    ///
    /// Must not be called concurrently with itself on the same
    /// `Connection` — the decoder is single-writer (§5).
    pub async fn receive(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let messages = {
            let mut codec = self.codec.lock();
            codec.feed(bytes)?
        };

        for message in messages {
            match message {
                Message::Request(req) => {
                    let router = self.router.clone();
                    let outgoing_tx = self.outgoing_tx.clone();
                    tokio::spawn(async move {
                        let resp = router.route_request(req).await;
                        let _ = outgoing_tx.send(encode_message(&Message::Response(resp)));
                    });
                }
                Message::Notification(notif) => {
                    self.router.route_notification(notif).await;
                    // `exit` (under a `LifecycleGate`) flips the router
                    // to its terminal state; tear the connection down
                    // the moment that happens rather than leaving the
                    // outgoing channel open and `send_*` still usable.
                    if self.router.is_exited() {
                        self.close();
                    }
                }
                Message::Response(resp) => {
                    self.dispatcher.complete_response(resp);
                }
            }
        }
        Ok(())
    }

    /// Sends a request and awaits its response. Allocates a fresh,
    /// strictly increasing id (starting at 1), encodes the request to
    /// the outgoing channel, and resolves when a matching `Response`
    /// arrives, `timeout` elapses, or the connection closes.
    ///
    /// `timeout` overrides `ConnectionConfig::request_timeout_default`
    /// when given; `None` falls back to the configured default, which is
    /// itself `None` (wait forever) unless set.
    pub async fn send_request<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let receiver = self.dispatcher.register_pending(id.clone());

        let params = encode_params(params).map_err(RpcError::Decode)?;
        let req = Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if self
            .outgoing_tx
            .send(encode_message(&Message::Request(req)))
            .is_err()
        {
            self.dispatcher.cancel_pending(&id);
            return Err(RpcError::ConnectionClosed);
        }

        let effective_timeout = timeout.or(self.config.request_timeout_default);
        let outcome = match effective_timeout {
            Some(duration) => match tokio::time::timeout(duration, receiver).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.dispatcher.cancel_pending(&id);
                    return Err(RpcError::Timeout);
                }
            },
            None => receiver.await,
        };

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(RpcError::Protocol(err)),
            Err(_canceled) => return Err(RpcError::Cancelled),
        };

        serde_json::from_value(value).map_err(RpcError::Decode)
    }

    /// Cancels a request previously sent via `send_request`, causing its
    /// future to resolve with [`RpcError::Cancelled`] if still pending. A
    /// Response that later arrives for this id is silently dropped. Does
    /// not notify the peer — send `$/cancelRequest` explicitly if that's
    /// wanted.
    pub fn cancel_request(&self, id: RequestId) {
        self.dispatcher.cancel_pending(&id);
    }

    /// Sends a notification: no id, no correlation, no reply expected.
    pub fn send_notification<P: Serialize>(&self, method: &str, params: P) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let params = encode_params(params).map_err(RpcError::Decode)?;
        let notif = Notification {
            method: method.to_string(),
            params,
        };
        self.outgoing_tx
            .send(encode_message(&Message::Notification(notif)))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Takes the receiving half of the outgoing byte channel. A
    /// transport reads framed payloads from here, in the order they were
    /// enqueued, and forwards them verbatim. Can only be taken once;
    /// later calls panic.
    pub fn outgoing_rx(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.outgoing_rx
            .lock()
            .take()
            .expect("Connection::outgoing_rx already taken")
    }

    /// Closes the connection: further `send_request`/`send_notification`
    /// calls fail with [`RpcError::ConnectionClosed`], and every pending
    /// outbound request is cancelled. Already-spawned request handlers
    /// still run to completion; their responses are simply written to a
    /// channel nobody reads from anymore.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.dispatcher.shutdown();
    }

    /// True once [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn encode_params<P: Serialize>(params: P) -> Result<Option<JsonValue>, serde_json::Error> {
    let value = serde_json::to_value(params)?;
    Ok(if value.is_null() { None } else { Some(value) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn scenario_a_request_response_round_trip() {
        let conn = Connection::new(ConnectionConfig::default());
        conn.register_request(
            "ping",
            StdArc::new(|_| Box::pin(async { Ok(Some(serde_json::json!("pong"))) })),
        );

        let mut outgoing = conn.outgoing_rx();
        conn.receive(b"Content-Length: 40\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}")
            .await
            .unwrap();

        let frame = outgoing.recv().await.unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("\"id\":7"));
        assert!(text.contains("\"result\":\"pong\""));
    }

    #[tokio::test]
    async fn scenario_b_unknown_method() {
        let conn = Connection::new(ConnectionConfig::default());
        let mut outgoing = conn.outgoing_rx();
        conn.receive(b"Content-Length: 47\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"unknown/xyz\"}")
            .await
            .unwrap();
        let frame = outgoing.recv().await.unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("\"code\":-32601"));
        assert!(text.contains("Method not found: unknown/xyz"));
    }

    #[tokio::test]
    async fn scenario_e_outbound_correlation() {
        let conn = StdArc::new(Connection::new(ConnectionConfig::default()));
        let mut outgoing = conn.outgoing_rx();

        let conn2 = conn.clone();
        let handle = tokio::spawn(async move { conn2.send_request::<_, i64>("compute", serde_json::json!({"x": 1}), None).await });

        let frame = outgoing.recv().await.unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("\"id\":1"));
        assert!(text.contains("\"method\":\"compute\""));

        conn.receive(b"Content-Length: 36\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":42}")
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 42);

        let conn2 = conn.clone();
        let handle2 = tokio::spawn(async move { conn2.send_request::<_, i64>("compute", serde_json::json!({"x": 2}), None).await });
        let frame = outgoing.recv().await.unwrap();
        assert!(String::from_utf8(frame).unwrap().contains("\"id\":2"));
        conn.receive(b"Content-Length: 36\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":43}")
            .await
            .unwrap();
        assert_eq!(handle2.await.unwrap().unwrap(), 43);
    }

    #[tokio::test]
    async fn send_request_times_out_without_response() {
        let conn = Connection::new(ConnectionConfig::default());
        let mut outgoing = conn.outgoing_rx();
        let result = conn
            .send_request::<_, i64>(
                "compute",
                serde_json::json!({}),
                Some(Duration::from_millis(10)),
            )
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        outgoing.recv().await.unwrap();
    }

    #[tokio::test]
    async fn close_fails_subsequent_sends_and_cancels_pending() {
        let conn = StdArc::new(Connection::new(ConnectionConfig::default()));
        let _outgoing = conn.outgoing_rx();

        let conn2 = conn.clone();
        let pending = tokio::spawn(async move {
            conn2
                .send_request::<_, i64>("compute", serde_json::json!({}), None)
                .await
        });
        tokio::task::yield_now().await;

        conn.close();
        assert!(matches!(pending.await.unwrap(), Err(RpcError::Cancelled)));

        let err = conn
            .send_notification("exit", serde_json::json!(null))
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn scenario_f_lifecycle_gate() {
        let (conn, _gate) =
            Connection::with_lifecycle(serde_json::json!({"hoverProvider": true}), None, ConnectionConfig::default());
        conn.register_request(
            "textDocument/hover",
            StdArc::new(|_| Box::pin(async { Ok(Some(serde_json::json!("hover"))) })),
        );
        let mut outgoing = conn.outgoing_rx();

        conn.receive(b"Content-Length: 54\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"textDocument/hover\"}")
            .await
            .unwrap();
        let frame = String::from_utf8(outgoing.recv().await.unwrap()).unwrap();
        assert!(frame.contains("-32002"));

        conn.receive(b"Content-Length: 46\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"initialize\"}")
            .await
            .unwrap();
        outgoing.recv().await.unwrap();

        conn.receive(b"Content-Length: 40\r\n\r\n{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}")
            .await
            .unwrap();

        conn.receive(b"Content-Length: 54\r\n\r\n{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"textDocument/hover\"}")
            .await
            .unwrap();
        let frame = String::from_utf8(outgoing.recv().await.unwrap()).unwrap();
        assert!(frame.contains("\"result\":\"hover\""));
    }
}
