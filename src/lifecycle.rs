//! The Language Server lifecycle gate.
//!
//! Grounded in two places in the teacher crate: the real, compiled state
//! machine in `server.rs` (`State::{Uninitialized,Initializing,Ready,
//! ShuttingDown}` plus `on_lsp_request`'s state-gated routing in
//! `server/lsp_srv.rs`) supplies the actual transition and rejection
//! logic; the never-wired `lifecycle.rs` prototype (a `tower_layer::Layer`
//! decorating an inner `LspService`) supplies the shape this module is
//! rebuilt into — a decorator in front of a [`Dispatcher`], not a
//! free-standing router. States are renamed to this crate's vocabulary
//! (`Starting → Initialized → ShuttingDown → Exited`); the teacher's
//! separate `Initializing` interior state collapses into `Starting` here
//! since no method but `initialize` is reachable during it either way.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;

use crate::dispatcher::Dispatcher;
use crate::msg::{ErrorCode, Notification, Request, Response, ResponseError};

/// The four states of the Language Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Before `initialize` has been answered. Only `initialize` requests
    /// are accepted.
    Starting,
    /// After `initialized`. Normal request traffic is routed to the
    /// inner dispatcher.
    Initialized,
    /// After `shutdown`. All further requests are rejected; `exit` is
    /// still accepted.
    ShuttingDown,
    /// After `exit`. The connection this gate belongs to should tear
    /// down.
    Exited,
}

/// The trace verbosity negotiated by `initialize.trace` / `$/setTrace`.
/// Carried but not interpreted — the core never emits trace output
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceValue {
    /// No `$/logTrace` notifications expected.
    Off,
    /// Terse trace output.
    Messages,
    /// Full trace output, including message payloads.
    Verbose,
}

impl TraceValue {
    fn parse(value: &str) -> TraceValue {
        match value {
            "messages" => TraceValue::Messages,
            "verbose" => TraceValue::Verbose,
            _ => TraceValue::Off,
        }
    }
}

/// Result of handling `initialize`, merged into the `InitializeResult`
/// sent back to the peer.
#[derive(Debug, Clone)]
pub struct InitializeOutcome {
    /// The server's declared capabilities, carried verbatim — the core
    /// never interprets them.
    pub capabilities: JsonValue,
    /// Optional `{name, version}` server info.
    pub server_info: Option<JsonValue>,
}

/// Called with the raw `initialize` params before the gate builds its
/// response, so an embedder can validate them or run setup side effects.
/// Returning `Err` fails `initialize` itself with the given protocol
/// error instead of transitioning to `Initialized`.
pub type InitializeHook =
    Arc<dyn Fn(Option<JsonValue>) -> BoxFuture<'static, Result<(), ResponseError>> + Send + Sync>;

/// Decorates a [`Dispatcher`] with LSP lifecycle discipline: gates
/// ordinary request traffic on `Starting`/`ShuttingDown`/`Exited`,
/// handles `initialize`/`initialized`/`shutdown`/`exit`/`$/setTrace`
/// itself, and otherwise delegates to the inner dispatcher unchanged.
pub struct LifecycleGate {
    inner: Arc<Dispatcher>,
    state: Mutex<LifecycleState>,
    // Tracks whether an `initialize` request has already been answered,
    // distinguishing "never initialized" from "initialize answered, still
    // waiting on `initialized`" while `state` itself stays `Starting` for
    // both — both are rejected identically for any method but
    // `initialize`/`initialized`, but a second `initialize` request must
    // be rejected rather than re-run.
    initialize_requested: Mutex<bool>,
    trace: Mutex<TraceValue>,
    outcome: InitializeOutcome,
    initialize_hook: RwLock<Option<InitializeHook>>,
}

impl LifecycleGate {
    /// Builds a gate in the `Starting` state, wrapping `inner`.
    /// `capabilities` is the JSON value returned verbatim as
    /// `InitializeResult.capabilities`.
    pub fn new(inner: Arc<Dispatcher>, capabilities: JsonValue, server_info: Option<JsonValue>) -> Self {
        LifecycleGate {
            inner,
            state: Mutex::new(LifecycleState::Starting),
            initialize_requested: Mutex::new(false),
            trace: Mutex::new(TraceValue::Off),
            outcome: InitializeOutcome { capabilities, server_info },
            initialize_hook: RwLock::new(None),
        }
    }

    /// Installs a hook run during `initialize`, before the gate
    /// transitions out of `Starting`.
    pub fn set_initialize_hook(&self, hook: InitializeHook) {
        *self.initialize_hook.write() = Some(hook);
    }

    /// The gate's current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// True once `exit` has been received.
    pub fn is_exited(&self) -> bool {
        self.state() == LifecycleState::Exited
    }

    /// The trace verbosity currently in effect.
    pub fn trace(&self) -> TraceValue {
        self.trace.lock().clone()
    }

    /// Dispatches an incoming request through the lifecycle gate,
    /// producing the `Response` to send back.
    pub async fn dispatch_request(&self, req: Request) -> Response {
        let state = self.state();
        match (state, req.method.as_str()) {
            (LifecycleState::Starting, "initialize") => self.handle_initialize(req).await,
            (LifecycleState::Starting, method) => Response::err(
                Some(req.id),
                ResponseError::new(
                    ErrorCode::ServerNotInitialized,
                    format!("Server is not initialized, cannot process request: {method}"),
                ),
            ),
            (LifecycleState::Initialized, "initialize") => Response::err(
                Some(req.id),
                ResponseError::new(ErrorCode::InvalidRequest, "Server is already initialized"),
            ),
            (LifecycleState::Initialized, "shutdown") => {
                *self.state.lock() = LifecycleState::ShuttingDown;
                log::info!("lifecycle: Initialized -> ShuttingDown");
                Response::ok(req.id, JsonValue::Null)
            }
            (LifecycleState::Initialized, _) => self.inner.dispatch_request(req).await,
            (LifecycleState::ShuttingDown, method) | (LifecycleState::Exited, method) => {
                Response::err(
                    Some(req.id),
                    ResponseError::new(
                        ErrorCode::InvalidRequest,
                        format!("Server is shutting down, cannot process request: {method}"),
                    ),
                )
            }
        }
    }

    /// Dispatches an incoming notification through the lifecycle gate.
    /// Notifications never produce a reply, so failures here are either
    /// absorbed by the gate (state transitions) or forwarded to the
    /// inner dispatcher's own error-sink handling.
    pub async fn dispatch_notification(&self, notif: Notification) {
        match notif.method.as_str() {
            "initialized" => self.handle_initialized(),
            "exit" => self.handle_exit(),
            "$/setTrace" => self.handle_set_trace(notif.params),
            _ if self.state() == LifecycleState::Initialized => {
                self.inner.dispatch_notification(notif).await
            }
            _ => {
                log::debug!(
                    "ignoring notification '{}' in lifecycle state {:?}",
                    notif.method,
                    self.state()
                );
            }
        }
    }

    async fn handle_initialize(&self, req: Request) -> Response {
        if std::mem::replace(&mut *self.initialize_requested.lock(), true) {
            return Response::err(
                Some(req.id),
                ResponseError::new(ErrorCode::InvalidRequest, "Server is already initializing"),
            );
        }

        if let Some(hook) = self.initialize_hook.read().clone() {
            if let Err(err) = hook(req.params.clone()).await {
                // Roll back: a failed hook must not block a retried
                // `initialize` from this or a future request.
                *self.initialize_requested.lock() = false;
                return Response::err(Some(req.id), err);
            }
        }

        if let Some(trace) = req
            .params
            .as_ref()
            .and_then(|p| p.get("trace"))
            .and_then(JsonValue::as_str)
        {
            *self.trace.lock() = TraceValue::parse(trace);
        }

        // Stays `Starting` until the peer confirms receipt with
        // `initialized` (`handle_initialized`); only `initialize` itself
        // is answered from here (ground truth: `lsp_srv.rs`'s
        // `Uninitialized -> Initializing` transition on the request,
        // `Initializing -> Ready` only on the notification).
        log::info!("lifecycle: initialize answered, awaiting 'initialized'");

        let mut result = serde_json::Map::new();
        result.insert("capabilities".to_string(), self.outcome.capabilities.clone());
        if let Some(server_info) = &self.outcome.server_info {
            result.insert("serverInfo".to_string(), server_info.clone());
        }
        Response::ok(req.id, JsonValue::Object(result))
    }

    fn handle_initialized(&self) {
        let requested = *self.initialize_requested.lock();
        let mut state = self.state.lock();
        if *state != LifecycleState::Starting || !requested {
            log::warn!("ignoring unexpected 'initialized' notification in state {state:?}");
            return;
        }
        *state = LifecycleState::Initialized;
        log::info!("lifecycle: Starting -> Initialized");
    }

    fn handle_exit(&self) {
        *self.state.lock() = LifecycleState::Exited;
        self.inner.shutdown();
        log::info!("lifecycle: -> Exited");
    }

    fn handle_set_trace(&self, params: Option<JsonValue>) {
        if let Some(trace) = params.as_ref().and_then(|p| p.get("value")).and_then(JsonValue::as_str) {
            *self.trace.lock() = TraceValue::parse(trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::RequestId;

    fn gate() -> LifecycleGate {
        LifecycleGate::new(
            Arc::new(Dispatcher::default()),
            serde_json::json!({"hoverProvider": true}),
            None,
        )
    }

    fn request(id: i64, method: &str, params: Option<JsonValue>) -> Request {
        Request {
            id: RequestId::from(id),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn request_before_initialize_is_rejected() {
        let gate = gate();
        let resp = gate.dispatch_request(request(1, "textDocument/hover", None)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::ServerNotInitialized as i32);
    }

    #[tokio::test]
    async fn initialize_then_ready_dispatches_normally() {
        let gate = gate();
        gate.inner.register_request(
            "textDocument/hover",
            Arc::new(|_| Box::pin(async { Ok(Some(serde_json::json!("hover text"))) })),
        );

        let resp = gate.dispatch_request(request(1, "initialize", None)).await;
        assert!(resp.error.is_none());
        assert_eq!(
            resp.result.unwrap()["capabilities"],
            serde_json::json!({"hoverProvider": true})
        );
        assert_eq!(gate.state(), LifecycleState::Starting);

        gate.dispatch_notification(Notification {
            method: "initialized".into(),
            params: None,
        })
        .await;
        assert_eq!(gate.state(), LifecycleState::Initialized);

        let resp = gate
            .dispatch_request(request(2, "textDocument/hover", None))
            .await;
        assert_eq!(resp.result.unwrap(), serde_json::json!("hover text"));
    }

    #[tokio::test]
    async fn request_before_initialized_is_rejected() {
        let gate = gate();
        gate.inner.register_request(
            "textDocument/hover",
            Arc::new(|_| Box::pin(async { Ok(Some(serde_json::json!("hover text"))) })),
        );

        let resp = gate.dispatch_request(request(1, "initialize", None)).await;
        assert!(resp.error.is_none());
        assert_eq!(gate.state(), LifecycleState::Starting);

        let resp = gate
            .dispatch_request(request(2, "textDocument/hover", None))
            .await;
        assert_eq!(
            resp.error.unwrap().code,
            ErrorCode::ServerNotInitialized as i32
        );
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let gate = gate();
        gate.dispatch_request(request(1, "initialize", None)).await;
        let resp = gate.dispatch_request(request(2, "initialize", None)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidRequest as i32);
    }

    #[tokio::test]
    async fn shutdown_then_requests_rejected_then_exit() {
        let gate = gate();
        gate.dispatch_request(request(1, "initialize", None)).await;
        let resp = gate.dispatch_request(request(2, "shutdown", None)).await;
        assert_eq!(resp.result, Some(JsonValue::Null));
        assert_eq!(gate.state(), LifecycleState::ShuttingDown);

        let resp = gate
            .dispatch_request(request(3, "textDocument/hover", None))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, ErrorCode::InvalidRequest as i32);
        assert!(err.message.contains("textDocument/hover"));

        gate.dispatch_notification(Notification {
            method: "exit".into(),
            params: None,
        })
        .await;
        assert!(gate.is_exited());
    }

    #[tokio::test]
    async fn set_trace_updates_verbosity() {
        let gate = gate();
        assert_eq!(gate.trace(), TraceValue::Off);
        gate.dispatch_notification(Notification {
            method: "$/setTrace".into(),
            params: Some(serde_json::json!({"value": "verbose"})),
        })
        .await;
        assert_eq!(gate.trace(), TraceValue::Verbose);
    }

    #[tokio::test]
    async fn initialize_trace_param_seeds_verbosity() {
        let gate = gate();
        gate.dispatch_request(request(1, "initialize", Some(serde_json::json!({"trace": "messages"}))))
            .await;
        assert_eq!(gate.trace(), TraceValue::Messages);
    }

    #[tokio::test]
    async fn initialize_hook_failure_keeps_server_in_starting() {
        let gate = gate();
        gate.set_initialize_hook(Arc::new(|_| {
            Box::pin(async { Err(ResponseError::new(ErrorCode::InvalidParams, "bad root uri")) })
        }));
        let resp = gate.dispatch_request(request(1, "initialize", None)).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidParams as i32);
        assert_eq!(gate.state(), LifecycleState::Starting);
    }
}
