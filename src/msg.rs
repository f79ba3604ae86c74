//! The JSON-RPC 2.0 message model used over the LSP wire protocol.

use std::fmt;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ExtractError;

/// The JSON-RPC protocol version this crate speaks. Always `"2.0"`.
pub const JSONRPC_VERSION: &str = "2.0";

/// A request ID in the Language Server Protocol.
///
/// Equality is per-variant: the numeric id `42` is never equal to the
/// string id `"42"`, even though both might serialize to visually similar
/// JSON.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric request id.
    Number(i64),
    /// A string request id.
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> RequestId {
        RequestId::Number(id)
    }
}

impl From<i32> for RequestId {
    fn from(id: i32) -> RequestId {
        RequestId::Number(id as i64)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> RequestId {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> RequestId {
        RequestId::String(id.to_owned())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(it) => fmt::Display::fmt(it, f),
            // Debug here on purpose: makes `92` and `"92"` visually distinct.
            RequestId::String(it) => fmt::Debug::fmt(it, f),
        }
    }
}

/// A JSON-RPC error object, attached to a failed [`Response`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseError {
    /// The error code.
    pub code: i32,
    /// A short, human-readable summary of the error.
    pub message: String,
    /// Additional structured data about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ResponseError {
    /// Builds a new error with no extra data.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ResponseError {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data to this error.
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for ResponseError {}

/// The error codes defined by JSON-RPC and reserved by the LSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError = -32700,
    /// The JSON sent is not a valid Request object.
    InvalidRequest = -32600,
    /// The method does not exist / is not available.
    MethodNotFound = -32601,
    /// Invalid method parameter(s).
    InvalidParams = -32602,
    /// Internal JSON-RPC error.
    InternalError = -32603,

    /// A request was received before the server was initialized.
    ServerNotInitialized = -32002,
    /// A reserved but unused error code.
    UnknownErrorCode = -32001,

    /// The client canceled a request and the server detected the cancellation.
    RequestCancelled = -32800,
    /// The content of a document was modified outside normal conditions.
    ContentModified = -32801,
    /// The server cancelled the request.
    ServerCancelled = -32802,
    /// The request failed, though it was syntactically valid.
    RequestFailed = -32803,
}

/// A request message: carries an `id` that the peer must echo back in its
/// [`Response`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Request {
    /// The request id, echoed back by the corresponding response.
    pub id: RequestId,
    /// The method to invoke.
    pub method: String,
    /// The method parameters, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Request {
    /// Pulls the typed params out of this request, by hand, without going
    /// through [`crate::dispatcher::Dispatcher`]'s registry. Useful for
    /// callers matching on an already-decoded [`Message::Request`]
    /// directly (tests, or a manual `match` over a small fixed set of
    /// methods) instead of registering a handler.
    ///
    /// Fails with [`ExtractError::MethodMismatch`] if `self.method !=
    /// method`, returning `self` so the caller can try the next method in
    /// a chain; fails with [`ExtractError::JsonError`] if the params
    /// don't deserialize as `P`.
    pub fn extract<P: DeserializeOwned>(self, method: &str) -> Result<(RequestId, P), ExtractError<Request>> {
        if self.method != method {
            return Err(ExtractError::MethodMismatch(self));
        }
        match serde_json::from_value(self.params.unwrap_or(JsonValue::Null)) {
            Ok(params) => Ok((self.id, params)),
            Err(error) => Err(ExtractError::JsonError {
                method: self.method,
                error,
            }),
        }
    }
}

/// A notification message: no `id`, no reply expected.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    /// The method being notified.
    pub method: String,
    /// The method parameters, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Pulls the typed params out of this notification, by hand. See
    /// [`Request::extract`] for the same shape on the request side.
    pub fn extract<P: DeserializeOwned>(self, method: &str) -> Result<P, ExtractError<Notification>> {
        if self.method != method {
            return Err(ExtractError::MethodMismatch(self));
        }
        match serde_json::from_value(self.params.unwrap_or(JsonValue::Null)) {
            Ok(params) => Ok(params),
            Err(error) => Err(ExtractError::JsonError {
                method: self.method,
                error,
            }),
        }
    }
}

/// A response message, replying to an outstanding [`Request`].
///
/// Exactly one of `result`/`error` is populated for any id that was
/// actually dispatched to a handler; `id` is only `null` for protocol-level
/// parse failures that occurred before a request id could be recovered.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Response {
    /// The id of the request this responds to, or `null` if it could not be
    /// recovered from a malformed request.
    pub id: Option<RequestId>,
    /// The successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// The error payload, mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Builds a successful response.
    pub fn ok(id: RequestId, result: JsonValue) -> Self {
        Response {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    pub fn err(id: Option<RequestId>, error: ResponseError) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC message: one of [`Request`], [`Notification`] or [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// An incoming or outgoing request.
    Request(Request),
    /// An incoming or outgoing notification.
    Notification(Notification),
    /// An incoming or outgoing response.
    Response(Response),
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Notification> for Message {
    fn from(notif: Notification) -> Self {
        Message::Notification(notif)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

/// Discriminates a raw JSON-RPC envelope into one of the three message
/// kinds, enforcing the invariants from the spec:
///
///   * `jsonrpc` must be present and equal to `"2.0"`.
///   * `id` + `method` present → [`Request`].
///   * `method` present, no `id` → [`Notification`].
///   * `id` present, no `method`, and `result` xor `error` → [`Response`].
///   * anything else is rejected.
fn discriminate(value: JsonValue) -> Result<Message, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "JSON-RPC message must be an object".to_string())?;

    match obj.get("jsonrpc") {
        Some(JsonValue::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(format!("unsupported jsonrpc version: {other}")),
        None => return Err("missing jsonrpc field".to_string()),
    }

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if has_id && has_method {
        let id = serde_json::from_value(obj["id"].clone())
            .map_err(|e| format!("invalid request id: {e}"))?;
        let method = obj["method"]
            .as_str()
            .ok_or_else(|| "method must be a string".to_string())?
            .to_owned();
        let params = obj.get("params").cloned().filter(|v| !v.is_null());
        return Ok(Message::Request(Request { id, method, params }));
    }

    if has_method && !has_id {
        let method = obj["method"]
            .as_str()
            .ok_or_else(|| "method must be a string".to_string())?
            .to_owned();
        let params = obj.get("params").cloned().filter(|v| !v.is_null());
        return Ok(Message::Notification(Notification { method, params }));
    }

    if has_id && !has_method {
        if has_result && has_error {
            return Err("response must not carry both result and error".to_string());
        }
        if !has_result && !has_error {
            return Err("response must carry result or error".to_string());
        }
        let id = match &obj["id"] {
            JsonValue::Null => None,
            other => Some(
                serde_json::from_value(other.clone())
                    .map_err(|e| format!("invalid response id: {e}"))?,
            ),
        };
        let result = obj.get("result").cloned();
        let error = match obj.get("error") {
            Some(v) => Some(
                serde_json::from_value(v.clone())
                    .map_err(|e| format!("invalid error object: {e}"))?,
            ),
            None => None,
        };
        return Ok(Message::Response(Response { id, result, error }));
    }

    Err("message is neither a request, a notification, nor a response".to_string())
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        discriminate(value).map_err(de::Error::custom)
    }
}

/// Serializes as the wrapped id, or explicit JSON `null` if there isn't
/// one — unlike plain `Option<&RequestId>` with `skip_serializing_if`,
/// this never causes the *field itself* to be omitted. A [`Response`]
/// with `id: None` (the parse-error case, §3/§6) must round-trip back
/// through [`discriminate`] as a `Response`, which requires the `id` key
/// to be present (if absent, the message looks like a `Notification`
/// missing its `method`, and is rejected).
struct IdOrNull<'a>(Option<&'a RequestId>);

impl Serialize for IdOrNull<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.0 {
            Some(id) => id.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Envelope<'a> {
            jsonrpc: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<IdOrNull<'a>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            method: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            params: Option<&'a JsonValue>,
            #[serde(skip_serializing_if = "Option::is_none")]
            result: Option<&'a JsonValue>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<&'a ResponseError>,
        }

        let envelope = match self {
            Message::Request(req) => Envelope {
                jsonrpc: JSONRPC_VERSION,
                id: Some(IdOrNull(Some(&req.id))),
                method: Some(&req.method),
                params: req.params.as_ref(),
                result: None,
                error: None,
            },
            Message::Notification(notif) => Envelope {
                jsonrpc: JSONRPC_VERSION,
                id: None,
                method: Some(&notif.method),
                params: notif.params.as_ref(),
                result: None,
                error: None,
            },
            Message::Response(resp) => Envelope {
                jsonrpc: JSONRPC_VERSION,
                // Always present, even when `resp.id` is `None` — see
                // `IdOrNull`.
                id: Some(IdOrNull(resp.id.as_ref())),
                method: None,
                params: None,
                result: resp.result.as_ref(),
                error: resp.error.as_ref(),
            },
        };

        envelope.serialize(serializer)
    }
}
