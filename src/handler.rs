//! Caller-facing response handler capabilities.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::Error;

/// Decision returned from the early response callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Keep delivering events.
    Continue,
    /// Stop here; the future completes and the rest of the
    /// response is discarded.
    Abort,
    /// The handler wants the connection upgraded to WebSocket.
    Upgrade,
}

/// Receives the lifecycle events of one logical request.
///
/// Exactly one of `on_completed` / `on_error` fires per lifecycle,
/// after which no further events are delivered.
pub trait ResponseHandler: Send + Sync + 'static {
    fn on_status(&self, status: StatusCode) -> HandlerState;

    fn on_headers(&self, headers: &HeaderMap) -> HandlerState;

    fn on_body_part(&self, data: &Bytes, last: bool) -> HandlerState;

    fn on_completed(&self);

    fn on_error(&self, error: &Error);

    /// The request is being re-sent after a recoverable failure.
    fn on_retry(&self) {}

    /// The request head was handed to the transport.
    fn on_request_sent(&self) {}

    /// Raw snapshot of the headers about to be written, before
    /// any response arrives. Informational only.
    fn headers_snapshot(&self, _headers: &HeaderMap) {}

    /// WebSocket capability. Handlers that can drive an upgraded
    /// connection return themselves here.
    fn as_websocket(&self) -> Option<&dyn WebSocketHandler> {
        None
    }
}

/// Frame-level events of an upgraded WebSocket connection.
pub trait WebSocketHandler: Send + Sync {
    /// The upgrade handshake succeeded. Fires at most once.
    fn on_open(&self);

    /// A text or binary fragment arrived. `fin` marks the final
    /// fragment of the message.
    fn on_fragment(&self, data: &Bytes, text: bool, fin: bool);

    /// The peer closed the connection, or it was lost
    /// (code 1006 for abnormal closure).
    fn on_close(&self, code: u16, reason: &str);

    fn on_error(&self, error: &Error);
}
