//! WebSocket upgrade validation and frame handling.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::StatusCode;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use sha1::{Digest, Sha1};
use tracing::trace;

use super::{Dispatcher, ResponseEvent, ResponseHead, WsFrame};
use crate::channel::Channel;
use crate::error::HandshakeError;
use crate::future::{FutureState, RequestFuture};
use crate::handler::HandlerState;
use crate::registry::Attribute;
use crate::send::Connector;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the expected `Sec-WebSocket-Accept` value
/// for a `Sec-WebSocket-Key` (RFC 6455 §4.2.2).
pub fn derive_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

pub(super) async fn handle<C: Channel, CN: Connector<C>>(
    d: &Dispatcher<C, CN>,
    channel: &Arc<C>,
    fut: &Arc<RequestFuture<C>>,
    event: ResponseEvent,
) {
    match event {
        ResponseEvent::Head(head) => on_head(d, channel, fut, head).await,
        ResponseEvent::WsFrame(frame) => on_frame(d, channel, fut, frame),
        ResponseEvent::BodyPart { .. } => {
            trace!(channel = channel.id(), "ignoring body part on websocket channel");
        }
        ResponseEvent::Drained => {}
    }
}

async fn on_head<C: Channel, CN: Connector<C>>(
    d: &Dispatcher<C, CN>,
    channel: &Arc<C>,
    fut: &Arc<RequestFuture<C>>,
    head: ResponseHead,
) {
    fut.touch();
    fut.set_status_received(true);
    fut.set_state(FutureState::ResponseReceived);

    if d.maybe_replay(fut, &head).await {
        return;
    }
    if d.maybe_redirect(channel, fut, &head).await {
        return;
    }

    if let Err(err) = validate_upgrade(fut, &head) {
        fut.abort(err.into());
        return;
    }

    channel.upgrade_to_websocket();
    if fut.claim_ws_open() {
        if let Some(ws) = fut.handler().as_websocket() {
            ws.on_open();
        }
    }
    fut.complete();
}

/// Validate the server's upgrade response against RFC 6455 and the
/// handler's consent.
fn validate_upgrade<C: Channel>(
    fut: &Arc<RequestFuture<C>>,
    head: &ResponseHead,
) -> Result<(), HandshakeError> {
    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HandshakeError::UnexpectedStatusCode(head.status));
    }

    let upgraded = head
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgraded {
        return Err(HandshakeError::MissingUpgradeHeader);
    }

    let connection_upgrade = head
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade {
        return Err(HandshakeError::MissingConnectionUpgradeHeader);
    }

    let handler = fut.handler();
    let wants_upgrade = handler.on_status(head.status) == HandlerState::Upgrade
        && handler.on_headers(&head.headers) == HandlerState::Continue;
    if !wants_upgrade {
        return Err(HandshakeError::UpgradeRefused);
    }

    let expected = fut
        .wire()
        .and_then(|wire| wire.sec_websocket_key().map(derive_accept_key))
        .unwrap_or_default();
    let actual = head
        .headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if actual.as_deref() != Some(expected.as_str()) {
        return Err(HandshakeError::AcceptKeyMismatch { expected, actual });
    }

    Ok(())
}

fn on_frame<C: Channel, CN: Connector<C>>(
    d: &Dispatcher<C, CN>,
    channel: &Arc<C>,
    fut: &Arc<RequestFuture<C>>,
    frame: WsFrame,
) {
    fut.touch();
    let handler = fut.handler();
    let Some(ws) = handler.as_websocket() else {
        trace!(channel = channel.id(), "frame for handler without websocket capability");
        return;
    };

    match frame {
        WsFrame::Close { code, reason } => {
            d.registry
                .set_attribute(channel.id(), Attribute::Discard);
            ws.on_close(code, &reason);
            d.registry.remove_all(channel);
            channel.close();
        }
        WsFrame::Text { data, fin } => {
            if !data.is_empty() {
                handler.on_body_part(&data, false);
                ws.on_fragment(&data, true, fin);
            }
        }
        WsFrame::Binary { data, fin } => {
            if !data.is_empty() {
                handler.on_body_part(&data, false);
                ws.on_fragment(&data, false, fin);
            }
        }
        WsFrame::Ping(_) | WsFrame::Pong(_) => {
            trace!(channel = channel.id(), "control frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_rfc6455_vector() {
        assert_eq!(
            derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
