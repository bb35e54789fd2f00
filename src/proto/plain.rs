//! Plain-HTTP response handling.

use std::sync::Arc;

use http::Method;
use tracing::trace;

use super::{Dispatcher, ResponseEvent, ResponseHead};
use crate::channel::Channel;
use crate::future::{FutureState, RequestFuture};
use crate::handler::HandlerState;
use crate::send::Connector;

pub(super) async fn handle<C: Channel, CN: Connector<C>>(
    d: &Dispatcher<C, CN>,
    channel: &Arc<C>,
    fut: &Arc<RequestFuture<C>>,
    event: ResponseEvent,
) {
    match event {
        ResponseEvent::Head(head) => on_head(d, channel, fut, head).await,
        ResponseEvent::BodyPart { data, last } => {
            fut.touch();
            let state = fut.handler().on_body_part(&data, last);
            if last {
                fut.complete();
                d.dispose_channel(channel, fut, fut.keep_alive());
            } else if state == HandlerState::Abort {
                fut.complete();
                // The rest of the body is unread: never pool.
                d.dispose_channel(channel, fut, false);
            }
        }
        ResponseEvent::WsFrame(_) => {
            trace!(channel = channel.id(), "ignoring frame on plain http channel");
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
    fut.set_keep_alive(head.keep_alive());

    // A successful CONNECT means the tunnel is up: the actual
    // request goes out on the same channel next.
    let tunneling = fut
        .wire()
        .is_some_and(|wire| wire.method == Method::CONNECT);
    if tunneling {
        if head.status.is_success() {
            trace!(channel = channel.id(), "proxy tunnel established");
            fut.disallow_connect();
            fut.reset_write_claims();
            fut.set_status_received(false);
            fut.attach_channel(channel.clone(), true);
            let request = fut.request();
            d.sender.send_next_request(request, fut.clone()).await;
        } else {
            fut.abort(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("proxy refused tunnel: {}", head.status),
            )));
        }
        return;
    }

    if d.maybe_replay(fut, &head).await {
        return;
    }
    if d.maybe_redirect(channel, fut, &head).await {
        return;
    }

    let handler = fut.handler();
    if handler.on_status(head.status) == HandlerState::Abort
        || handler.on_headers(&head.headers) == HandlerState::Abort
    {
        fut.complete();
        if head.has_body() {
            d.dispose_after_drain(channel, fut, head.keep_alive());
        } else {
            d.dispose_channel(channel, fut, head.keep_alive());
        }
        return;
    }

    if !head.has_body() {
        fut.complete();
        d.dispose_channel(channel, fut, head.keep_alive());
    }
}
