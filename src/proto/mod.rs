//! Response event dispatch: routes channel events to the in-flight
//! future and owns the shared redirect and replay logic.

mod plain;
mod ws;

pub use ws::derive_accept_key;

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, LOCATION, SET_COOKIE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use iri_string::types::{UriAbsoluteString, UriReferenceStr};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::filter::FilterContext;
use crate::future::RequestFuture;
use crate::registry::{Attribute, ChannelRegistry, Disposition};
use crate::request::{self, BodySource, LogicalRequest};
use crate::send::{Connector, RequestSender};

/// Events a channel implementation feeds into the dispatcher.
#[derive(Debug)]
pub enum ResponseEvent {
    Head(ResponseHead),
    BodyPart { data: Bytes, last: bool },
    WsFrame(WsFrame),
    /// The in-flight response has been fully discarded.
    Drained,
}

/// Status line and headers of one response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .any(|v| v.to_str().is_ok_and(|v| v.eq_ignore_ascii_case("chunked")))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Whether the channel may be reused after this response,
    /// per its `Connection` header (HTTP/1.1 default: yes).
    pub fn keep_alive(&self) -> bool {
        !self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Whether body events will follow this head.
    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length().is_some_and(|len| len > 0)
    }
}

/// One decoded WebSocket frame.
#[derive(Debug, Clone)]
pub enum WsFrame {
    Text { data: Bytes, fin: bool },
    Binary { data: Bytes, fin: bool },
    Close { code: u16, reason: String },
    Ping(Bytes),
    Pong(Bytes),
}

// Obsolete (RFC 2965) but still emitted by some servers.
const SET_COOKIE2: HeaderName = HeaderName::from_static("set-cookie2");

const REDIRECT_STATUSES: [StatusCode; 4] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
];

/// Routes response events per channel attribute and protocol.
pub struct Dispatcher<C, CN> {
    config: Arc<ClientConfig>,
    registry: Arc<ChannelRegistry<C>>,
    sender: Arc<RequestSender<C, CN>>,
}

impl<C: Channel, CN: Connector<C>> Dispatcher<C, CN> {
    pub fn new(
        config: Arc<ClientConfig>,
        registry: Arc<ChannelRegistry<C>>,
        sender: Arc<RequestSender<C, CN>>,
    ) -> Self {
        Self {
            config,
            registry,
            sender,
        }
    }

    /// Entry point for every event a channel produces.
    pub async fn handle_event(&self, channel: &Arc<C>, event: ResponseEvent) {
        match self.registry.attribute(channel.id()) {
            None | Some(Attribute::Discard) => {
                trace!(channel = channel.id(), "dropping event on discarded channel");
            }
            Some(Attribute::OnDrain(disposition)) => {
                if matches!(event, ResponseEvent::Drained) {
                    self.finalize_disposition(channel, disposition);
                }
            }
            Some(Attribute::InFlight(fut)) => match fut.protocol() {
                crate::future::ProtocolKind::Http => {
                    plain::handle(self, channel, &fut, event).await;
                }
                crate::future::ProtocolKind::WebSocket => {
                    ws::handle(self, channel, &fut, event).await;
                }
            },
        }
    }

    /// A transport failure surfaced on `channel`.
    pub async fn handle_channel_error(&self, channel: &Arc<C>, error: std::io::Error) {
        let attribute = self.registry.attribute(channel.id());
        self.registry.remove_all(channel);
        channel.close();

        if let Some(Attribute::InFlight(fut)) = attribute {
            if fut.ws_open() {
                // The connection outlives the (completed) upgrade
                // future; report the loss at the frame level.
                if let Some(ws) = fut.handler().as_websocket() {
                    ws.on_error(&Error::Io(error));
                    ws.on_close(1006, "connection lost");
                }
                return;
            }
            if fut.is_done() {
                return;
            }
            debug!(channel = channel.id(), %error, "channel error");
            if self.sender.apply_io_filters(&fut, &error).await {
                return;
            }
            if !fut.status_received() && self.sender.retry(channel, &fut).await {
                return;
            }
            fut.abort(Error::Io(error));
        }
    }

    /// `channel` closed without a prior error event.
    pub async fn handle_channel_closed(&self, channel: &Arc<C>) {
        let attribute = self.registry.attribute(channel.id());
        self.registry.remove_all(channel);

        let Some(Attribute::InFlight(fut)) = attribute else {
            return;
        };

        if fut.ws_open() {
            // Abnormal closure of an established WebSocket connection.
            if let Some(ws) = fut.handler().as_websocket() {
                ws.on_close(1006, "connection lost");
            }
            fut.complete();
            return;
        }
        if fut.is_done() {
            return;
        }

        if !fut.status_received() && self.sender.retry(channel, &fut).await {
            return;
        }
        fut.abort(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "channel closed before the response completed",
        )));
    }

    /// Execute a deferred pool-or-close decision.
    fn finalize_disposition(&self, channel: &Arc<C>, disposition: Disposition) {
        if disposition.keep_alive
            && channel.is_open()
            && self
                .registry
                .offer_to_pool(disposition.pool_key, channel.clone())
        {
            return;
        }
        self.registry.remove_all(channel);
        channel.close();
    }

    /// Pool or close `channel` now that `fut` is finished with it.
    fn dispose_channel(&self, channel: &Arc<C>, fut: &Arc<RequestFuture<C>>, keep_alive: bool) {
        fut.detach_channel();
        self.registry
            .set_attribute(channel.id(), Attribute::Discard);
        if keep_alive
            && self.config.keep_alive
            && channel.is_open()
            && self
                .registry
                .offer_to_pool(fut.pool_key(), channel.clone())
        {
            return;
        }
        self.registry.remove_all(channel);
        channel.close();
    }

    /// Park `channel` until its in-flight response drains, then pool
    /// or close it.
    fn dispose_after_drain(&self, channel: &Arc<C>, fut: &Arc<RequestFuture<C>>, keep_alive: bool) {
        fut.detach_channel();
        self.registry.set_attribute(
            channel.id(),
            Attribute::OnDrain(Disposition {
                pool_key: fut.pool_key(),
                keep_alive: keep_alive && self.config.keep_alive,
            }),
        );
        channel.drain();
    }

    /// Run the response filter chain. Returns `true` when the event
    /// was fully handled here (replay or filter-driven abort).
    async fn maybe_replay(&self, fut: &Arc<RequestFuture<C>>, head: &ResponseHead) -> bool {
        if self.config.response_filters.is_empty() {
            return false;
        }
        let mut ctx = FilterContext::new(
            fut.handler(),
            fut.request(),
            head.status,
            head.headers.clone(),
        );
        for filter in &self.config.response_filters {
            ctx = match filter.filter(ctx) {
                Ok(ctx) => ctx,
                Err(err) => {
                    fut.abort(Error::FilterAborted(err));
                    return true;
                }
            };
        }
        fut.set_handler(ctx.handler);
        if ctx.replay && fut.can_be_replayed() {
            debug!(status = %head.status, "response filter requested replay");
            self.sender.replay_request(fut, ctx.request).await;
            return true;
        }
        false
    }

    /// Follow a redirect response. Returns `true` when the event was
    /// handled here (next hop dispatched, or the redirect limit hit).
    async fn maybe_redirect(
        &self,
        channel: &Arc<C>,
        fut: &Arc<RequestFuture<C>>,
        head: &ResponseHead,
    ) -> bool {
        let request = fut.request();
        let follow = request
            .follow_redirects
            .unwrap_or(self.config.follow_redirects);
        if !follow || !REDIRECT_STATUSES.contains(&head.status) {
            return false;
        }

        let hops = fut.increment_and_get_redirects();
        if hops >= self.config.max_redirects {
            fut.abort(Error::MaxRedirectsExceeded(self.config.max_redirects));
            return true;
        }

        // A new target means any previous challenge round is void.
        fut.set_auth_performed(false);

        let Some(location) = head
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            debug!(status = %head.status, "redirect response without usable location");
            return false;
        };
        let Some(next_uri) = resolve_location(&request.uri, location) else {
            debug!(location, "unresolvable redirect location");
            return false;
        };
        let next_uri = preserve_ws_scheme(&request.uri, next_uri);
        let next_uri = if self.config.remove_query_params_on_redirect {
            strip_query(next_uri)
        } else {
            next_uri
        };
        if next_uri == request.uri {
            return false;
        }

        let next_request = self.build_redirect_request(&request, next_uri, head);

        trace!(
            status = %head.status,
            uri = %next_request.uri,
            hop = hops,
            "following redirect"
        );

        // The channel that produced this response is done with the
        // current hop; what happens to it depends on how much of the
        // response is still in flight.
        if head.has_body() {
            self.dispose_after_drain(channel, fut, head.keep_alive());
        } else {
            self.dispose_channel(channel, fut, head.keep_alive());
        }

        // The hop is a fresh write on whichever channel it rides.
        fut.reset_write_claims();
        fut.set_status_received(false);
        self.sender.send_next_request(next_request, fut.clone()).await;
        true
    }

    fn build_redirect_request(
        &self,
        request: &LogicalRequest,
        next_uri: Uri,
        head: &ResponseHead,
    ) -> LogicalRequest {
        let mut next = request.clone();
        next.uri = next_uri;

        // 303 always rewrites to GET; 302 only outside strict mode.
        let rewrite_to_get = head.status == StatusCode::SEE_OTHER
            || (head.status == StatusCode::FOUND && !self.config.strict_302_handling);
        if rewrite_to_get && next.method != Method::GET {
            next.method = Method::GET;
            next.body = BodySource::None;
        }

        // Carry server cookies forward, replacing by name.
        let set_cookie_values = head
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .chain(head.headers.get_all(SET_COOKIE2).iter());
        for value in set_cookie_values {
            let Some(cookie) = value
                .to_str()
                .ok()
                .and_then(request::parse_set_cookie)
            else {
                continue;
            };
            next.cookies.retain(|c| c.name != cookie.name);
            next.cookies.push(cookie);
        }
        next
    }
}

/// Resolve a `Location` value against the URI it was served for.
fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    let reference = UriReferenceStr::new(location).ok()?;
    let base = UriAbsoluteString::try_from(base.to_string()).ok()?;
    let uri = reference.resolve_against(&base).to_string();
    Uri::try_from(uri).ok()
}

/// Redirects of WebSocket requests stay on the WebSocket schemes.
fn preserve_ws_scheme(original: &Uri, next: Uri) -> Uri {
    if !request::is_websocket(original) {
        return next;
    }
    let mapped = match next.scheme_str() {
        Some("http") => "ws",
        Some("https") => "wss",
        _ => return next,
    };
    let mut parts = next.into_parts();
    // "ws" and "wss" are valid schemes, so this cannot fail.
    if let Ok(scheme) = http::uri::Scheme::try_from(mapped) {
        parts.scheme = Some(scheme);
    }
    Uri::from_parts(parts).unwrap_or(original.clone())
}

fn strip_query(uri: Uri) -> Uri {
    if uri.query().is_none() {
        return uri;
    }
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        uri.path()
            .parse()
            .unwrap_or(http::uri::PathAndQuery::from_static("/")),
    );
    Uri::from_parts(parts).unwrap_or(uri)
}
