//! The request sender: channel acquisition, request writing,
//! retry on connection loss and filter-driven replay.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::Method;
use tracing::{debug, trace, warn};

use crate::channel::{BodyPayload, Channel, ChunkedFile, ChunkedInput, MultipartChunks};
use crate::config::{ClientConfig, ProxyServer};
use crate::encode::{self, WireBody};
use crate::error::Error;
use crate::filter::IoFilterContext;
use crate::future::{FutureState, ProtocolKind, RequestFuture};
use crate::handler::ResponseHandler;
use crate::registry::{Attribute, ChannelRegistry, Disposition, PoolKey, default_pool_key};
use crate::request::{self, LogicalRequest};

/// Resolved endpoint a connector dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Establishes channels towards remote endpoints.
pub trait Connector<C>: Send + Sync + 'static {
    fn connect(&self, addr: &RemoteAddr) -> impl Future<Output = io::Result<Arc<C>>> + Send;
}

/// Outcome of writing a request onto a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    /// Nothing (or nothing replayable) was written;
    /// do not arm the reaper for it.
    SkipReaper,
}

/// Drives logical requests onto channels.
pub struct RequestSender<C, CN> {
    config: Arc<ClientConfig>,
    registry: Arc<ChannelRegistry<C>>,
    connector: CN,
    closed: Arc<AtomicBool>,
}

impl<C: Channel, CN: Connector<C>> RequestSender<C, CN> {
    pub fn new(
        config: Arc<ClientConfig>,
        registry: Arc<ChannelRegistry<C>>,
        connector: CN,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.registry.is_closed()
    }

    /// Dispatch `request`, either as a fresh logical request or as the
    /// next hop of an existing `future` (redirect, retry, replay).
    ///
    /// Failures after the future exists are delivered through its error
    /// callback; the future is still returned so the caller can await
    /// the terminal outcome. `reclaim` marks re-sends that inherit the
    /// connection accounting of the channel they replace.
    pub async fn send_request(
        &self,
        request: LogicalRequest,
        handler: Arc<dyn ResponseHandler>,
        future: Option<Arc<RequestFuture<C>>>,
        reclaim: bool,
    ) -> Result<Arc<RequestFuture<C>>, Error> {
        if self.is_closed() {
            return match future {
                Some(fut) => {
                    fut.abort(Error::ClientClosed);
                    Ok(fut)
                }
                None => Err(Error::ClientClosed),
            };
        }

        let websocket = request::is_websocket(&request.uri);
        if future.is_none() && websocket {
            if request.method != Method::GET {
                return Err(Error::InvalidRequest(
                    "WebSocket requests must use the GET method".to_owned(),
                ));
            }
            if handler.as_websocket().is_none() {
                return Err(Error::InvalidRequest(
                    "WebSocket request with a handler lacking WebSocket capability".to_owned(),
                ));
            }
        }

        let proxy = self.resolve_proxy(&request).cloned();
        let proxy = proxy.as_ref();
        let pool_key = self.resolve_pool_key(&request, proxy)?;

        let fut = match future {
            Some(fut) => {
                fut.set_request(request.clone());
                fut.set_pool_key(pool_key.clone());
                fut
            }
            None => {
                let protocol = if websocket {
                    ProtocolKind::WebSocket
                } else {
                    ProtocolKind::Http
                };
                RequestFuture::new(request.clone(), handler, pool_key.clone(), protocol)
            }
        };

        // Prefer the channel the future is already bound to, then a
        // pooled channel for the same key, then a fresh connection.
        let cached = fut
            .channel()
            .filter(|_| fut.reuse_channel())
            .or_else(|| self.registry.lookup_pooled(&pool_key))
            .filter(|channel| {
                if channel.is_active() {
                    true
                } else {
                    self.registry.remove_all(channel);
                    channel.close();
                    false
                }
            });

        if let Some(channel) = cached {
            let wire = match encode::encode(
                &self.config,
                &request,
                &request.uri,
                fut.connect_allowed(),
                proxy,
            ) {
                Ok(wire) => wire,
                Err(err) => {
                    fut.abort(err);
                    return Ok(fut);
                }
            };
            fut.set_wire(wire);
            fut.set_state(FutureState::Pooled);
            fut.attach_channel(channel.clone(), true);
            self.registry
                .set_attribute(channel.id(), Attribute::InFlight(fut.clone()));

            match self.write_request(&fut, &channel).await {
                Ok(WriteOutcome::Written) => {
                    self.schedule_reaper(&fut);
                    return Ok(fut);
                }
                Ok(WriteOutcome::SkipReaper) => return Ok(fut),
                Err(err)
                    if channel.is_tls() && err.kind() == io::ErrorKind::InvalidData =>
                {
                    // TLS engine rejected the reused channel; fall back
                    // to a fresh connection for this future.
                    debug!(pool_key = %pool_key, %err, "pooled TLS channel unusable, reconnecting");
                    fut.detach_channel();
                    fut.reset_write_claims();
                    self.registry.remove_all(&channel);
                    channel.close();
                }
                Err(err) => {
                    fut.abort(Error::Io(err));
                    return Ok(fut);
                }
            }
        }

        self.send_on_new_channel(request, fut, proxy, pool_key, reclaim)
            .await
    }

    /// Re-send the future's current request, inheriting its
    /// connection accounting.
    pub async fn send_next_request(&self, request: LogicalRequest, fut: Arc<RequestFuture<C>>) {
        let handler = fut.handler();
        if let Err(err) = self.send_request(request, handler, Some(fut.clone()), true).await {
            fut.abort(err);
        }
    }

    async fn send_on_new_channel(
        &self,
        request: LogicalRequest,
        fut: Arc<RequestFuture<C>>,
        proxy: Option<&ProxyServer>,
        pool_key: PoolKey,
        reclaim: bool,
    ) -> Result<Arc<RequestFuture<C>>, Error> {
        let host = pool_key.host.clone();
        let acquired = !reclaim && self.registry.acquire_slot(&host);
        if !reclaim && !acquired {
            // Over capacity. The bound is advisory: proceed without
            // accounting rather than stalling the event path.
            trace!(pool_key = %pool_key, "connection limit reached, proceeding unaccounted");
        }

        let wire = match encode::encode(&self.config, &request, &request.uri, true, proxy) {
            Ok(wire) => wire,
            Err(err) => {
                if acquired {
                    self.registry.release_slot(&host);
                }
                fut.abort(err);
                return Ok(fut);
            }
        };
        fut.set_wire(wire);
        fut.set_state(FutureState::Connecting);

        let addr = match proxy {
            Some(proxy) => RemoteAddr {
                host: proxy.host.clone(),
                port: proxy.port,
            },
            None => RemoteAddr {
                host: request
                    .uri
                    .host()
                    .unwrap_or(pool_key.host.as_str())
                    .to_owned(),
                port: request::effective_port(&request.uri),
            },
        };

        trace!(pool_key = %pool_key, remote = %addr, "connecting");
        let channel = match self.connector.connect(&addr).await {
            Ok(channel) => channel,
            Err(err) => {
                if acquired {
                    self.registry.release_slot(&host);
                }
                fut.abort(Error::Io(err));
                return Ok(fut);
            }
        };

        self.registry.register(channel.clone());
        fut.attach_channel(channel.clone(), false);
        self.registry
            .set_attribute(channel.id(), Attribute::InFlight(fut.clone()));

        match self.write_request(&fut, &channel).await {
            Ok(WriteOutcome::Written) => self.schedule_reaper(&fut),
            Ok(WriteOutcome::SkipReaper) => {}
            Err(err) => fut.abort(Error::Io(err)),
        }
        Ok(fut)
    }

    /// Write head and body onto `channel`, each at most once per
    /// encode. Failures propagate to the caller, which decides
    /// between fallback and abort.
    async fn write_request(
        &self,
        fut: &Arc<RequestFuture<C>>,
        channel: &Arc<C>,
    ) -> io::Result<WriteOutcome> {
        if !channel.is_open() || !channel.is_active() {
            // The closed-channel event will drive the retry.
            return Ok(WriteOutcome::SkipReaper);
        }
        let Some(wire) = fut.wire() else {
            return Ok(WriteOutcome::SkipReaper);
        };

        fut.handler().headers_snapshot(&wire.headers);

        if fut.claim_headers_write() {
            fut.set_state(FutureState::Writing);
            fut.handler().on_request_sent();
            channel.write_headers(&wire).await?;
            fut.touch();
        }

        // A CONNECT head carries no body; the tunneled request
        // follows once the tunnel is up.
        if wire.method != Method::CONNECT && fut.claim_body_write() {
            let payload = match wire.body {
                WireBody::None => None,
                WireBody::InMemory(data) => Some(BodyPayload::Full(data)),
                WireBody::Stream(stream) => {
                    if !fut.claim_stream() {
                        if stream.resettable() {
                            stream.reset();
                        } else {
                            warn!(
                                "stream body already consumed and not resettable, \
                                 request cannot be written again"
                            );
                            return Ok(WriteOutcome::SkipReaper);
                        }
                    }
                    Some(BodyPayload::Chunked(ChunkedInput::Stream(stream)))
                }
                WireBody::File(region) => {
                    if channel.is_tls() {
                        Some(BodyPayload::Chunked(ChunkedInput::File(ChunkedFile::new(
                            region,
                        ))))
                    } else {
                        Some(BodyPayload::FileRegion(region))
                    }
                }
                WireBody::Multipart(chunks) => Some(BodyPayload::Chunked(
                    ChunkedInput::Multipart(MultipartChunks::new(chunks)),
                )),
                WireBody::Generator(generator) => {
                    let transfer_channel = channel.clone();
                    generator.set_feed_listener(Arc::new(move || {
                        transfer_channel.resume_transfer();
                    }));
                    Some(BodyPayload::Chunked(ChunkedInput::Generator(generator)))
                }
            };
            if let Some(payload) = payload {
                channel.write_body(payload).await?;
                fut.touch();
            }
        }

        Ok(WriteOutcome::Written)
    }

    /// Arm the per-future inactivity reaper.
    fn schedule_reaper(&self, fut: &Arc<RequestFuture<C>>) {
        let request_timeout = fut
            .request()
            .request_timeout
            .or(self.config.request_timeout);
        let window = match (request_timeout, self.config.idle_connection_timeout) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return,
        };
        if window.is_zero() {
            return;
        }

        fut.touch();
        let fut = fut.clone();
        let watched = fut.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(reaper_sleep(&watched, window)).await;
                if watched.is_done() {
                    return;
                }
                if watched.last_touch().elapsed() >= window {
                    debug!(?window, "reaping inactive request");
                    watched.abort(Error::Timeout);
                    return;
                }
            }
        })
        .abort_handle();
        fut.set_reaper(handle);
    }

    /// Re-send a future whose channel was lost before the response
    /// completed. Returns `false` when the future cannot be replayed.
    pub async fn retry(&self, channel: &Arc<C>, fut: &Arc<RequestFuture<C>>) -> bool {
        self.registry.remove_all(channel);
        if self.is_closed() {
            return false;
        }
        if !fut.can_be_replayed() {
            return false;
        }

        trace!(pool_key = %fut.pool_key(), "channel lost, retrying request");
        fut.set_state(FutureState::Reconnected);
        fut.set_status_received(false);
        fut.reset_write_claims();
        fut.detach_channel();
        fut.handler().on_retry();

        let request = fut.request();
        self.send_next_request(request, fut.clone()).await;
        if fut.state() == FutureState::Closed {
            return false;
        }
        true
    }

    /// Run the IO-exception filter chain over a transport failure.
    ///
    /// Returns `true` when the failure was handled, by replay or by
    /// a filter-driven abort. `false` means the caller still owns it.
    pub async fn apply_io_filters(&self, fut: &Arc<RequestFuture<C>>, error: &io::Error) -> bool {
        if self.config.io_exception_filters.is_empty() {
            return false;
        }
        let mut ctx = IoFilterContext {
            handler: fut.handler(),
            request: fut.request(),
            error,
            replay: false,
        };
        for filter in &self.config.io_exception_filters {
            ctx = match filter.filter(ctx) {
                Ok(ctx) => ctx,
                Err(err) => {
                    fut.abort(Error::FilterAborted(err));
                    return true;
                }
            };
        }
        if !ctx.replay || !fut.can_be_replayed() {
            return false;
        }
        let IoFilterContext {
            handler, request, ..
        } = ctx;
        fut.set_handler(handler);
        self.replay_request(fut, request).await;
        true
    }

    /// Abandon the in-flight response and send `request` anew
    /// on the same future.
    pub async fn replay_request(&self, fut: &Arc<RequestFuture<C>>, request: LogicalRequest) {
        if self.is_closed() {
            fut.abort(Error::ClientClosed);
            return;
        }

        if let Some(channel) = fut.detach_channel() {
            let keep_alive = fut.keep_alive() && self.config.keep_alive;
            self.registry.set_attribute(
                channel.id(),
                Attribute::OnDrain(Disposition {
                    pool_key: fut.pool_key(),
                    keep_alive,
                }),
            );
            channel.drain();
        }

        fut.reset_write_claims();
        fut.set_status_received(false);
        fut.set_state(FutureState::New);
        fut.touch();
        fut.handler().on_retry();

        self.send_next_request(request, fut.clone()).await;
    }

    fn resolve_proxy<'a>(&'a self, request: &'a LogicalRequest) -> Option<&'a ProxyServer> {
        let proxy = request.proxy.as_ref().or(self.config.proxy.as_ref())?;
        let host = request.uri.host()?;
        if proxy.avoid_proxy(host) {
            return None;
        }
        Some(proxy)
    }

    /// Pool key of the channel this request will ride on: the proxy
    /// authority for plaintext proxying, the target authority (or the
    /// caller strategy's key) otherwise.
    fn resolve_pool_key(
        &self,
        request: &LogicalRequest,
        proxy: Option<&ProxyServer>,
    ) -> Result<PoolKey, Error> {
        if let Some(proxy) = proxy {
            if !request::is_secure(&request.uri) {
                return Ok(PoolKey {
                    scheme: "http".to_owned(),
                    host: proxy.host.clone(),
                    port: proxy.port,
                });
            }
        }
        match &request.pool_key_strategy {
            Some(strategy) => strategy.key(&request.uri),
            None => default_pool_key(&request.uri),
        }
    }
}

fn reaper_sleep<C: Channel>(fut: &RequestFuture<C>, window: Duration) -> Duration {
    let elapsed = fut.last_touch().elapsed();
    window.saturating_sub(elapsed).max(Duration::from_millis(10))
}
