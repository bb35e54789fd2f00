//! The pending request future: per-request mutable state,
//! exactly-once terminal delivery and progress tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::channel::Channel;
use crate::encode::WireRequest;
use crate::error::Error;
use crate::handler::ResponseHandler;
use crate::registry::PoolKey;
use crate::request::{BodySource, LogicalRequest};

/// Lifecycle states of a [`RequestFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    New,
    /// Bound to a channel taken from the pool.
    Pooled,
    Connecting,
    Writing,
    ResponseReceived,
    /// Re-sent on a fresh channel after losing the previous one.
    Reconnected,
    Done,
    Closed,
}

/// Which response interpretation this request was dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Http,
    WebSocket,
}

struct FutureInner<C> {
    request: LogicalRequest,
    /// Key of the channel this future is (or will be) bound to.
    /// Stable across same-authority redirects, recomputed otherwise.
    pool_key: PoolKey,
    wire: Option<WireRequest>,
    handler: Arc<dyn ResponseHandler>,
    channel: Option<Arc<C>>,
    state: FutureState,
    /// Channel was pooled; prefer reusing it over a fresh connect.
    reuse_channel: bool,
    keep_alive: bool,
    reaper: Option<tokio::task::AbortHandle>,
    outcome: Option<Result<(), Error>>,
}

/// Mutable single-owner state machine of one logical request.
///
/// Shared as `Arc` between the sender, the dispatcher and the reaper;
/// the terminal transition is guarded so the caller's completion or
/// error callback fires exactly once.
pub struct RequestFuture<C> {
    inner: Mutex<FutureInner<C>>,
    protocol: ProtocolKind,
    redirects: AtomicU32,
    status_received: AtomicBool,
    headers_written: AtomicBool,
    body_written: AtomicBool,
    stream_consumed: AtomicBool,
    auth_performed: AtomicBool,
    ws_open: AtomicBool,
    /// Whether a proxy tunnel may still be established on
    /// the next encode of this future.
    connect_allowed: AtomicBool,
    done: AtomicBool,
    cancelled: AtomicBool,
    last_touch: Mutex<Instant>,
    completion: Notify,
}

impl<C: Channel> RequestFuture<C> {
    pub fn new(
        request: LogicalRequest,
        handler: Arc<dyn ResponseHandler>,
        pool_key: PoolKey,
        protocol: ProtocolKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FutureInner {
                request,
                pool_key,
                wire: None,
                handler,
                channel: None,
                state: FutureState::New,
                reuse_channel: false,
                keep_alive: true,
                reaper: None,
                outcome: None,
            }),
            protocol,
            redirects: AtomicU32::new(0),
            status_received: AtomicBool::new(false),
            headers_written: AtomicBool::new(false),
            body_written: AtomicBool::new(false),
            stream_consumed: AtomicBool::new(false),
            auth_performed: AtomicBool::new(false),
            ws_open: AtomicBool::new(false),
            connect_allowed: AtomicBool::new(true),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            last_touch: Mutex::new(Instant::now()),
            completion: Notify::new(),
        })
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn pool_key(&self) -> PoolKey {
        self.inner.lock().pool_key.clone()
    }

    pub fn set_pool_key(&self, pool_key: PoolKey) {
        self.inner.lock().pool_key = pool_key;
    }

    pub fn request(&self) -> LogicalRequest {
        self.inner.lock().request.clone()
    }

    pub fn handler(&self) -> Arc<dyn ResponseHandler> {
        self.inner.lock().handler.clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.inner.lock().handler = handler;
    }

    /// Replace the logical request, e.g. with the rebuilt request
    /// of a redirect hop.
    pub fn set_request(&self, request: LogicalRequest) {
        self.inner.lock().request = request;
    }

    pub fn wire(&self) -> Option<WireRequest> {
        self.inner.lock().wire.clone()
    }

    pub fn set_wire(&self, wire: WireRequest) {
        self.inner.lock().wire = Some(wire);
    }

    pub fn state(&self) -> FutureState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: FutureState) {
        self.inner.lock().state = state;
    }

    pub fn channel(&self) -> Option<Arc<C>> {
        self.inner.lock().channel.clone()
    }

    pub fn attach_channel(&self, channel: Arc<C>, reuse: bool) {
        let mut inner = self.inner.lock();
        inner.channel = Some(channel);
        inner.reuse_channel = reuse;
    }

    pub fn detach_channel(&self) -> Option<Arc<C>> {
        let mut inner = self.inner.lock();
        inner.reuse_channel = false;
        inner.channel.take()
    }

    pub fn reuse_channel(&self) -> bool {
        self.inner.lock().reuse_channel
    }

    pub fn keep_alive(&self) -> bool {
        self.inner.lock().keep_alive
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.inner.lock().keep_alive = keep_alive;
    }

    pub fn set_reaper(&self, handle: tokio::task::AbortHandle) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.reaper.replace(handle) {
            previous.abort();
        }
    }

    /// Bump and read the redirect counter for the hop being taken.
    pub fn increment_and_get_redirects(&self) -> u32 {
        self.redirects.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_status_received(&self, received: bool) {
        self.status_received.store(received, Ordering::Release);
    }

    pub fn status_received(&self) -> bool {
        self.status_received.load(Ordering::Acquire)
    }

    /// Claim the header write. Returns `false` when already claimed.
    pub fn claim_headers_write(&self) -> bool {
        !self.headers_written.swap(true, Ordering::AcqRel)
    }

    /// Claim the body write. Returns `false` when already claimed.
    pub fn claim_body_write(&self) -> bool {
        !self.body_written.swap(true, Ordering::AcqRel)
    }

    /// Reset the write claims for a re-send on a fresh channel.
    pub fn reset_write_claims(&self) {
        self.headers_written.store(false, Ordering::Release);
        self.body_written.store(false, Ordering::Release);
    }

    /// Mark the streaming body as consumed.
    /// Returns `false` when it already was.
    pub fn claim_stream(&self) -> bool {
        !self.stream_consumed.swap(true, Ordering::AcqRel)
    }

    pub fn stream_consumed(&self) -> bool {
        self.stream_consumed.load(Ordering::Acquire)
    }

    pub fn clear_stream_consumed(&self) {
        self.stream_consumed.store(false, Ordering::Release);
    }

    pub fn set_auth_performed(&self, performed: bool) {
        self.auth_performed.store(performed, Ordering::Release);
    }

    pub fn auth_performed(&self) -> bool {
        self.auth_performed.load(Ordering::Acquire)
    }

    /// Claim the WebSocket `on_open` delivery.
    /// Returns `false` when already delivered.
    pub fn claim_ws_open(&self) -> bool {
        !self.ws_open.swap(true, Ordering::AcqRel)
    }

    pub fn ws_open(&self) -> bool {
        self.ws_open.load(Ordering::Acquire)
    }

    pub fn connect_allowed(&self) -> bool {
        self.connect_allowed.load(Ordering::Acquire)
    }

    /// A proxy tunnel is now established on the bound channel;
    /// subsequent encodes must not emit CONNECT again.
    pub fn disallow_connect(&self) {
        self.connect_allowed.store(false, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record progress for the reaper.
    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    pub fn last_touch(&self) -> Instant {
        *self.last_touch.lock()
    }

    /// Whether this future may be re-sent on a fresh channel.
    ///
    /// A consumed streaming body blocks replay unless the
    /// stream can rewind.
    pub fn can_be_replayed(&self) -> bool {
        if self.is_done() || self.is_cancelled() {
            return false;
        }
        if !self.stream_consumed() {
            return true;
        }
        match &self.inner.lock().request.body {
            BodySource::Stream(stream) => stream.resettable(),
            _ => true,
        }
    }

    /// Terminal success. Delivers `on_completed` exactly once;
    /// later calls are no-ops.
    pub fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let (handler, reaper, pool_key) = {
            let mut inner = self.inner.lock();
            inner.state = FutureState::Done;
            inner.outcome = Some(Ok(()));
            (inner.handler.clone(), inner.reaper.take(), inner.pool_key.clone())
        };
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        trace!(pool_key = %pool_key, "request future completed");
        handler.on_completed();
        self.completion.notify_waiters();
    }

    /// Terminal failure. Delivers `on_error` exactly once and closes
    /// the bound channel; later calls are no-ops.
    pub fn abort(&self, error: Error) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let (handler, channel, reaper, pool_key) = {
            let mut inner = self.inner.lock();
            inner.state = FutureState::Closed;
            (
                inner.handler.clone(),
                inner.channel.take(),
                inner.reaper.take(),
                inner.pool_key.clone(),
            )
        };
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        trace!(pool_key = %pool_key, %error, "request future aborted");
        handler.on_error(&error);
        if let Some(ws) = handler.as_websocket() {
            if self.ws_open() {
                ws.on_error(&error);
            }
        }
        self.inner.lock().outcome = Some(Err(error));
        if let Some(channel) = channel {
            channel.close();
        }
        self.completion.notify_waiters();
    }

    /// Caller-driven cancellation: terminal, closes the owned
    /// channel, no completion or error callback.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let (channel, reaper) = {
            let mut inner = self.inner.lock();
            inner.state = FutureState::Closed;
            inner.outcome = Some(Err(Error::ClientClosed));
            (inner.channel.take(), inner.reaper.take())
        };
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        self.completion.notify_waiters();
    }

    /// Wait for the terminal transition and take its outcome.
    /// Single consumer.
    pub async fn wait(&self) -> Result<(), Error> {
        loop {
            if self.is_done() {
                if let Some(outcome) = self.inner.lock().outcome.take() {
                    return outcome;
                }
                // Terminal flag is set before the outcome lands;
                // yield until the writer finishes.
                tokio::task::yield_now().await;
                continue;
            }
            self.completion.notified().await;
        }
    }
}

impl<C> std::fmt::Debug for RequestFuture<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("protocol", &self.protocol)
            .field("redirects", &self.redirects.load(Ordering::Relaxed))
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BodyPayload, ChannelId};
    use crate::handler::{HandlerState, ResponseHandler};
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use std::io;
    use std::sync::atomic::AtomicUsize;

    struct NullChannel;

    impl Channel for NullChannel {
        fn id(&self) -> ChannelId {
            0
        }
        async fn write_headers(&self, _head: &WireRequest) -> io::Result<()> {
            Ok(())
        }
        async fn write_body(&self, _payload: BodyPayload) -> io::Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn is_active(&self) -> bool {
            true
        }
        fn close(&self) {}
        fn is_tls(&self) -> bool {
            false
        }
        fn resume_transfer(&self) {}
        fn drain(&self) {}
        fn upgrade_to_websocket(&self) {}
    }

    #[derive(Default)]
    struct CountingHandler {
        completed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ResponseHandler for CountingHandler {
        fn on_status(&self, _: StatusCode) -> HandlerState {
            HandlerState::Continue
        }
        fn on_headers(&self, _: &HeaderMap) -> HandlerState {
            HandlerState::Continue
        }
        fn on_body_part(&self, _: &Bytes, _: bool) -> HandlerState {
            HandlerState::Continue
        }
        fn on_completed(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn future(handler: Arc<CountingHandler>) -> Arc<RequestFuture<NullChannel>> {
        RequestFuture::new(
            LogicalRequest::new(Method::GET, "http://example.com/".parse().unwrap()),
            handler,
            PoolKey {
                scheme: "http".to_owned(),
                host: "example.com".to_owned(),
                port: 80,
            },
            ProtocolKind::Http,
        )
    }

    #[tokio::test]
    async fn terminal_callback_fires_exactly_once() {
        let handler = Arc::new(CountingHandler::default());
        let fut = future(handler.clone());

        fut.complete();
        fut.complete();
        fut.abort(Error::Timeout);

        assert_eq!(handler.completed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 0);
        assert!(fut.wait().await.is_ok());
    }

    #[tokio::test]
    async fn abort_wins_when_first() {
        let handler = Arc::new(CountingHandler::default());
        let fut = future(handler.clone());

        fut.abort(Error::Timeout);
        fut.complete();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 0);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert!(matches!(fut.wait().await, Err(Error::Timeout)));
    }

    #[test]
    fn cancel_is_terminal_without_callbacks() {
        let handler = Arc::new(CountingHandler::default());
        let fut = future(handler.clone());

        fut.cancel();
        fut.complete();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 0);
        assert_eq!(handler.errors.load(Ordering::SeqCst), 0);
        assert!(fut.is_cancelled());
    }

    #[test]
    fn write_claims_are_idempotent() {
        let fut = future(Arc::new(CountingHandler::default()));
        assert!(fut.claim_headers_write());
        assert!(!fut.claim_headers_write());
        assert!(fut.claim_body_write());
        assert!(!fut.claim_body_write());

        fut.reset_write_claims();
        assert!(fut.claim_headers_write());
    }

    #[test]
    fn consumed_stream_blocks_replay() {
        struct OneShot;
        impl crate::request::BodyStream for OneShot {
            fn next_chunk(&self) -> Option<Bytes> {
                None
            }
            fn resettable(&self) -> bool {
                false
            }
            fn reset(&self) {}
        }

        let fut = future(Arc::new(CountingHandler::default()));
        fut.set_request(
            LogicalRequest::new(Method::POST, "http://example.com/".parse().unwrap())
                .with_body(BodySource::Stream(Arc::new(OneShot))),
        );

        assert!(fut.can_be_replayed());
        assert!(fut.claim_stream());
        assert!(!fut.can_be_replayed());
    }
}
