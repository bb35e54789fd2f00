#![allow(dead_code)]

//! In-memory channel and connector doubles for driving the engine
//! without a network.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;

use tether::channel::{BodyPayload, Channel, ChannelId, InputChunk};
use tether::encode::WireRequest;
use tether::error::Error;
use tether::handler::{HandlerState, ResponseHandler, WebSocketHandler};
use tether::proto::{ResponseEvent, ResponseHead};
use tether::send::{Connector, RemoteAddr};

pub struct MockChannel {
    id: ChannelId,
    open: AtomicBool,
    tls: bool,
    fail_writes: AtomicBool,
    pub heads: Mutex<Vec<WireRequest>>,
    pub bodies: Mutex<Vec<Vec<u8>>>,
    pub drains: AtomicUsize,
    pub upgraded: AtomicBool,
}

impl MockChannel {
    pub fn new(id: ChannelId, tls: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            open: AtomicBool::new(true),
            tls,
            fail_writes: AtomicBool::new(false),
            heads: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
            drains: AtomicUsize::new(0),
            upgraded: AtomicBool::new(false),
        })
    }

    pub fn fail_next_write(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn last_head(&self) -> WireRequest {
        self.heads.lock().last().expect("no request written").clone()
    }

    pub fn head_count(&self) -> usize {
        self.heads.lock().len()
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn write_headers(&self, head: &WireRequest) -> io::Result<()> {
        if self.fail_writes.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "write failed"));
        }
        self.heads.lock().push(head.clone());
        Ok(())
    }

    async fn write_body(&self, payload: BodyPayload) -> io::Result<()> {
        let mut collected = Vec::new();
        match payload {
            BodyPayload::Full(data) => collected.extend_from_slice(&data),
            BodyPayload::Chunked(input) => loop {
                match input.read_chunk()? {
                    InputChunk::Data(data) => collected.extend_from_slice(&data),
                    InputChunk::Pending | InputChunk::End => break,
                }
            },
            BodyPayload::FileRegion(region) => {
                collected.extend_from_slice(&std::fs::read(&region.path)?);
            }
        }
        self.bodies.lock().push(collected);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open()
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn resume_transfer(&self) {}

    fn drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    fn upgrade_to_websocket(&self) {
        self.upgraded.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    next_id: AtomicU64,
    tls: bool,
    pub fail_connects: AtomicUsize,
    pub connects: Mutex<Vec<RemoteAddr>>,
    pub created: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_tls(false)
    }

    pub fn with_tls(tls: bool) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tls,
            fail_connects: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn channel(&self, index: usize) -> Arc<MockChannel> {
        self.created.lock()[index].clone()
    }
}

impl Connector<MockChannel> for &'static MockConnector {
    async fn connect(&self, addr: &RemoteAddr) -> io::Result<Arc<MockChannel>> {
        self.connects.lock().push(addr.clone());
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let channel = MockChannel::new(self.next_id.fetch_add(1, Ordering::SeqCst), self.tls);
        self.created.lock().push(channel.clone());
        Ok(channel)
    }
}

/// Leak a connector so tests can keep a handle to it while the
/// client owns the `Connector` impl.
pub fn leaked_connector() -> &'static MockConnector {
    init_tracing();
    Box::leak(Box::new(MockConnector::new()))
}

/// Route engine traces to the test writer, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct RecordingHandler {
    pub statuses: Mutex<Vec<u16>>,
    pub body: Mutex<Vec<u8>>,
    pub completed: AtomicUsize,
    pub errors: Mutex<Vec<String>>,
    pub retries: AtomicUsize,
}

impl RecordingHandler {
    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl ResponseHandler for RecordingHandler {
    fn on_status(&self, status: StatusCode) -> HandlerState {
        self.statuses.lock().push(status.as_u16());
        HandlerState::Continue
    }

    fn on_headers(&self, _headers: &HeaderMap) -> HandlerState {
        HandlerState::Continue
    }

    fn on_body_part(&self, data: &Bytes, _last: bool) -> HandlerState {
        self.body.lock().extend_from_slice(data);
        HandlerState::Continue
    }

    fn on_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }

    fn on_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct WsRecordingHandler {
    pub http: RecordingHandler,
    pub opens: AtomicUsize,
    pub fragments: Mutex<Vec<(Vec<u8>, bool, bool)>>,
    pub closes: Mutex<Vec<(u16, String)>>,
    pub ws_errors: Mutex<Vec<String>>,
}

impl ResponseHandler for WsRecordingHandler {
    fn on_status(&self, status: StatusCode) -> HandlerState {
        self.http.statuses.lock().push(status.as_u16());
        if status == StatusCode::SWITCHING_PROTOCOLS {
            HandlerState::Upgrade
        } else {
            HandlerState::Continue
        }
    }

    fn on_headers(&self, _headers: &HeaderMap) -> HandlerState {
        HandlerState::Continue
    }

    fn on_body_part(&self, data: &Bytes, _last: bool) -> HandlerState {
        self.http.body.lock().extend_from_slice(data);
        HandlerState::Continue
    }

    fn on_completed(&self) {
        self.http.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &Error) {
        self.http.errors.lock().push(error.to_string());
    }

    fn as_websocket(&self) -> Option<&dyn WebSocketHandler> {
        Some(self)
    }
}

impl WebSocketHandler for WsRecordingHandler {
    fn on_open(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fragment(&self, data: &Bytes, text: bool, fin: bool) {
        self.fragments.lock().push((data.to_vec(), text, fin));
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.closes.lock().push((code, reason.to_owned()));
    }

    fn on_error(&self, error: &Error) {
        self.ws_errors.lock().push(error.to_string());
    }
}

/// Build a response head event from status + header pairs.
pub fn head(status: u16, headers: &[(&str, &str)]) -> ResponseEvent {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            name.parse::<HeaderName>().expect("valid header name"),
            HeaderValue::from_str(value).expect("valid header value"),
        );
    }
    ResponseEvent::Head(ResponseHead {
        status: StatusCode::from_u16(status).expect("valid status"),
        headers: map,
    })
}

pub fn body_part(data: &[u8], last: bool) -> ResponseEvent {
    ResponseEvent::BodyPart {
        data: Bytes::copy_from_slice(data),
        last,
    }
}
