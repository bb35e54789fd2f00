//! The logical request value and its body sources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::auth::Realm;
use crate::config::ProxyServer;
use crate::registry::PoolKeyStrategy;

/// One of the payload shapes a request can carry.
///
/// At most one source is in effect; precedence when a caller sets
/// several is resolved by the encoder.
#[derive(Clone)]
pub enum BodySource {
    None,
    Bytes(Bytes),
    Text(String),
    /// Pull-based chunked body, replayable when [`BodyStream::resettable`].
    Stream(Arc<dyn BodyStream>),
    /// URL-encoded form parameters.
    Form(Vec<(String, String)>),
    Multipart(Vec<Part>),
    File(FileRegion),
    /// Push-fed body with backpressure, e.g. a caller feeding
    /// chunks as they become available.
    Generator(Arc<dyn BodyGenerator>),
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Text(t) => write!(f, "Text({} chars)", t.len()),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Form(params) => write!(f, "Form({} params)", params.len()),
            Self::Multipart(parts) => write!(f, "Multipart({} parts)", parts.len()),
            Self::File(region) => write!(f, "File({region:?})"),
            Self::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// Pull-based body chunk producer.
pub trait BodyStream: Send + Sync + 'static {
    /// Next chunk, or `None` when the stream is exhausted.
    fn next_chunk(&self) -> Option<Bytes>;

    /// Whether [`reset`](Self::reset) rewinds this stream to its start.
    fn resettable(&self) -> bool;

    fn reset(&self);
}

/// Outcome of polling a [`BodyGenerator`].
#[derive(Debug, Clone)]
pub enum GeneratedChunk {
    Data(Bytes),
    /// Nothing available right now; the generator will invoke its
    /// feed listener once more data arrives.
    Pending,
    End,
}

/// Invoked by a generator when new data is available for writing.
pub type FeedListener = Arc<dyn Fn() + Send + Sync>;

/// Push-fed body producer with backpressure.
pub trait BodyGenerator: Send + Sync + 'static {
    fn poll_chunk(&self) -> GeneratedChunk;

    fn set_feed_listener(&self, _listener: FeedListener) {}
}

#[derive(Debug, Clone)]
/// One part of a multipart body.
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
/// A region of a file on disk, usable for zero-copy transfer
/// on plaintext channels.
pub struct FileRegion {
    pub path: PathBuf,
    pub offset: u64,
    /// `None` means up to the end of the file.
    pub length: Option<u64>,
}

impl FileRegion {
    pub fn whole(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Client cookie attached to a request.
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub max_age: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            secure: false,
            http_only: false,
            max_age: None,
        }
    }
}

/// Encode client cookies into a single `Cookie` header value.
///
/// `rfc6265` selects the modern `name=value; name=value` form;
/// otherwise the legacy `$Version` prefix is emitted.
pub fn encode_client_cookies(cookies: &[Cookie], rfc6265: bool) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let pairs = cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ");
    Some(if rfc6265 {
        pairs
    } else {
        format!("$Version=1; {pairs}")
    })
}

/// Minimal `Set-Cookie` parse: leading `name=value` pair only.
/// Attribute handling belongs to the caller's cookie jar.
pub fn parse_set_cookie(value: &str) -> Option<Cookie> {
    let pair = value.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Cookie::new(name, value.trim()))
}

/// Immutable description of what the caller wants sent.
///
/// Rebuilt (never mutated) when a redirect or filter replay
/// produces a follow-up request.
#[derive(Clone)]
pub struct LogicalRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie>,
    pub body: BodySource,
    /// Overrides the `Host` header derived from the URI.
    pub virtual_host: Option<String>,
    pub realm: Option<Realm>,
    pub proxy: Option<ProxyServer>,
    pub follow_redirects: Option<bool>,
    pub pool_key_strategy: Option<Arc<dyn PoolKeyStrategy>>,
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for LogicalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &self.body)
            .field("virtual_host", &self.virtual_host)
            .field("follow_redirects", &self.follow_redirects)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl LogicalRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: BodySource::None,
            virtual_host: None,
            realm: None,
            proxy: None,
            follow_redirects: None,
            pool_key_strategy: None,
            request_timeout: None,
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    #[must_use]
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: BodySource) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    #[must_use]
    pub fn with_realm(mut self, realm: Realm) -> Self {
        self.realm = Some(realm);
        self
    }

    #[must_use]
    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }
}

/// Whether the target scheme implies TLS (`https` or `wss`).
pub fn is_secure(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("https") | Some("wss"))
}

/// Whether the target scheme is a WebSocket scheme (`ws` or `wss`).
pub fn is_websocket(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("ws") | Some("wss"))
}

/// Port of the URI, falling back to the scheme default.
pub fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or_else(|| if is_secure(uri) { 443 } else { 80 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_classification() {
        let https: Uri = "https://example.com/a".parse().unwrap();
        let ws: Uri = "ws://example.com/chat".parse().unwrap();
        let wss: Uri = "wss://example.com/chat".parse().unwrap();

        assert!(is_secure(&https));
        assert!(!is_websocket(&https));
        assert!(is_websocket(&ws));
        assert!(!is_secure(&ws));
        assert!(is_websocket(&wss));
        assert!(is_secure(&wss));
    }

    #[test]
    fn effective_port_defaults() {
        let plain: Uri = "http://example.com/".parse().unwrap();
        let tls: Uri = "wss://example.com/".parse().unwrap();
        let explicit: Uri = "http://example.com:8080/".parse().unwrap();

        assert_eq!(effective_port(&plain), 80);
        assert_eq!(effective_port(&tls), 443);
        assert_eq!(effective_port(&explicit), 8080);
    }

    #[test]
    fn cookie_header_encodings() {
        let cookies = vec![Cookie::new("a", "1"), Cookie::new("b", "2")];
        assert_eq!(
            encode_client_cookies(&cookies, true).as_deref(),
            Some("a=1; b=2")
        );
        assert_eq!(
            encode_client_cookies(&cookies, false).as_deref(),
            Some("$Version=1; a=1; b=2")
        );
        assert!(encode_client_cookies(&[], true).is_none());
    }

    #[test]
    fn set_cookie_parse_keeps_leading_pair() {
        let cookie = parse_set_cookie("sid=abc123; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "abc123");
        assert!(parse_set_cookie("; Path=/").is_none());
    }
}
