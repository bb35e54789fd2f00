//! Turns a [`LogicalRequest`] into the wire-level request head and body.
//!
//! Encoding is a pure function of the config, the request and the
//! target URI. Nothing here touches the network.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::header::{
    ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    HOST, ORIGIN, PROXY_AUTHORIZATION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
    TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::auth::{self, AuthScheme, Realm};
use crate::config::{ClientConfig, ProxyServer};
use crate::error::Error;
use crate::request::{self, BodySource, LogicalRequest, Part};

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Characters kept verbatim in URL-encoded form bodies.
const FORM_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'*');

/// Fully encoded request head plus the resolved body shape.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    /// Request target in origin, absolute or authority form.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: WireBody,
}

impl WireRequest {
    /// The `Sec-WebSocket-Key` this request was encoded with, if any.
    pub fn sec_websocket_key(&self) -> Option<&str> {
        self.headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
    }
}

/// Resolved body shape, ready for the channel write path.
#[derive(Clone)]
pub enum WireBody {
    None,
    InMemory(Bytes),
    Stream(std::sync::Arc<dyn request::BodyStream>),
    File(request::FileRegion),
    /// Pre-encoded multipart chunks, written with chunked
    /// transfer encoding.
    Multipart(Vec<Bytes>),
    Generator(std::sync::Arc<dyn request::BodyGenerator>),
}

impl std::fmt::Debug for WireBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::InMemory(b) => write!(f, "InMemory({} bytes)", b.len()),
            Self::Stream(_) => f.write_str("Stream"),
            Self::File(region) => write!(f, "File({region:?})"),
            Self::Multipart(chunks) => write!(f, "Multipart({} chunks)", chunks.len()),
            Self::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// Encode `request` for transmission towards `uri`.
///
/// `allow_connect` permits emitting a `CONNECT` request when a TLS
/// target is reached through `proxy`; it is cleared by the sender
/// once the tunnel for a channel has been established.
pub fn encode(
    config: &ClientConfig,
    request: &LogicalRequest,
    uri: &Uri,
    allow_connect: bool,
    proxy: Option<&ProxyServer>,
) -> Result<WireRequest, Error> {
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidRequest("target uri without host".to_owned()))?;
    let port = request::effective_port(uri);
    let secure = request::is_secure(uri);
    let websocket = request::is_websocket(uri);
    let use_connect = allow_connect && secure && proxy.is_some();

    let method = if use_connect {
        Method::CONNECT
    } else {
        request.method.clone()
    };
    // Tunnel establishment predates HTTP/1.1 chunked semantics.
    let version = if use_connect {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    };

    let target = if use_connect {
        format!("{host}:{port}")
    } else if proxy.is_some() && !secure && !websocket {
        uri.to_string()
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned())
    };

    // Caller headers come first so computed values can overwrite them.
    // A CONNECT head never carries them: they belong to the tunneled
    // request, not the tunnel.
    let mut headers = if use_connect {
        HeaderMap::new()
    } else {
        request.headers.clone()
    };

    // The port appears in Host exactly when the caller wrote one.
    let host_value = match &request.virtual_host {
        Some(vhost) => vhost.clone(),
        None => match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        },
    };
    headers.insert(HOST, header_value(&host_value)?);

    if websocket && !use_connect {
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        let origin_scheme = if secure { "https" } else { "http" };
        headers.insert(
            ORIGIN,
            header_value(&format!("{origin_scheme}://{host}:{port}"))?,
        );
        headers.insert(
            SEC_WEBSOCKET_KEY,
            header_value(&STANDARD.encode(rand::random::<[u8; 16]>()))?,
        );
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    }

    if config.compression_enabled && !use_connect {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate"));
    }

    if !use_connect {
        if let Some(realm) = request.realm.as_ref().or(config.realm.as_ref()) {
            if realm.preemptive {
                if let Some(value) = preemptive_authorization(config, realm, request, &target)? {
                    headers.append(AUTHORIZATION, header_value(&value)?);
                }
            }
        }
    }

    if let Some(proxy) = proxy {
        if let Some(value) = proxy_authorization(config, proxy, &headers)? {
            headers.insert(PROXY_AUTHORIZATION, header_value(&value)?);
        }
    }

    // Connection management defaults. WebSocket requests already
    // carry `Connection: Upgrade`.
    let keep_alive_value = if config.keep_alive {
        HeaderValue::from_static("keep-alive")
    } else {
        HeaderValue::from_static("close")
    };
    if !websocket && !headers.contains_key(CONNECTION) {
        headers.insert(CONNECTION, keep_alive_value.clone());
    }
    if proxy.is_some() && !secure && !headers.contains_key(PROXY_CONNECTION) {
        headers.insert(PROXY_CONNECTION, keep_alive_value);
    }
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    }
    if !headers.contains_key(USER_AGENT) {
        if let Some(ua) = &config.user_agent {
            headers.insert(USER_AGENT, header_value(ua)?);
        }
    }

    if let Some(cookie_header) =
        request::encode_client_cookies(&request.cookies, config.rfc6265_cookie_encoding)
    {
        headers.insert(COOKIE, header_value(&cookie_header)?);
    }

    let body = if use_connect {
        WireBody::None
    } else {
        resolve_body(&request.body, &mut headers)?
    };

    Ok(WireRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidRequest(format!("invalid header value: {value:?}")))
}

fn preemptive_authorization(
    config: &ClientConfig,
    realm: &Realm,
    request: &LogicalRequest,
    target: &str,
) -> Result<Option<String>, Error> {
    match realm.scheme {
        AuthScheme::Basic => Ok(Some(auth::compute_basic_authentication(
            &realm.principal,
            &realm.password,
        ))),
        AuthScheme::Digest => {
            // Without a server nonce there is nothing to compute yet;
            // the challenge round will supply one.
            if realm.nonce.as_deref().is_none_or(str::is_empty) {
                return Ok(None);
            }
            let mut effective = realm.clone();
            if effective.uri.is_none() {
                effective.uri = Some(target.to_owned());
            }
            if effective.method.is_none() {
                effective.method = Some(request.method.as_str().to_owned());
            }
            auth::compute_digest_authentication(&effective).map(Some)
        }
        AuthScheme::Ntlm => {
            let engine = config.ntlm_engine.as_deref().ok_or_else(|| {
                Error::Configuration("NTLM realm configured without an NTLM engine".to_owned())
            })?;
            let domain = realm.ntlm_domain.as_deref().unwrap_or_default();
            let ntlm_host = realm.ntlm_host.as_deref().unwrap_or("localhost");
            let msg = engine
                .generate_type1_msg(domain, ntlm_host)
                .map_err(Error::Authentication)?;
            Ok(Some(format!("NTLM {msg}")))
        }
        AuthScheme::Kerberos | AuthScheme::Spnego => {
            let engine = config.spnego_engine.as_deref().ok_or_else(|| {
                Error::Configuration(
                    "Kerberos/SPNEGO realm configured without a SPNEGO engine".to_owned(),
                )
            })?;
            let server = request.uri.host().unwrap_or_default();
            let token = engine.generate_token(server).map_err(Error::Authentication)?;
            Ok(Some(format!("Negotiate {token}")))
        }
        AuthScheme::None => Ok(None),
    }
}

fn proxy_authorization(
    config: &ClientConfig,
    proxy: &ProxyServer,
    headers: &HeaderMap,
) -> Result<Option<String>, Error> {
    let Some(principal) = proxy.principal.as_deref() else {
        return Ok(None);
    };

    // An NTLM proxy handshake in progress carries its own
    // Proxy-Authorization values; do not clobber them.
    let ntlm_in_progress = headers
        .get_all(PROXY_AUTHORIZATION)
        .iter()
        .any(|v| v.to_str().is_ok_and(|v| v.starts_with("NTLM")));
    if ntlm_in_progress {
        return Ok(None);
    }

    if let Some(domain) = proxy.ntlm_domain.as_deref() {
        let engine = config.ntlm_engine.as_deref().ok_or_else(|| {
            Error::Configuration("NTLM proxy configured without an NTLM engine".to_owned())
        })?;
        let msg = engine
            .generate_type1_msg(domain, "localhost")
            .map_err(Error::Authentication)?;
        return Ok(Some(format!("NTLM {msg}")));
    }

    let password = proxy.password.as_deref().unwrap_or_default();
    Ok(Some(auth::compute_basic_authentication(principal, password)))
}

fn resolve_body(body: &BodySource, headers: &mut HeaderMap) -> Result<WireBody, Error> {
    match body {
        BodySource::None => Ok(WireBody::None),
        BodySource::Bytes(data) => {
            set_content_length(headers, data.len() as u64);
            Ok(WireBody::InMemory(data.clone()))
        }
        BodySource::Text(text) => {
            let data = Bytes::copy_from_slice(text.as_bytes());
            set_content_length(headers, data.len() as u64);
            Ok(WireBody::InMemory(data))
        }
        BodySource::Stream(stream) => {
            set_chunked(headers);
            Ok(WireBody::Stream(stream.clone()))
        }
        BodySource::Form(params) => {
            let encoded = encode_form(params);
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
            }
            set_content_length(headers, encoded.len() as u64);
            Ok(WireBody::InMemory(Bytes::from(encoded)))
        }
        BodySource::Multipart(parts) => {
            let boundary = multipart_boundary();
            headers.insert(
                CONTENT_TYPE,
                header_value(&format!("multipart/form-data; boundary={boundary}"))?,
            );
            set_chunked(headers);
            Ok(WireBody::Multipart(encode_multipart(parts, &boundary)))
        }
        BodySource::File(region) => {
            let metadata = std::fs::metadata(&region.path).map_err(|e| {
                Error::InvalidBodySource(format!(
                    "file body {}: {e}",
                    region.path.display()
                ))
            })?;
            if !metadata.is_file() {
                return Err(Error::InvalidBodySource(format!(
                    "file body {} is not a regular file",
                    region.path.display()
                )));
            }
            let file_len = metadata.len();
            if region.offset > file_len {
                return Err(Error::InvalidBodySource(format!(
                    "file body offset {} past end of {} byte file",
                    region.offset, file_len
                )));
            }
            let length = match region.length {
                Some(length) if region.offset + length > file_len => {
                    return Err(Error::InvalidBodySource(format!(
                        "file body region {}+{} past end of {} byte file",
                        region.offset, length, file_len
                    )));
                }
                Some(length) => length,
                None => file_len - region.offset,
            };
            set_content_length(headers, length);
            Ok(WireBody::File(request::FileRegion {
                path: region.path.clone(),
                offset: region.offset,
                length: Some(length),
            }))
        }
        BodySource::Generator(generator) => {
            set_chunked(headers);
            Ok(WireBody::Generator(generator.clone()))
        }
    }
}

fn set_content_length(headers: &mut HeaderMap, length: u64) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&length.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
}

fn set_chunked(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
}

fn encode_form(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(name, FORM_ENCODE),
                utf8_percent_encode(value, FORM_ENCODE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn multipart_boundary() -> String {
    let raw = rand::random::<[u8; 16]>();
    let mut boundary = String::with_capacity(32);
    for byte in raw {
        boundary.push_str(&format!("{byte:02x}"));
    }
    boundary
}

fn encode_multipart(parts: &[Part], boundary: &str) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(parts.len() + 1);
    for part in parts {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        chunk.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"", part.name).as_bytes(),
        );
        if let Some(filename) = &part.filename {
            chunk.extend_from_slice(format!("; filename=\"{filename}\"").as_bytes());
        }
        chunk.extend_from_slice(b"\r\n");
        if let Some(content_type) = &part.content_type {
            chunk.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        chunk.extend_from_slice(b"\r\n");
        chunk.extend_from_slice(&part.data);
        chunk.extend_from_slice(b"\r\n");
        chunks.push(Bytes::from(chunk));
    }
    chunks.push(Bytes::from(format!("--{boundary}--\r\n")));
    chunks
}
