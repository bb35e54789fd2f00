//! Request lifecycle engine for an asynchronous HTTP / WebSocket client.
//!
//! `tether` owns a logical request from dispatch through connection
//! acquisition, wire encoding, response handling, redirect following,
//! authentication and failure recovery. It does not own sockets:
//! transports plug in through the [`Channel`] and [`Connector`] traits
//! and feed response events into the [`Dispatcher`].
//!
//! The building blocks:
//!
//! - [`Client`]: assembles registry, sender and dispatcher.
//! - [`LogicalRequest`] + [`ResponseHandler`]: what to send, and who
//!   receives the lifecycle events (exactly one terminal callback per
//!   request).
//! - [`ChannelRegistry`]: connection pooling and capacity accounting.
//! - [`RequestSender`]: channel acquisition, request writing, retry
//!   and filter-driven replay.
//! - [`Dispatcher`]: routes channel events, follows redirects, and
//!   validates HTTP to WebSocket upgrades.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod encode;
pub mod error;
pub mod filter;
pub mod future;
pub mod handler;
pub mod proto;
pub mod registry;
pub mod request;
pub mod send;

pub use auth::{AuthScheme, Realm};
pub use channel::{BodyPayload, Channel, ChannelId, ChunkedInput, InputChunk};
pub use client::Client;
pub use config::{ClientConfig, ProxyServer};
pub use encode::{WireBody, WireRequest, encode};
pub use error::{BoxError, Error, HandshakeError};
pub use filter::{FilterContext, IoExceptionFilter, IoFilterContext, ResponseFilter};
pub use future::{FutureState, ProtocolKind, RequestFuture};
pub use handler::{HandlerState, ResponseHandler, WebSocketHandler};
pub use proto::{Dispatcher, ResponseEvent, ResponseHead, WsFrame, derive_accept_key};
pub use registry::{Attribute, ChannelRegistry, Disposition, PoolKey, PoolKeyStrategy};
pub use request::{BodySource, BodyStream, Cookie, FileRegion, LogicalRequest, Part};
pub use send::{Connector, RemoteAddr, RequestSender};
