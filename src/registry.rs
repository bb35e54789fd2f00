//! Connection registry: pooled idle channels, open channel tracking,
//! capacity slots and the per-channel attribute side table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use http::Uri;
use parking_lot::Mutex;
use tracing::trace;

use crate::channel::{Channel, ChannelId};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::future::RequestFuture;
use crate::request;

/// Key a channel is pooled under. Channels are only reused for
/// requests that map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Caller hook to derive a custom pool key from the target URI,
/// e.g. to partition by more than the authority.
pub trait PoolKeyStrategy: Send + Sync + 'static {
    fn key(&self, uri: &Uri) -> Result<PoolKey, Error>;
}

/// Default key: scheme + host + effective port of the target.
pub fn default_pool_key(uri: &Uri) -> Result<PoolKey, Error> {
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| Error::InvalidRequest("target uri without scheme".to_owned()))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidRequest("target uri without host".to_owned()))?;
    Ok(PoolKey {
        scheme: scheme.to_owned(),
        host: host.to_owned(),
        port: request::effective_port(uri),
    })
}

/// What should happen to a channel once its current response
/// finishes draining.
#[derive(Debug, Clone)]
pub struct Disposition {
    pub pool_key: PoolKey,
    pub keep_alive: bool,
}

/// Per-channel dispatch state.
pub enum Attribute<C> {
    /// Response events belong to this future.
    InFlight(Arc<RequestFuture<C>>),
    /// Remaining events on this channel are ignored.
    Discard,
    /// Pool-or-close decision deferred until the in-flight
    /// chunked response has fully drained.
    OnDrain(Disposition),
}

impl<C> Clone for Attribute<C> {
    fn clone(&self) -> Self {
        match self {
            Self::InFlight(fut) => Self::InFlight(fut.clone()),
            Self::Discard => Self::Discard,
            Self::OnDrain(disposition) => Self::OnDrain(disposition.clone()),
        }
    }
}

impl<C> std::fmt::Debug for Attribute<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight(_) => f.write_str("InFlight"),
            Self::Discard => f.write_str("Discard"),
            Self::OnDrain(disposition) => write!(f, "OnDrain({disposition:?})"),
        }
    }
}

struct RegistryInner<C> {
    idle: HashMap<PoolKey, VecDeque<Arc<C>>>,
    open: HashMap<ChannelId, Arc<C>>,
    attributes: HashMap<ChannelId, Attribute<C>>,
    per_host: HashMap<String, usize>,
}

/// Tracks every channel the client owns.
///
/// The registry is the only cross-future shared mutable state;
/// all tables sit behind one mutex, counters are atomic.
pub struct ChannelRegistry<C> {
    inner: Mutex<RegistryInner<C>>,
    open_count: AtomicUsize,
    max_connections: Option<usize>,
    max_connections_per_host: Option<usize>,
    max_idle: Option<usize>,
    closed: AtomicBool,
}

impl<C: Channel> ChannelRegistry<C> {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                idle: HashMap::new(),
                open: HashMap::new(),
                attributes: HashMap::new(),
                per_host: HashMap::new(),
            }),
            open_count: AtomicUsize::new(0),
            max_connections: config.max_connections,
            max_connections_per_host: config.max_connections_per_host,
            max_idle: config.max_idle_connections,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Try to reserve a connection slot for `host`.
    ///
    /// Non-blocking; returns `false` when either the global or the
    /// per-host bound is reached. Never an error: the caller decides
    /// how to resolve the backpressure.
    pub fn acquire_slot(&self, host: &str) -> bool {
        if let Some(max) = self.max_connections {
            // Reserve optimistically, roll back on overshoot.
            let prev = self.open_count.fetch_add(1, Ordering::AcqRel);
            if prev >= max {
                self.open_count.fetch_sub(1, Ordering::AcqRel);
                trace!(host, max, "global connection limit reached");
                return false;
            }
        }
        if let Some(max) = self.max_connections_per_host {
            let mut inner = self.inner.lock();
            let count = inner.per_host.entry(host.to_owned()).or_insert(0);
            if *count >= max {
                drop(inner);
                if self.max_connections.is_some() {
                    self.open_count.fetch_sub(1, Ordering::AcqRel);
                }
                trace!(host, max, "per-host connection limit reached");
                return false;
            }
            *count += 1;
        }
        true
    }

    /// Release a slot previously acquired for `host`.
    pub fn release_slot(&self, host: &str) {
        if self.max_connections.is_some() {
            self.open_count.fetch_sub(1, Ordering::AcqRel);
        }
        if self.max_connections_per_host.is_some() {
            let mut inner = self.inner.lock();
            if let Some(count) = inner.per_host.get_mut(host) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Take one pooled channel for `key`, if any.
    ///
    /// The channel is removed from the pool either way; the caller
    /// is responsible for checking liveness before reuse.
    pub fn lookup_pooled(&self, key: &PoolKey) -> Option<Arc<C>> {
        if self.is_closed() {
            return None;
        }
        let mut inner = self.inner.lock();
        let queue = inner.idle.get_mut(key)?;
        let channel = queue.pop_front();
        if queue.is_empty() {
            inner.idle.remove(key);
        }
        if channel.is_some() {
            trace!(pool_key = %key, "reusing pooled channel");
        }
        channel
    }

    /// Offer a channel back to the pool under `key`.
    ///
    /// Returns `false` (and leaves the channel untouched) when the
    /// registry is closed or the idle pool is at capacity; the caller
    /// must then close the channel.
    pub fn offer_to_pool(&self, key: PoolKey, channel: Arc<C>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut inner = self.inner.lock();
        if let Some(max) = self.max_idle {
            let idle: usize = inner.idle.values().map(VecDeque::len).sum();
            if idle >= max {
                trace!(pool_key = %key, max, "idle pool full, dropping channel");
                return false;
            }
        }
        inner.attributes.insert(channel.id(), Attribute::Discard);
        trace!(pool_key = %key, channel = channel.id(), "channel returned to pool");
        inner.idle.entry(key).or_default().push_back(channel);
        true
    }

    /// Track a freshly connected channel.
    pub fn register(&self, channel: Arc<C>) {
        let mut inner = self.inner.lock();
        inner.open.insert(channel.id(), channel);
    }

    /// Drop a channel from every table. Does not close it.
    pub fn remove_all(&self, channel: &C) {
        let id = channel.id();
        let mut inner = self.inner.lock();
        inner.open.remove(&id);
        inner.attributes.remove(&id);
        for queue in inner.idle.values_mut() {
            queue.retain(|c| c.id() != id);
        }
        inner.idle.retain(|_, queue| !queue.is_empty());
    }

    pub fn attribute(&self, id: ChannelId) -> Option<Attribute<C>> {
        self.inner.lock().attributes.get(&id).cloned()
    }

    pub fn set_attribute(&self, id: ChannelId, attribute: Attribute<C>) {
        self.inner.lock().attributes.insert(id, attribute);
    }

    /// Close the registry: no more pooling or lookups, and every
    /// idle channel is closed. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.idle)
        };
        for (key, queue) in idle {
            trace!(pool_key = %key, count = queue.len(), "closing idle channels");
            for channel in queue {
                channel.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BodyPayload, Channel};
    use crate::encode::WireRequest;
    use std::io;
    use std::sync::atomic::AtomicBool;

    struct FakeChannel {
        id: ChannelId,
        open: AtomicBool,
    }

    impl FakeChannel {
        fn new(id: ChannelId) -> Arc<Self> {
            Arc::new(Self {
                id,
                open: AtomicBool::new(true),
            })
        }
    }

    impl Channel for FakeChannel {
        fn id(&self) -> ChannelId {
            self.id
        }
        async fn write_headers(&self, _head: &WireRequest) -> io::Result<()> {
            Ok(())
        }
        async fn write_body(&self, _payload: BodyPayload) -> io::Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }
        fn is_active(&self) -> bool {
            self.is_open()
        }
        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }
        fn is_tls(&self) -> bool {
            false
        }
        fn resume_transfer(&self) {}
        fn drain(&self) {}
        fn upgrade_to_websocket(&self) {}
    }

    fn key() -> PoolKey {
        PoolKey {
            scheme: "http".to_owned(),
            host: "example.com".to_owned(),
            port: 80,
        }
    }

    #[test]
    fn pool_offer_then_lookup_round_trip() {
        let registry = ChannelRegistry::new(&ClientConfig::default());
        let channel = FakeChannel::new(1);

        assert!(registry.offer_to_pool(key(), channel.clone()));
        let found = registry.lookup_pooled(&key()).unwrap();
        assert_eq!(found.id(), 1);
        assert!(registry.lookup_pooled(&key()).is_none());
    }

    #[test]
    fn default_key_uses_scheme_default_port() {
        let uri: Uri = "https://example.com/path".parse().unwrap();
        let key = default_pool_key(&uri).unwrap();
        assert_eq!(key.port, 443);
        assert_eq!(key.scheme, "https");
    }

    #[test]
    fn slot_limits_are_enforced_and_released() {
        let config = ClientConfig::default()
            .with_max_connections(Some(2))
            .with_max_connections_per_host(Some(1));
        let registry = ChannelRegistry::<FakeChannel>::new(&config);

        assert!(registry.acquire_slot("a.example"));
        assert!(!registry.acquire_slot("a.example"), "per-host limit");
        assert!(registry.acquire_slot("b.example"));
        assert!(!registry.acquire_slot("c.example"), "global limit");

        registry.release_slot("a.example");
        assert!(registry.acquire_slot("c.example"));
    }

    #[test]
    fn full_idle_pool_rejects_offers() {
        let config = ClientConfig::default().with_max_idle_connections(Some(1));
        let registry = ChannelRegistry::new(&config);

        assert!(registry.offer_to_pool(key(), FakeChannel::new(1)));
        assert!(!registry.offer_to_pool(key(), FakeChannel::new(2)));

        registry.lookup_pooled(&key()).unwrap();
        assert!(registry.offer_to_pool(key(), FakeChannel::new(3)));
    }

    #[test]
    fn close_drains_idle_channels_and_rejects_offers() {
        let registry = ChannelRegistry::new(&ClientConfig::default());
        let pooled = FakeChannel::new(7);
        assert!(registry.offer_to_pool(key(), pooled.clone()));

        registry.close();
        assert!(!pooled.is_open(), "idle channel closed on shutdown");
        assert!(!registry.offer_to_pool(key(), FakeChannel::new(8)));
        assert!(registry.lookup_pooled(&key()).is_none());
        // idempotent
        registry.close();
    }
}
