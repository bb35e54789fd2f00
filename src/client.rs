//! Client assembly: wires the registry, sender and dispatcher together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::future::RequestFuture;
use crate::handler::ResponseHandler;
use crate::proto::Dispatcher;
use crate::registry::ChannelRegistry;
use crate::request::LogicalRequest;
use crate::send::{Connector, RequestSender};

/// The request lifecycle engine, generic over the channel type `C`
/// and the connector that establishes channels.
pub struct Client<C, CN> {
    registry: Arc<ChannelRegistry<C>>,
    sender: Arc<RequestSender<C, CN>>,
    dispatcher: Arc<Dispatcher<C, CN>>,
    closed: Arc<AtomicBool>,
}

impl<C: Channel, CN: Connector<C>> Client<C, CN> {
    pub fn new(config: ClientConfig, connector: CN) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ChannelRegistry::new(&config));
        let closed = Arc::new(AtomicBool::new(false));
        let sender = Arc::new(RequestSender::new(
            config.clone(),
            registry.clone(),
            connector,
            closed.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(config, registry.clone(), sender.clone()));
        Self {
            registry,
            sender,
            dispatcher,
            closed,
        }
    }

    /// Dispatch one logical request.
    ///
    /// The returned future can be awaited via
    /// [`RequestFuture::wait`]; the handler receives every
    /// lifecycle event either way.
    pub async fn execute(
        &self,
        request: LogicalRequest,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<RequestFuture<C>>, Error> {
        self.sender.send_request(request, handler, None, false).await
    }

    /// Event entry point for channel implementations.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<C, CN>> {
        &self.dispatcher
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the client down: reject new requests and close every
    /// idle channel. Idempotent; in-flight requests abort with
    /// [`Error::ClientClosed`] on their next dispatch step.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.registry.close();
    }
}
