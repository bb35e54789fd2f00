//! Response and IO-exception filter seams.
//!
//! Filters run in registration order. Each may swap out the handler
//! or the request and request a replay of the whole request; a filter
//! error aborts the future.

use std::io;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};

use crate::error::BoxError;
use crate::handler::ResponseHandler;
use crate::request::LogicalRequest;

/// State threaded through a [`ResponseFilter`] chain.
pub struct FilterContext {
    pub handler: Arc<dyn ResponseHandler>,
    pub request: LogicalRequest,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Set to `true` to replay [`request`](Self::request)
    /// instead of continuing with this response.
    pub replay: bool,
}

impl FilterContext {
    pub fn new(
        handler: Arc<dyn ResponseHandler>,
        request: LogicalRequest,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Self {
        Self {
            handler,
            request,
            status,
            headers,
            replay: false,
        }
    }
}

/// Inspects a response head before it is delivered to the handler.
pub trait ResponseFilter: Send + Sync + 'static {
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, BoxError>;
}

/// State threaded through an [`IoExceptionFilter`] chain.
pub struct IoFilterContext<'a> {
    pub handler: Arc<dyn ResponseHandler>,
    pub request: LogicalRequest,
    pub error: &'a io::Error,
    /// Set to `true` to replay the request despite the failure.
    pub replay: bool,
}

/// Inspects a transport failure and may recover it by replay.
pub trait IoExceptionFilter: Send + Sync + 'static {
    fn filter<'a>(&self, ctx: IoFilterContext<'a>) -> Result<IoFilterContext<'a>, BoxError>;
}
