use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::{FetchOptions, FetchResponse};

pub type MiddlewareRequestFuture =
    Pin<Box<dyn Future<Output = Result<(String, FetchOptions), TransportError>> + Send>>;
pub type MiddlewareResponseFuture =
    Pin<Box<dyn Future<Output = Result<FetchResponse, TransportError>> + Send>>;

/// One rewrite stage. Stages run strictly in registration order on both
/// sides, globally configured entries before instance entries, each stage
/// threading the rewritten value to the next.
pub trait Middleware: Send + Sync {
    fn on_request(&self, url: String, options: FetchOptions) -> MiddlewareRequestFuture {
        Box::pin(async move { Ok((url, options)) })
    }

    fn on_response(&self, response: FetchResponse) -> MiddlewareResponseFuture {
        Box::pin(async move { Ok(response) })
    }
}

pub type MiddlewareRef = Arc<dyn Middleware>;

pub type RequestMiddlewareFn =
    Arc<dyn Fn(String, FetchOptions) -> MiddlewareRequestFuture + Send + Sync>;
pub type ResponseMiddlewareFn = Arc<dyn Fn(FetchResponse) -> MiddlewareResponseFuture + Send + Sync>;

/// Closure-backed [`Middleware`] for callers that only need one side.
#[derive(Clone, Default)]
pub struct ClosureMiddleware {
    pub on_request: Option<RequestMiddlewareFn>,
    pub on_response: Option<ResponseMiddlewareFn>,
}

impl Middleware for ClosureMiddleware {
    fn on_request(&self, url: String, options: FetchOptions) -> MiddlewareRequestFuture {
        match &self.on_request {
            Some(stage) => stage(url, options),
            None => Box::pin(async move { Ok((url, options)) }),
        }
    }

    fn on_response(&self, response: FetchResponse) -> MiddlewareResponseFuture {
        match &self.on_response {
            Some(stage) => stage(response),
            None => Box::pin(async move { Ok(response) }),
        }
    }
}

pub(crate) async fn run_request_chain(
    chain: &[MiddlewareRef],
    mut url: String,
    mut options: FetchOptions,
) -> Result<(String, FetchOptions), TransportError> {
    for stage in chain {
        let (next_url, next_options) = stage.on_request(url, options).await?;
        url = next_url;
        options = next_options;
    }
    Ok((url, options))
}

pub(crate) async fn run_response_chain(
    chain: &[MiddlewareRef],
    mut response: FetchResponse,
) -> Result<FetchResponse, TransportError> {
    for stage in chain {
        response = stage.on_response(response).await?;
    }
    Ok(response)
}
