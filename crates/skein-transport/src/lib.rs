//! Resilient streaming-transport core for the Skein chat SDK.

mod broadcast;
mod cancel;
mod client;
mod config;
mod error;
mod middleware;
mod reconnect;
mod retry;
mod sse;
mod transport;

pub use broadcast::Broadcaster;
pub use cancel::CancelToken;
pub use client::{
    ClosureObserver, CompleteFn, FailureFn, Headers, RecordFn, RequestLifecycleState,
    RequestOptions, StreamClient, StreamObserver, TransformContext, TransformFactory,
};
pub use config::{
    configure_defaults, default_json_failure_classifier, defaults_snapshot, reset_defaults,
    ClientConfig, GlobalDefaults, JsonFailureClassifier,
};
pub use error::{TransportError, TransportErrorCode};
pub use middleware::{
    ClosureMiddleware, Middleware, MiddlewareRef, MiddlewareRequestFuture,
    MiddlewareResponseFuture, RequestMiddlewareFn, ResponseMiddlewareFn,
};
pub use reconnect::{
    ReconnectConfig, ReconnectController, ReconnectEvents, ReconnectOutcome, ReconnectState,
};
pub use retry::{
    default_retry_predicate, RetryCallback, RetryEngine, RetryPolicy, RetryPredicate, RetryState,
    MAX_RETRY_CEILING,
};
pub use sse::{
    is_done_signal, FrameSplitter, SseTransform, StreamRecord, StreamSeparators, StreamTransform,
    Utf8Decoder, DEFAULT_FRAME_SEPARATOR, DEFAULT_KV_SEPARATOR, DEFAULT_LINE_SEPARATOR,
};
pub use transport::{
    BodyReceiver, BodySender, FetchFuture, FetchOptions, FetchResponse, Fetcher, FetcherRef,
    ReqwestFetcher, RequestBody,
};
