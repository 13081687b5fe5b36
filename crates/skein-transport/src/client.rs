use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::cancel::CancelToken;
use crate::config::{default_json_failure_classifier, ClientConfig};
use crate::error::{TransportError, TransportErrorCode};
use crate::middleware::{run_request_chain, run_response_chain};
use crate::retry::RetryEngine;
use crate::sse::{SseTransform, StreamRecord, StreamSeparators, StreamTransform, Utf8Decoder};
use crate::transport::{BodyReceiver, FetchOptions, FetchResponse, RequestBody};

pub type Headers = HashMap<String, String>;

/// Response facts handed to a transform factory so it can pick an output
/// transform per response.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Headers,
}

pub type TransformFactory =
    Arc<dyn Fn(&TransformContext) -> Option<Box<dyn StreamTransform + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    pub stream_timeout: Option<Duration>,
    pub separators: StreamSeparators,
    /// Returning `None` falls back to the default event parser pipeline.
    pub transform: Option<TransformFactory>,
}

impl RequestOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: Headers::new(),
            body: None,
            timeout: None,
            stream_timeout: None,
            separators: StreamSeparators::default(),
            transform: None,
        }
    }
}

/// Callbacks for one request's lifecycle. Cancellation is not a failure:
/// `on_failure` never fires for a user-initiated abort.
pub trait StreamObserver: Send + Sync {
    fn on_record(&self, _record: &StreamRecord, _headers: &Headers) {}
    fn on_complete(&self, _records: &[StreamRecord], _headers: &Headers) {}
    fn on_failure(&self, _error: &TransportError, _raw: Option<&str>) {}
}

pub type RecordFn = Arc<dyn Fn(&StreamRecord, &Headers) + Send + Sync>;
pub type CompleteFn = Arc<dyn Fn(&[StreamRecord], &Headers) + Send + Sync>;
pub type FailureFn = Arc<dyn Fn(&TransportError, Option<&str>) + Send + Sync>;

/// Closure-backed [`StreamObserver`].
#[derive(Clone, Default)]
pub struct ClosureObserver {
    pub on_record: Option<RecordFn>,
    pub on_complete: Option<CompleteFn>,
    pub on_failure: Option<FailureFn>,
}

impl StreamObserver for ClosureObserver {
    fn on_record(&self, record: &StreamRecord, headers: &Headers) {
        if let Some(callback) = &self.on_record {
            callback(record, headers);
        }
    }

    fn on_complete(&self, records: &[StreamRecord], headers: &Headers) {
        if let Some(callback) = &self.on_complete {
            callback(records, headers);
        }
    }

    fn on_failure(&self, error: &TransportError, raw: Option<&str>) {
        if let Some(callback) = &self.on_failure {
            callback(error, raw);
        }
    }
}

/// Why and how the current (or last) request stopped. Flags persist until
/// the next `request()` call resets them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestLifecycleState {
    pub is_requesting: bool,
    pub aborted: bool,
    pub is_timeout: bool,
    pub is_stream_timeout: bool,
}

struct Failure {
    error: TransportError,
    raw: Option<String>,
}

impl Failure {
    fn new(error: TransportError) -> Self {
        Self { error, raw: None }
    }
}

/// Drives one HTTP request/response cycle with resilience layered on top of
/// a pluggable fetch: middleware, content-type dispatch, two independent
/// timeout classes, and cooperative cancellation.
///
/// One instance serves one request at a time; issue a second `request()`
/// only after the first settles, or use a fresh instance.
pub struct StreamClient {
    config: ClientConfig,
    retry: Option<Arc<RetryEngine>>,
    state: Broadcaster<RequestLifecycleState>,
    cancel: Mutex<Option<CancelToken>>,
}

impl StreamClient {
    /// Global defaults are merged here, once; never re-read mid-request.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: config.resolve(),
            retry: None,
            state: Broadcaster::new(RequestLifecycleState::default()),
            cancel: Mutex::new(None),
        }
    }

    /// Composes a retry engine: `request()` replays failed attempts the
    /// engine classifies as retryable. Lifecycle callbacks fire per attempt.
    pub fn with_retry(mut self, engine: RetryEngine) -> Self {
        self.retry = Some(Arc::new(engine));
        self
    }

    pub fn retry_state(&self) -> Option<crate::retry::RetryState> {
        self.retry.as_ref().map(|engine| engine.state())
    }

    pub fn state(&self) -> RequestLifecycleState {
        self.state.get_state()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&RequestLifecycleState) + Send + Sync + 'static,
    ) -> u64 {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.unsubscribe(id);
    }

    /// Idempotent: aborting twice, or with no request in flight, is a no-op.
    pub fn abort(&self) {
        let token = self
            .cancel
            .lock()
            .expect("cancel slot mutex poisoned")
            .clone();
        if let Some(token) = token {
            if !token.is_cancelled() {
                token.cancel();
                self.state.update_state(|state| state.aborted = true);
            }
        }
    }

    /// A cancelled request resolves with the records accumulated so far and
    /// never calls `on_failure`. Every other failure calls `on_failure`
    /// exactly once per attempt and returns the same error.
    pub async fn request(
        &self,
        options: RequestOptions,
        observer: &dyn StreamObserver,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        match self.retry.clone() {
            Some(engine) => {
                engine
                    .execute(|| self.attempt(options.clone(), observer))
                    .await
            }
            None => self.attempt(options, observer).await,
        }
    }

    async fn attempt(
        &self,
        options: RequestOptions,
        observer: &dyn StreamObserver,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        self.state.set_state(RequestLifecycleState {
            is_requesting: true,
            ..Default::default()
        });
        let token = CancelToken::new();
        *self.cancel.lock().expect("cancel slot mutex poisoned") = Some(token.clone());

        let outcome = self.drive(options, observer, &token).await;

        // Release the transport: a body pump must not outlive its request.
        token.cancel();
        *self.cancel.lock().expect("cancel slot mutex poisoned") = None;
        self.state.update_state(|state| state.is_requesting = false);

        match outcome {
            Ok(records) => Ok(records),
            Err(failure) => {
                observer.on_failure(&failure.error, failure.raw.as_deref());
                Err(failure.error)
            }
        }
    }

    async fn drive(
        &self,
        options: RequestOptions,
        observer: &dyn StreamObserver,
        token: &CancelToken,
    ) -> Result<Vec<StreamRecord>, Failure> {
        let mut headers = self.config.headers.clone();
        headers.extend(options.headers.clone());
        let mut fetch_options = FetchOptions::new(options.method.clone());
        fetch_options.headers = headers;
        fetch_options.body = options.body.clone();
        fetch_options.cancel = token.clone();

        let overall_window = options.timeout.or(self.config.timeout);
        let stream_window = options.stream_timeout.or(self.config.stream_timeout);

        let chain = self.config.middleware.as_slice();
        let fetcher = Arc::clone(&self.config.fetcher);
        let url = options.url.clone();
        let exchange = async {
            let (url, fetch_options) = run_request_chain(chain, url, fetch_options).await?;
            debug!(%url, method = %fetch_options.method, "dispatching request");
            let response = fetcher.fetch(url.clone(), fetch_options).await?;
            let response = run_response_chain(chain, response).await?;
            Ok::<(String, FetchResponse), TransportError>((url, response))
        };

        let (url, mut response) = match overall_window {
            Some(window) => match timeout(window, exchange).await {
                Ok(result) => result.map_err(Failure::new)?,
                Err(_) => {
                    self.state.update_state(|state| state.is_timeout = true);
                    token.cancel();
                    return Err(Failure::new(TransportError::timeout(window)));
                }
            },
            None => exchange.await.map_err(Failure::new)?,
        };
        // Headers arrived: the overall timer is out of the picture from here.

        if !(200..300).contains(&response.status) {
            let raw = match response.body.take() {
                Some(body) => collect_body_text(body, token).await.ok(),
                None => None,
            };
            let snippet = raw.as_deref().map(truncate_snippet).unwrap_or_default();
            return Err(Failure {
                error: TransportError::http(response.status, &snippet),
                raw,
            });
        }

        let Some(mut body) = response.body.take() else {
            return Err(Failure::new(TransportError::body_empty()));
        };

        let content_type = response.content_type();
        let response_headers = response.headers.clone();

        let custom = options.transform.as_ref().map(|factory| {
            factory(&TransformContext {
                url,
                status: response.status,
                content_type: content_type.clone(),
                headers: response_headers.clone(),
            })
        });

        let mut transform: Box<dyn StreamTransform + Send> = match custom {
            Some(Some(custom)) => custom,
            Some(None) => Box::new(SseTransform::with_separators(options.separators.clone())),
            None => match content_type.as_deref() {
                Some("application/json") => {
                    return self
                        .finish_json(body, &response_headers, observer, token)
                        .await;
                }
                Some("text/event-stream") | Some("text/plain")
                | Some("application/octet-stream") => {
                    Box::new(SseTransform::with_separators(options.separators.clone()))
                }
                other => {
                    return Err(Failure::new(TransportError::unsupported_content_type(
                        other.unwrap_or(""),
                    )));
                }
            },
        };

        self.stream_records(
            &mut body,
            transform.as_mut(),
            &response_headers,
            observer,
            token,
            stream_window,
        )
        .await
    }

    async fn stream_records(
        &self,
        body: &mut BodyReceiver,
        transform: &mut (dyn StreamTransform + Send),
        headers: &Headers,
        observer: &dyn StreamObserver,
        token: &CancelToken,
        stream_window: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, Failure> {
        let mut decoder = Utf8Decoder::new();
        let mut records: Vec<StreamRecord> = Vec::new();

        loop {
            if token.is_cancelled() {
                return Ok(records);
            }
            // The inactivity watchdog re-arms on every chunk, covering the
            // gap before the first one as well.
            let chunk = match stream_window {
                Some(window) => match timeout(window, body.recv()).await {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        self.state
                            .update_state(|state| state.is_stream_timeout = true);
                        token.cancel();
                        return Err(Failure::new(TransportError::stream_timeout(window)));
                    }
                },
                None => body.recv().await,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    for record in transform.push(&text) {
                        if token.is_cancelled() {
                            return Ok(records);
                        }
                        observer.on_record(&record, headers);
                        records.push(record);
                    }
                }
                Some(Err(error)) => {
                    if token.is_cancelled() {
                        return Ok(records);
                    }
                    return Err(Failure::new(error));
                }
                None => break,
            }
        }

        if token.is_cancelled() {
            return Ok(records);
        }
        let tail = decoder.finish();
        let mut flushed = if tail.is_empty() {
            Vec::new()
        } else {
            transform.push(&tail)
        };
        flushed.extend(transform.finish());
        for record in flushed {
            observer.on_record(&record, headers);
            records.push(record);
        }
        observer.on_complete(&records, headers);
        Ok(records)
    }

    async fn finish_json(
        &self,
        body: BodyReceiver,
        headers: &Headers,
        observer: &dyn StreamObserver,
        token: &CancelToken,
    ) -> Result<Vec<StreamRecord>, Failure> {
        let text = collect_body_text(body, token).await.map_err(Failure::new)?;
        if token.is_cancelled() {
            return Ok(Vec::new());
        }
        if text.trim().is_empty() {
            return Err(Failure::new(TransportError::body_empty()));
        }
        let payload: Value = serde_json::from_str(&text).map_err(|error| Failure {
            error: TransportError::new(
                TransportErrorCode::Unknown,
                format!("invalid JSON body: {error}"),
            ),
            raw: Some(text.clone()),
        })?;

        let declared_failure = match &self.config.json_failure_classifier {
            Some(classifier) => classifier(&payload),
            None => default_json_failure_classifier(&payload),
        };
        if let Some(error) = declared_failure {
            return Err(Failure {
                error,
                raw: Some(text),
            });
        }

        let mut record = StreamRecord::default();
        record.insert("data", text.trim());
        observer.on_record(&record, headers);
        let records = vec![record];
        observer.on_complete(&records, headers);
        Ok(records)
    }
}

async fn collect_body_text(
    mut body: BodyReceiver,
    cancel: &CancelToken,
) -> Result<String, TransportError> {
    let mut decoder = Utf8Decoder::new();
    let mut text = String::new();
    while let Some(chunk) = body.recv().await {
        match chunk {
            Ok(bytes) => text.push_str(&decoder.decode(&bytes)),
            Err(error) => return Err(error),
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    text.push_str(&decoder.finish());
    Ok(text)
}

fn truncate_snippet(raw: &str) -> String {
    const MAX: usize = 200;
    if raw.len() <= MAX {
        return raw.trim().to_string();
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].trim().to_string()
}
