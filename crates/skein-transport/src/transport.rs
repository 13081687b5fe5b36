use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::TransportError;

pub type BodySender = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;
pub type BodyReceiver = mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>;
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchResponse, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Raw(String),
}

/// Everything the underlying fetch call needs besides the URL. Middleware
/// may rewrite any of it before the call goes out.
#[derive(Clone)]
pub struct FetchOptions {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<RequestBody>,
    pub cancel: CancelToken,
}

impl FetchOptions {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: HashMap::new(),
            body: None,
            cancel: CancelToken::new(),
        }
    }
}

/// The response surface the client consumes: status, headers, and a body
/// delivered incrementally over a channel. The producing task honors the
/// request's cancel token and stops sending once it fires.
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<BodyReceiver>,
}

impl FetchResponse {
    /// Declared content type, lowercased and stripped of parameters.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| {
                value
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase()
            })
    }
}

/// Pluggable fetch seam: `(url, options) → response`. The crate never
/// implements HTTP itself; [`ReqwestFetcher`] is the stock implementation
/// and tests substitute scripted ones.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: String, options: FetchOptions) -> FetchFuture;
}

pub type FetcherRef = Arc<dyn Fetcher>;

/// Default [`Fetcher`] backed by a shared `reqwest` client. The response
/// body is pumped into the channel by a spawned task so the caller can
/// interleave timers and cancellation with chunk delivery.
pub struct ReqwestFetcher;

impl Fetcher for ReqwestFetcher {
    fn fetch(&self, url: String, options: FetchOptions) -> FetchFuture {
        Box::pin(async move {
            let client = shared_http_client(&url);
            let method =
                reqwest::Method::from_bytes(options.method.as_bytes()).map_err(|error| {
                    TransportError::network(format!(
                        "invalid method '{}': {error}",
                        options.method
                    ))
                })?;

            let mut request = client.request(method, &url);
            for (name, value) in &options.headers {
                request = request.header(name, value);
            }
            request = match options.body {
                Some(RequestBody::Json(payload)) => request.json(&payload),
                Some(RequestBody::Raw(raw)) => request.body(raw),
                None => request,
            };

            let response = request
                .send()
                .await
                .map_err(|error| TransportError::network(format!("request failed: {error}")))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();

            let (sender, receiver) = mpsc::unbounded_channel();
            spawn_body_task(pump_body(response, sender, options.cancel));

            Ok(FetchResponse {
                status,
                headers,
                body: Some(receiver),
            })
        })
    }
}

async fn pump_body(mut response: reqwest::Response, sender: BodySender, cancel: CancelToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("body reader stopping on cancellation");
                break;
            }
            chunk = response.chunk() => match chunk {
                Ok(Some(bytes)) => {
                    if sender.send(Ok(bytes.to_vec())).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = sender.send(Err(TransportError::network(format!(
                        "body read failed: {error}"
                    ))));
                    break;
                }
            },
        }
    }
}

fn spawn_body_task<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(task);
        return;
    }

    std::thread::spawn(move || {
        if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            runtime.block_on(task);
        }
    });
}

fn shared_http_client(url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_url(url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}
