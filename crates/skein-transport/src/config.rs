use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::error::TransportError;
use crate::middleware::MiddlewareRef;
use crate::transport::{Fetcher, FetcherRef, ReqwestFetcher};

pub type JsonFailureClassifier = Arc<dyn Fn(&Value) -> Option<TransportError> + Send + Sync>;

/// Process-wide defaults merged into every client at construction time.
/// Narrow on purpose: headers, timeouts, and globally-registered
/// middleware. Request logic never reads this lazily.
#[derive(Clone, Default)]
pub struct GlobalDefaults {
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub stream_timeout: Option<Duration>,
    pub middleware: Vec<MiddlewareRef>,
}

fn global_defaults() -> &'static RwLock<GlobalDefaults> {
    static DEFAULTS: OnceLock<RwLock<GlobalDefaults>> = OnceLock::new();
    DEFAULTS.get_or_init(|| RwLock::new(GlobalDefaults::default()))
}

pub fn configure_defaults(apply: impl FnOnce(&mut GlobalDefaults)) {
    let mut defaults = global_defaults()
        .write()
        .expect("global defaults lock poisoned");
    apply(&mut defaults);
}

pub fn defaults_snapshot() -> GlobalDefaults {
    global_defaults()
        .read()
        .expect("global defaults lock poisoned")
        .clone()
}

/// Restores the pristine global configuration. Test runs call this between
/// cases.
pub fn reset_defaults() {
    *global_defaults()
        .write()
        .expect("global defaults lock poisoned") = GlobalDefaults::default();
}

/// Per-client configuration. Constructed explicitly and handed to
/// [`crate::StreamClient::new`], which merges the global defaults exactly
/// once.
#[derive(Clone)]
pub struct ClientConfig {
    pub fetcher: FetcherRef,
    pub middleware: Vec<MiddlewareRef>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub stream_timeout: Option<Duration>,
    pub json_failure_classifier: Option<JsonFailureClassifier>,
}

impl ClientConfig {
    pub fn with_fetcher(fetcher: impl Fetcher + 'static) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            middleware: Vec::new(),
            headers: HashMap::new(),
            timeout: None,
            stream_timeout: None,
            json_failure_classifier: None,
        }
    }

    /// Folds the global defaults in: global headers under instance headers,
    /// global middleware strictly before instance middleware, global
    /// timeouts as fallbacks.
    pub(crate) fn resolve(mut self) -> Self {
        let defaults = defaults_snapshot();
        for (name, value) in defaults.headers {
            self.headers.entry(name).or_insert(value);
        }
        let mut middleware = defaults.middleware;
        middleware.extend(self.middleware);
        self.middleware = middleware;
        self.timeout = self.timeout.or(defaults.timeout);
        self.stream_timeout = self.stream_timeout.or(defaults.stream_timeout);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::with_fetcher(ReqwestFetcher)
    }
}

/// Default JSON-mode failure detection: the `success: false` envelope
/// convention, carrying the payload's own name and message through
/// unmodified. Servers with a different envelope shape supply their own
/// classifier via [`ClientConfig::json_failure_classifier`].
pub fn default_json_failure_classifier(payload: &Value) -> Option<TransportError> {
    if payload.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    let name = payload
        .get("errorName")
        .or_else(|| payload.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = payload
        .get("message")
        .or_else(|| payload.get("errorMessage"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "request declared failure".to_string());
    Some(TransportError::api(name, message))
}
