use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorCode {
    HttpStatus,
    BodyEmpty,
    UnsupportedContentType,
    Timeout,
    StreamTimeout,
    Network,
    Api,
    Cancelled,
    Unknown,
}

/// Classified failure produced anywhere in the transport stack. The code
/// drives retry decisions; the message is shown to callers unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn http(status: u16, body_snippet: &str) -> Self {
        let message = if body_snippet.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body_snippet}")
        };
        Self::new(TransportErrorCode::HttpStatus, message).with_details(json!({ "status": status }))
    }

    pub fn body_empty() -> Self {
        Self::new(TransportErrorCode::BodyEmpty, "response has no body")
    }

    pub fn unsupported_content_type(content_type: &str) -> Self {
        let message = if content_type.is_empty() {
            "response declared no content type".to_string()
        } else {
            format!("unsupported content type: {content_type}")
        };
        Self::new(TransportErrorCode::UnsupportedContentType, message)
    }

    pub fn timeout(window: Duration) -> Self {
        Self::new(
            TransportErrorCode::Timeout,
            format!("no response within {}ms", window.as_millis()),
        )
    }

    pub fn stream_timeout(window: Duration) -> Self {
        Self::new(
            TransportErrorCode::StreamTimeout,
            format!("stream stalled for {}ms", window.as_millis()),
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::Network, message)
    }

    pub fn api(name: Option<String>, message: impl Into<String>) -> Self {
        let error = Self::new(TransportErrorCode::Api, message);
        match name {
            Some(name) => error.with_details(json!({ "name": name })),
            None => error,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorCode::Cancelled, "request cancelled")
    }

    /// Numeric status for `HttpStatus` errors, if recorded.
    pub fn http_status(&self) -> Option<u16> {
        self.details
            .as_ref()
            .and_then(|details| details.get("status"))
            .and_then(Value::as_u64)
            .map(|status| status as u16)
    }

    /// Server-supplied error name for `Api` errors, if recorded.
    pub fn api_name(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|details| details.get("name"))
            .and_then(Value::as_str)
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"unknown\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_encodes_status_in_message_and_details() {
        let error = TransportError::http(404, "not found");
        assert!(error.message.contains("404"));
        assert_eq!(error.http_status(), Some(404));
    }

    #[test]
    fn api_error_keeps_server_name() {
        let error = TransportError::api(Some("AuthError".to_string()), "token expired");
        assert_eq!(error.api_name(), Some("AuthError"));
        assert_eq!(error.message, "token expired");
    }

    #[test]
    fn compact_json_round_trips_code() {
        let error = TransportError::stream_timeout(Duration::from_millis(250));
        let parsed: TransportError =
            serde_json::from_str(&error.as_compact_json()).expect("compact json parses");
        assert_eq!(parsed.code, TransportErrorCode::StreamTimeout);
    }
}
