//! HTTP client utilities for making requests to chat-completion endpoints.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::ClientError;
use crate::options::TransportOptions;

/// Build a configured HTTP client from transport options.
pub fn build_http_client(transport_options: &TransportOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();

    if let Some(t) = transport_options.timeout {
        builder = builder.timeout(t);
    }
    if let Some(proxy_url) = &transport_options.proxy {
        match reqwest::Proxy::all(proxy_url) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => warn!("Ignoring invalid proxy URL {}: {}", proxy_url, e),
        }
    }

    builder.build()
}

/// Add extra headers to a request if specified in transport options.
pub fn add_extra_headers(
    mut request: RequestBuilder,
    transport_options: &TransportOptions,
) -> RequestBuilder {
    if let Some(headers) = &transport_options.headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// Extension trait for RequestBuilder that logs request body.
pub trait RequestBuilderExt {
    /// Set JSON request body and log it. Returns the RequestBuilder for chaining.
    fn json_logged<T: serde::Serialize + ?Sized>(self, json: &T) -> Self;
}

impl RequestBuilderExt for RequestBuilder {
    fn json_logged<T: serde::Serialize + ?Sized>(self, json: &T) -> Self {
        if let Ok(req_body) = serde_json::to_string_pretty(json) {
            debug!("API request body ({} bytes):\n{}", req_body.len(), req_body);
        }

        self.json(json)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<Value>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}

/// Human-readable message from an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => {
            let code = error
                .code
                .map(|c| match c {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .or(error.error_type);
            match code {
                Some(code) => format!("{} ({})", error.message, code),
                None => error.message,
            }
        }
        Err(_) => body.to_string(),
    }
}

/// Extension trait for Response that logs and decodes the body.
#[async_trait::async_trait]
pub trait ResponseExt {
    /// Read the body, log it, and decode it as JSON on success. Non-success
    /// statuses become [`ClientError::Unauthorized`] (401) or
    /// [`ClientError::Status`] carrying the service's error message.
    async fn json_checked<T: DeserializeOwned>(self) -> Result<T, ClientError>;
}

#[async_trait::async_trait]
impl ResponseExt for reqwest::Response {
    async fn json_checked<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let status = self.status();
        let bytes = self.bytes().await?;
        let text = String::from_utf8_lossy(&bytes);
        debug!("API response {} ({} bytes):\n{}", status, bytes.len(), text);

        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized(error_message(&text)));
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        serde_json::from_slice(&bytes).map_err(ClientError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_with_code() {
        let body = r#"{"error": {"code": "DeploymentNotFound", "message": "The API deployment does not exist."}}"#;
        assert_eq!(
            error_message(body),
            "The API deployment does not exist. (DeploymentNotFound)"
        );
    }

    #[test]
    fn test_error_message_with_type() {
        let body = r#"{"error": {"type": "invalid_request_error", "message": "bad"}}"#;
        assert_eq!(error_message(body), "bad (invalid_request_error)");
    }

    #[test]
    fn test_error_message_falls_back_to_body() {
        assert_eq!(error_message("upstream timeout"), "upstream timeout");
    }

    #[test]
    fn test_extra_headers_are_applied() {
        let options = TransportOptions::new().with_header("x-ms-client-request-id", "abc");
        let request = add_extra_headers(Client::new().post("http://localhost/"), &options)
            .build()
            .unwrap();
        assert_eq!(request.headers()["x-ms-client-request-id"], "abc");
    }
}
