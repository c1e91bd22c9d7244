//! Transport boundary: the trait every chat-completion backend implements.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::credential::CredentialError;
use crate::model::{Message, Response};
use crate::tools::ToolDefinition;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The service rejected the bearer token. The cached credential has
    /// already been dropped, so a retry reacquires.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Status { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            ClientError::Unauthorized(_) | ClientError::Timeout(_) => true,
            ClientError::Parse(_)
            | ClientError::Provider(_)
            | ClientError::Credential(_)
            | ClientError::Config(_) => false,
        }
    }
}

/// Sends one chat-completion request: the conversation so far plus the
/// advertised tools.
#[async_trait]
pub trait Client: Send + Sync {
    async fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Response, ClientError>;
}

#[async_trait]
impl<C: Client + ?Sized> Client for std::sync::Arc<C> {
    async fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Response, ClientError> {
        (**self).request(messages, tools).await
    }
}
