//! # toolchat - tool-calling orchestration for chat-completion APIs
//!
//! Advertises locally implemented tools to a remote chat-completion service,
//! dispatches the calls the model asks for, folds the results back into the
//! conversation, and keeps the bearer credential used for every request fresh.
//!
//! ## Architecture
//!
//! 1. **Tools** ([`ToolDefinition`] + [`ToolHandler`]) live in a [`ToolRegistry`].
//! 2. **Clients** ([`Client`]) send one chat request; [`ChatCompletionsClient`]
//!    speaks the HTTP wire format and authenticates through a shared
//!    [`CredentialCache`].
//! 3. **Agents** ([`Agent`]) drive the turn loop: request, decide, validate,
//!    dispatch, append, repeat.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use toolchat::{
//!     handler_fn, Agent, ChatCompletionsClient, CredentialCache, Message, PropertySchema,
//!     StaticToken, ToolDefinition, ToolRegistry, ToolSchema,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credentials = Arc::new(CredentialCache::new(StaticToken::new("your-token")));
//!     let client = ChatCompletionsClient::builder(
//!         "https://example.openai.azure.com",
//!         "gpt-35-turbo",
//!         credentials,
//!     )
//!     .build()?;
//!
//!     let mut registry = ToolRegistry::new();
//!     registry.register(
//!         ToolDefinition::new(
//!             "get_current_weather",
//!             "Get the current weather in a given location",
//!             ToolSchema::new().required_property("location", PropertySchema::string()),
//!         ),
//!         handler_fn(|_args| async move {
//!             Ok(serde_json::json!({"temperature": "22", "unit": "celsius"}))
//!         }),
//!     )?;
//!
//!     let agent = Agent::new(client, Arc::new(registry));
//!     let answer = agent
//!         .run(vec![Message::user("What's the weather like in Seattle?")], 5)
//!         .await?;
//!     println!("{:?}", answer.content());
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod client;
pub mod credential;
pub mod http;
pub mod model;
pub mod options;
pub mod schema;
pub mod tools;

pub use agent::{Agent, AgentError, CallError};
pub use api::{ChatCompletionsClient, ChatCompletionsClientBuilder};
pub use client::{Client, ClientError};
pub use credential::{
    AccessToken, ClientCredentials, CredentialCache, CredentialError, CredentialSource, Scopes,
    StaticToken,
};
pub use model::{Conversation, Decision, FinishReason, Message, Response, Role, ToolCallRequest, Usage};
pub use options::{AgentOptions, ModelOptions, RetryPolicy, TransportOptions};
pub use schema::{JsonType, PropertySchema, SchemaValidator, SchemaViolation, ToolSchema};
pub use tools::{handler_fn, RegistryError, Tool, ToolDefinition, ToolError, ToolHandler, ToolRegistry};

pub use tokio_util::sync::CancellationToken;

// Used by code generated from `#[tool]`.
#[doc(hidden)]
pub use async_trait;
pub use schemars;
#[doc(hidden)]
pub use serde_json;

// Re-export the proc macro attribute
pub use toolchat_macros::tool;
