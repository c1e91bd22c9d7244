//! Agent: the conversation loop that dispatches tool calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{Client, ClientError};
use crate::credential::CredentialError;
use crate::model::{Conversation, Decision, Message, Response, ToolCallRequest};
use crate::options::AgentOptions;
use crate::schema::{SchemaValidator, SchemaViolation};
use crate::tools::{ToolDefinition, ToolError, ToolHandler, ToolRegistry};

/// Failures that end a run. Recoverable tool-call problems are reported to
/// the model instead (see [`CallError`]).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown tool requested by the model: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    CredentialUnavailable(CredentialError),

    #[error("transport failure: {0}")]
    Transport(#[source] ClientError),

    #[error("no final answer after {max_turns} turns")]
    TurnLimitExceeded { max_turns: usize },

    #[error("tool {tool} raised a fault: {message}")]
    HandlerFault { tool: String, message: String },

    #[error("run cancelled")]
    Cancelled,
}

impl From<ClientError> for AgentError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Credential(e) => AgentError::CredentialUnavailable(e),
            other => AgentError::Transport(other),
        }
    }
}

/// A tool call that failed in a way the model can react to. It is appended
/// to the conversation as a tool-result error payload and the run goes on.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("arguments are not a valid JSON object: {0}")]
    MalformedArguments(String),

    #[error(transparent)]
    SchemaViolation(#[from] SchemaViolation),

    #[error("{0}")]
    Failed(String),

    #[error("tool did not finish within {0:?}")]
    Timeout(Duration),
}

impl CallError {
    fn kind(&self) -> &'static str {
        match self {
            CallError::MalformedArguments(_) => "malformed_arguments",
            CallError::SchemaViolation(_) => "schema_violation",
            CallError::Failed(_) => "tool_failed",
            CallError::Timeout(_) => "timeout",
        }
    }

    /// The structured payload shown to the model.
    pub fn to_payload(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let CallError::SchemaViolation(violation) = self {
            error["violations"] = json!(violation.violations);
        }
        json!({ "error": error })
    }
}

/// Decode a raw argument payload. Missing or blank payloads mean `{}`.
fn parse_arguments(raw: Option<&str>) -> Result<Map<String, Value>, CallError> {
    let raw = match raw {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(Map::new()),
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CallError::MalformedArguments(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(CallError::MalformedArguments(e.to_string())),
    }
}

/// Agent that automatically executes tools in a loop.
///
/// Each turn:
/// 1. Sends the conversation and the registry's tool list to the client
/// 2. Returns a plain assistant answer as final
/// 3. Otherwise resolves, validates and invokes the requested tool
/// 4. Appends the call and its result (or error payload) to the conversation
/// 5. Loops until a final answer, the turn limit, or cancellation
///
/// The agent holds no per-conversation state, so one instance (and its
/// registry and credential cache) can drive many conversations concurrently.
///
/// # Example
/// ```ignore
/// let agent = Agent::new(client, Arc::new(registry));
/// let answer = agent
///     .run(vec![Message::user("What's the weather in Seattle?")], 5)
///     .await?;
/// ```
pub struct Agent<C: Client> {
    client: C,
    registry: Arc<ToolRegistry>,
    validator: SchemaValidator,
    options: AgentOptions,
}

impl<C: Client> Agent<C> {
    pub fn new(client: C, registry: Arc<ToolRegistry>) -> Self {
        Self::with_options(client, registry, AgentOptions::default())
    }

    pub fn with_options(client: C, registry: Arc<ToolRegistry>, options: AgentOptions) -> Self {
        Self {
            client,
            registry,
            validator: SchemaValidator::new(options.strict_schema),
            options,
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run with the configured turn limit.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<Message, AgentError> {
        self.run(messages, self.options.max_turns).await
    }

    /// Run a fresh conversation to its final assistant message.
    pub async fn run(&self, messages: Vec<Message>, max_turns: usize) -> Result<Message, AgentError> {
        let mut conversation = Conversation::new(messages);
        self.run_with(&mut conversation, max_turns, &CancellationToken::new())
            .await
    }

    /// Run on a caller-owned conversation that stays inspectable afterwards.
    ///
    /// Cancellation is honoured while waiting on the service or a handler. A
    /// tool call and its result are appended together, so a cancelled or
    /// failed run never leaves an unanswered call in `conversation`.
    pub async fn run_with(
        &self,
        conversation: &mut Conversation,
        max_turns: usize,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let span = info_span!("conversation", id = %conversation.id());
        self.drive(conversation, max_turns, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        max_turns: usize,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        debug!(
            "Starting agent loop with {} messages and {} tools",
            conversation.len(),
            self.registry.len()
        );

        for turn in 1..=max_turns {
            debug!("Agent turn {}/{}", turn, max_turns);

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                response = self.send(conversation.messages()) => response?,
            };
            if let Some(usage) = response.usage {
                conversation.record_usage(usage);
            }

            match response.into_decision()? {
                Decision::FinalAnswer(message) => {
                    conversation.push(message.clone());
                    info!(
                        "Agent finished after {} turns ({} tokens)",
                        turn,
                        conversation.usage().total()
                    );
                    return Ok(message);
                }
                Decision::ToolCall { message, request } => {
                    // A call that arrives after cancellation is never dispatched.
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    let (definition, handler) = self
                        .registry
                        .resolve(&request.name)
                        .map_err(|_| AgentError::UnknownTool(request.name.clone()))?;
                    info!("Tool call requested: {}", request.name);

                    let content = tokio::select! {
                        biased;
                        outcome = self.dispatch(definition, handler.as_ref(), &request) => {
                            self.tool_content(&request.name, outcome)?
                        }
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    };

                    conversation.push_exchange(message, Message::tool_result(request.name, content));

                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                }
            }
        }

        warn!("Max turns ({}) reached in agent loop", max_turns);
        Err(AgentError::TurnLimitExceeded { max_turns })
    }

    /// One chat request, retried with backoff on retryable failures.
    async fn send(&self, messages: &[Message]) -> Result<Response, ClientError> {
        let tools: &[ToolDefinition] = self.registry.definitions();
        let retry = &self.options.retry;
        let mut attempt = 1;

        loop {
            let result = match self.options.request_timeout {
                Some(limit) => tokio::time::timeout(limit, self.client.request(messages, tools))
                    .await
                    .unwrap_or(Err(ClientError::Timeout(limit))),
                None => self.client.request(messages, tools).await,
            };

            match result {
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        "Request attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Parse, validate and invoke one tool call.
    async fn dispatch(
        &self,
        definition: &ToolDefinition,
        handler: &dyn ToolHandler,
        request: &ToolCallRequest,
    ) -> Result<Value, DispatchError> {
        let arguments = parse_arguments(request.arguments.as_deref())?;
        debug!("Tool arguments: {:?}", arguments);
        self.validator
            .validate(&definition.schema, &arguments)
            .map_err(CallError::from)?;

        let invocation = handler.invoke(arguments);
        let result = match self.options.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => return Err(CallError::Timeout(limit).into()),
            },
            None => invocation.await,
        };

        result.map_err(|e| match e {
            ToolError::Fault(message) => DispatchError::Fault(message),
            ToolError::Failed(message) => DispatchError::Call(CallError::Failed(message)),
        })
    }

    /// Turn a dispatch outcome into tool-result content, escalating faults.
    fn tool_content(
        &self,
        tool: &str,
        outcome: Result<Value, DispatchError>,
    ) -> Result<Value, AgentError> {
        match outcome {
            Ok(value) => {
                info!("Tool {} executed successfully", tool);
                debug!("Tool result: {}", value);
                Ok(value)
            }
            Err(DispatchError::Call(e)) => {
                warn!("Tool {} call failed: {}", tool, e);
                Ok(e.to_payload())
            }
            Err(DispatchError::Fault(message)) => Err(AgentError::HandlerFault {
                tool: tool.to_string(),
                message,
            }),
        }
    }
}

enum DispatchError {
    Call(CallError),
    Fault(String),
}

impl From<CallError> for DispatchError {
    fn from(err: CallError) -> Self {
        DispatchError::Call(err)
    }
}
