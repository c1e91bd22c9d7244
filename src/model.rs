//! Conversation messages, chat responses and the tool-call decision.

use std::ops::{Add, AddAssign};

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::client::ClientError;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// A tool invocation requested by the remote model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Name of the tool to invoke.
    pub name: String,
    /// Raw argument payload exactly as the model produced it (JSON text).
    /// `None` when the service omitted it.
    pub arguments: Option<String>,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Some(arguments.into()),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_call: Option<ToolCallRequest>,
    },
    /// Result of a dispatched tool call, or a structured error payload.
    ToolResult {
        name: String,
        content: Value,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// A plain assistant answer.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_call: None,
        }
    }

    /// An assistant message that requests a tool call.
    pub fn tool_call(request: ToolCallRequest) -> Self {
        Message::Assistant {
            content: None,
            tool_call: Some(request),
        }
    }

    pub fn tool_result(name: impl Into<String>, content: Value) -> Self {
        Message::ToolResult {
            name: name.into(),
            content,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::ToolResult { .. } => Role::ToolResult,
        }
    }

    /// Textual content, if the message carries any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Message::System { content } | Message::User { content } => Some(content),
            Message::Assistant { content, .. } => content.as_deref(),
            Message::ToolResult { .. } => None,
        }
    }

    pub fn tool_call_request(&self) -> Option<&ToolCallRequest> {
        match self {
            Message::Assistant { tool_call, .. } => tool_call.as_ref(),
            _ => None,
        }
    }
}

/// Why the service stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    FunctionCall,
    Length,
    ContentFilter,
    Other(String),
}

impl From<&str> for FinishReason {
    fn from(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "function_call" => FinishReason::FunctionCall,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Token usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// One candidate completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub message: Message,
    pub finish: FinishReason,
    /// Content-safety annotations, passed through uninterpreted.
    pub content_filter_results: Option<Value>,
}

/// A decoded chat-completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<String>,
    pub choices: NonEmpty<Choice>,
    pub usage: Option<Usage>,
    /// Prompt-level content-safety annotations, passed through uninterpreted.
    pub prompt_filter_results: Option<Value>,
}

/// What the model decided to do on a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A terminal assistant message.
    FinalAnswer(Message),
    /// The model wants a tool invoked; `message` is the assistant message
    /// carrying `request`, echoed back to the service on the next turn.
    ToolCall {
        message: Message,
        request: ToolCallRequest,
    },
}

impl Response {
    /// Single-choice response, mostly useful for scripted clients.
    pub fn new(message: Message, finish: FinishReason) -> Self {
        Self {
            id: None,
            choices: NonEmpty::new(Choice {
                message,
                finish,
                content_filter_results: None,
            }),
            usage: None,
            prompt_filter_results: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Decode the first choice into a [`Decision`].
    ///
    /// A `function_call` payload wins over any accompanying content. A
    /// `function_call` finish reason without a payload is a provider error.
    pub fn into_decision(self) -> Result<Decision, ClientError> {
        let choice = self.choices.head;
        match choice.message {
            Message::Assistant {
                tool_call: Some(ref request),
                ..
            } => {
                let request = request.clone();
                Ok(Decision::ToolCall {
                    message: choice.message,
                    request,
                })
            }
            Message::Assistant { .. } if choice.finish == FinishReason::FunctionCall => {
                Err(ClientError::Provider(
                    "finish_reason is function_call but no function_call was returned".to_string(),
                ))
            }
            Message::Assistant { .. } => Ok(Decision::FinalAnswer(choice.message)),
            other => Err(ClientError::Provider(format!(
                "expected an assistant message, got {:?}",
                other.role()
            ))),
        }
    }
}

/// An ordered, append-only message sequence owned by one run at a time.
///
/// An assistant message carrying a tool call is only ever appended together
/// with its tool result, so a reader never observes an unanswered call.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: Uuid,
    messages: Vec<Message>,
    usage: Usage,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
            usage: Usage::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Usage accumulated over every turn run on this conversation.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Append a follow-up user message before running another exchange.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub(crate) fn push_exchange(&mut self, call: Message, result: Message) {
        debug_assert!(call.tool_call_request().is_some());
        debug_assert_eq!(result.role(), Role::ToolResult);
        self.messages.reserve(2);
        self.messages.push(call);
        self.messages.push(result);
    }

    pub(crate) fn record_usage(&mut self, usage: Usage) {
        self.usage += usage;
    }
}
