//! Wire-level clients for chat-completion services.

pub mod chat_completions;

pub use chat_completions::{ChatCompletionsClient, ChatCompletionsClientBuilder};
