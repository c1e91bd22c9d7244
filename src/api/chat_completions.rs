//! Chat Completions client for deployment-addressed endpoints
//! (`{endpoint}/openai/deployments/{deployment}/chat/completions`).
//!
//! Tools are advertised through the `functions` field and the model answers
//! either with text `content` or a `function_call {name, arguments}`. Every
//! request carries a bearer token from the shared [`CredentialCache`].

use std::sync::Arc;

use async_trait::async_trait;
use nonempty::NonEmpty;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::client::{Client, ClientError};
use crate::credential::{CredentialCache, Scopes};
use crate::http::{add_extra_headers, build_http_client, RequestBuilderExt, ResponseExt};
use crate::model::{Choice, FinishReason, Message, Response, ToolCallRequest, Usage};
use crate::options::{ModelOptions, TransportOptions};
use crate::schema::ToolSchema;
use crate::tools::ToolDefinition;

pub const DEFAULT_API_VERSION: &str = "2023-07-01-preview";

/// Scope requested when none is configured.
pub const DEFAULT_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// HTTP client for one chat-completions deployment.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    scopes: Scopes,
    credentials: Arc<CredentialCache>,
    model_options: ModelOptions,
    transport_options: TransportOptions,
}

pub struct ChatCompletionsClientBuilder {
    endpoint: String,
    deployment: String,
    credentials: Arc<CredentialCache>,
    api_version: String,
    scopes: Scopes,
    model_options: ModelOptions,
    transport_options: TransportOptions,
}

impl ChatCompletionsClientBuilder {
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn scopes(mut self, scopes: Scopes) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn model_options(mut self, options: ModelOptions) -> Self {
        self.model_options = options;
        self
    }

    pub fn transport_options(mut self, options: TransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    pub fn build(self) -> Result<ChatCompletionsClient, ClientError> {
        if self.endpoint.is_empty() {
            return Err(ClientError::Config("endpoint must not be empty".to_string()));
        }
        if self.deployment.is_empty() {
            return Err(ClientError::Config("deployment must not be empty".to_string()));
        }

        Ok(ChatCompletionsClient {
            http: build_http_client(&self.transport_options)?,
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            deployment: self.deployment,
            api_version: self.api_version,
            scopes: self.scopes,
            credentials: self.credentials,
            model_options: self.model_options,
            transport_options: self.transport_options,
        })
    }
}

impl ChatCompletionsClient {
    pub fn builder(
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        credentials: Arc<CredentialCache>,
    ) -> ChatCompletionsClientBuilder {
        ChatCompletionsClientBuilder {
            endpoint: endpoint.into(),
            deployment: deployment.into(),
            credentials,
            api_version: DEFAULT_API_VERSION.to_string(),
            scopes: Scopes::new([DEFAULT_SCOPE]),
            model_options: ModelOptions::default(),
            transport_options: TransportOptions::default(),
        }
    }

    /// Request URL without the `api-version` query parameter.
    pub fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions",
            self.endpoint, self.deployment
        )
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn model_options(&self) -> &ModelOptions {
        &self.model_options
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }
}

#[async_trait]
impl Client for ChatCompletionsClient {
    async fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Response, ClientError> {
        let token = self.credentials.token(&self.scopes).await?;
        let body = ChatRequest::new(&self.deployment, messages, tools, &self.model_options);

        let mut req = self
            .http
            .post(self.url())
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json");

        req = add_extra_headers(req, &self.transport_options);

        debug!(
            "Sending {} messages and {} functions to deployment {}",
            messages.len(),
            tools.len(),
            self.deployment
        );
        let response = req.json_logged(&body).send().await?;

        let chat_response: ChatResponse = match response.json_checked().await {
            Err(ClientError::Unauthorized(message)) => {
                self.credentials.invalidate(&self.scopes).await;
                return Err(ClientError::Unauthorized(message));
            }
            other => other?,
        };

        chat_response.try_into()
    }
}

impl<'a> ChatRequest<'a> {
    fn new(
        model: &'a str,
        messages: &[Message],
        tools: &'a [ToolDefinition],
        model_options: &ModelOptions,
    ) -> Self {
        let functions = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|def| ChatFunction {
                        name: &def.name,
                        description: &def.description,
                        parameters: &def.schema,
                    })
                    .collect(),
            )
        };

        ChatRequest {
            model,
            messages: messages.iter().map(ChatMessage::from).collect(),
            functions,
            temperature: model_options.temperature,
            top_p: model_options.top_p,
            max_tokens: model_options.max_tokens,
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        match msg {
            Message::System { content } => ChatMessage::text("system", content),
            Message::User { content } => ChatMessage::text("user", content),
            Message::Assistant { content, tool_call } => ChatMessage {
                role: "assistant",
                content: content.clone(),
                name: None,
                function_call: tool_call.as_ref().map(|call| ChatFunctionCall {
                    name: call.name.clone(),
                    arguments: call
                        .arguments
                        .clone()
                        .filter(|a| !a.trim().is_empty())
                        .unwrap_or_else(|| "{}".to_string()),
                }),
            },
            Message::ToolResult { name, content } => ChatMessage {
                role: "function",
                content: Some(content.to_string()),
                name: Some(name.clone()),
                function_call: None,
            },
        }
    }
}

impl ChatMessage {
    fn text(role: &'static str, content: &str) -> Self {
        ChatMessage {
            role,
            content: Some(content.to_string()),
            name: None,
            function_call: None,
        }
    }
}

impl TryFrom<ChatResponse> for Response {
    type Error = ClientError;

    fn try_from(chat_resp: ChatResponse) -> Result<Self, Self::Error> {
        let choices: Vec<Choice> = chat_resp
            .choices
            .into_iter()
            .map(|choice| {
                let message = choice.message.unwrap_or_default();
                Choice {
                    message: Message::Assistant {
                        content: message.content,
                        tool_call: message.function_call.map(|call| ToolCallRequest {
                            name: call.name,
                            arguments: call.arguments,
                        }),
                    },
                    finish: choice
                        .finish_reason
                        .as_deref()
                        .map(FinishReason::from)
                        .unwrap_or(FinishReason::Stop),
                    content_filter_results: choice.content_filter_results,
                }
            })
            .collect();

        let choices = NonEmpty::from_vec(choices)
            .ok_or_else(|| ClientError::Provider("response contained no choices".to_string()))?;

        Ok(Response {
            id: chat_resp.id,
            choices,
            usage: chat_resp.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            prompt_filter_results: chat_resp.prompt_filter_results,
        })
    }
}

// --- Chat Completions API Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    functions: Option<Vec<ChatFunction<'a>>>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serialize_always]
    content: Option<String>,
    name: Option<String>,
    function_call: Option<ChatFunctionCall>,
}

#[derive(Debug, Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a ToolSchema,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    #[serde(alias = "prompt_annotations")]
    prompt_filter_results: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
    content_filter_results: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    function_call: Option<ResponseFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AccessToken, CredentialError, CredentialSource, StaticToken};
    use crate::schema::PropertySchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Issues `token-N`, counting acquisitions.
    struct CountingSource(Arc<AtomicUsize>);

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn acquire(&self, _scopes: &Scopes) -> Result<AccessToken, CredentialError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::expiring_in(
                format!("token-{}", n),
                Duration::from_secs(3600),
            ))
        }
    }

    /// Answers one connection per scripted `(status, body)` and records
    /// each request head (request line plus headers).
    struct StubServer {
        endpoint: String,
        heads: Arc<Mutex<Vec<String>>>,
    }

    impl StubServer {
        async fn start(replies: Vec<(u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let endpoint = format!("http://{}", listener.local_addr().unwrap());
            let heads = Arc::new(Mutex::new(Vec::new()));
            let recorded = heads.clone();

            tokio::spawn(async move {
                for (status, body) in replies {
                    let (mut stream, _) = listener.accept().await.unwrap();
                    let head = read_request(&mut stream).await;
                    recorded.lock().unwrap().push(head);
                    let reply = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    stream.write_all(reply.as_bytes()).await.unwrap();
                    stream.shutdown().await.unwrap();
                }
            });

            Self { endpoint, heads }
        }

        fn head(&self, i: usize) -> String {
            self.heads.lock().unwrap()[i].clone()
        }
    }

    /// Read a full request and return its head, lowercased.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers ended");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        head
    }

    const ANSWER: &str = r#"{"id":"chatcmpl-1","choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"Hello"}}]}"#;

    fn stub_client(endpoint: &str, acquisitions: &Arc<AtomicUsize>) -> ChatCompletionsClient {
        let credentials = Arc::new(CredentialCache::new(CountingSource(acquisitions.clone())));
        ChatCompletionsClient::builder(endpoint, "gpt-35-turbo", credentials)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_carries_bearer_token_and_api_version() {
        let server = StubServer::start(vec![(200, ANSWER)]).await;
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let client = stub_client(&server.endpoint, &acquisitions);

        let response = client.request(&[Message::user("Hi")], &[]).await.unwrap();

        assert_eq!(response.choices.first().message.content(), Some("Hello"));
        let head = server.head(0);
        assert!(head.starts_with(
            "post /openai/deployments/gpt-35-turbo/chat/completions?api-version=2023-07-01-preview http/1.1"
        ));
        assert!(head.contains("authorization: bearer token-1"));
        assert!(head.contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn test_unauthorized_drops_the_cached_token() {
        let server = StubServer::start(vec![
            (401, r#"{"error":{"code":"401","message":"Access token is missing or invalid."}}"#),
            (200, ANSWER),
        ])
        .await;
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let client = stub_client(&server.endpoint, &acquisitions);

        let err = client.request(&[Message::user("Hi")], &[]).await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));
        assert!(err.is_retryable());

        client.request(&[Message::user("Hi")], &[]).await.unwrap();

        assert_eq!(acquisitions.load(Ordering::SeqCst), 2);
        assert!(server.head(1).contains("authorization: bearer token-2"));
    }

    #[tokio::test]
    async fn test_error_body_is_decoded() {
        let server = StubServer::start(vec![(
            404,
            r#"{"error":{"code":"DeploymentNotFound","message":"The API deployment for this resource does not exist."}}"#,
        )])
        .await;
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let client = stub_client(&server.endpoint, &acquisitions);

        let err = client.request(&[Message::user("Hi")], &[]).await.unwrap_err();

        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(
                    message,
                    "The API deployment for this resource does not exist. (DeploymentNotFound)"
                );
            }
            other => panic!("Expected status error, got {:?}", other),
        }
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
    }

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::new(
            "get_current_weather",
            "Get the current weather in a given location",
            ToolSchema::new()
                .required_property("location", PropertySchema::string())
                .property(
                    "unit",
                    PropertySchema::string().with_enum(["celsius", "fahrenheit"]),
                ),
        )
    }

    #[test]
    fn test_request_body() {
        let messages = vec![
            Message::system("You are a helpful assistant."),
            Message::user("What's the weather like in Seattle?"),
            Message::tool_call(ToolCallRequest::new(
                "get_current_weather",
                r#"{"location":"Seattle, WA"}"#,
            )),
            Message::tool_result(
                "get_current_weather",
                json!({"temperature": "22", "unit": "celsius"}),
            ),
        ];
        let tools = vec![weather_tool()];
        let options = ModelOptions::new().with_temperature(0.0);

        let body = serde_json::to_value(ChatRequest::new("gpt-35", &messages, &tools, &options))
            .unwrap();

        assert_eq!(body["model"], "gpt-35");
        assert_eq!(body["temperature"], 0.0);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["functions"][0]["name"], "get_current_weather");
        assert_eq!(body["functions"][0]["parameters"]["required"], json!(["location"]));
        assert_eq!(
            body["messages"][2],
            json!({
                "role": "assistant",
                "content": null,
                "function_call": {
                    "name": "get_current_weather",
                    "arguments": "{\"location\":\"Seattle, WA\"}"
                }
            })
        );
        assert_eq!(body["messages"][3]["role"], "function");
        assert_eq!(body["messages"][3]["name"], "get_current_weather");
        let content: Value =
            serde_json::from_str(body["messages"][3]["content"].as_str().unwrap()).unwrap();
        assert_eq!(content, json!({"temperature": "22", "unit": "celsius"}));
    }

    #[test]
    fn test_functions_omitted_without_tools() {
        let body = serde_json::to_value(ChatRequest::new(
            "gpt-35",
            &[Message::user("hi")],
            &[],
            &ModelOptions::default(),
        ))
        .unwrap();
        assert!(body.get("functions").is_none());
    }

    #[test]
    fn test_function_call_response() {
        let raw = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "finish_reason": "function_call",
                "message": {
                    "role": "assistant",
                    "function_call": {
                        "name": "get_current_weather",
                        "arguments": "{\n  \"location\": \"Seattle, WA\"\n}"
                    }
                },
                "content_filter_results": {}
            }],
            "usage": {"prompt_tokens": 82, "completion_tokens": 18, "total_tokens": 100},
            "prompt_filter_results": [{"prompt_index": 0, "content_filter_results": {}}]
        });

        let chat: ChatResponse = serde_json::from_value(raw).unwrap();
        let response = Response::try_from(chat).unwrap();
        let choice = response.choices.first();

        assert_eq!(choice.finish, FinishReason::FunctionCall);
        let request = choice.message.tool_call_request().unwrap();
        assert_eq!(request.name, "get_current_weather");
        assert_eq!(
            response.usage,
            Some(Usage {
                prompt_tokens: 82,
                completion_tokens: 18
            })
        );
        assert_eq!(choice.content_filter_results, Some(json!({})));
        assert!(response.prompt_filter_results.is_some());
    }

    #[test]
    fn test_empty_choices_is_an_error() {
        let chat: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            Response::try_from(chat),
            Err(ClientError::Provider(_))
        ));
    }

    #[test]
    fn test_builder_url() {
        let credentials = Arc::new(CredentialCache::new(StaticToken::new("secret")));
        let client = ChatCompletionsClient::builder(
            "https://example.openai.azure.com/",
            "gpt-35-turbo",
            credentials,
        )
        .build()
        .unwrap();

        assert_eq!(
            client.url(),
            "https://example.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions"
        );
    }

    #[test]
    fn test_builder_rejects_empty_deployment() {
        let credentials = Arc::new(CredentialCache::new(StaticToken::new("secret")));
        let result = ChatCompletionsClient::builder("https://example.com", "", credentials).build();
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
