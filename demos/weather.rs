use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use toolchat::{
    tool, Agent, AgentOptions, CancellationToken, ChatCompletionsClient, ClientCredentials,
    Conversation, CredentialCache, Message, StaticToken, ToolError, ToolRegistry,
};
use tracing_subscriber::EnvFilter;

// ============================================================================================
// Step 1: Define the Tool
// ============================================================================================
// The `#[tool]` attribute turns an impl block with an async `call` method into a tool. The
// argument schema advertised to the model is derived from the input type, so doc comments
// on its fields become property descriptions.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum Unit {
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WeatherArgs {
    /// The city and state, e.g. San Francisco, CA
    location: String,
    unit: Option<Unit>,
}

#[derive(Debug, Serialize)]
struct WeatherReport {
    location: String,
    temperature: String,
    unit: &'static str,
}

struct WeatherTool;

#[tool(
    name = "get_current_weather",
    description = "Get the current weather in a given location"
)]
impl WeatherTool {
    async fn call(&self, input: WeatherArgs) -> Result<WeatherReport, ToolError> {
        println!("  -> get_current_weather({:?})", input);
        let (temperature, unit) = match input.unit {
            Some(Unit::Fahrenheit) => ("72", "fahrenheit"),
            _ => ("22", "celsius"),
        };
        Ok(WeatherReport {
            location: input.location,
            temperature: temperature.to_string(),
            unit,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // ============================================================================================
    // Step 2: Credentials
    // ============================================================================================
    // Every request carries a bearer token from a shared `CredentialCache`. With
    // AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET set, tokens come from the
    // client-credentials grant and are refreshed before they expire; otherwise a fixed
    // AZURE_OPENAI_TOKEN is used.
    let source = match (
        std::env::var("AZURE_TENANT_ID"),
        std::env::var("AZURE_CLIENT_ID"),
        std::env::var("AZURE_CLIENT_SECRET"),
    ) {
        (Ok(tenant), Ok(client_id), Ok(secret)) => {
            let token_url = format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant
            );
            CredentialCache::new(ClientCredentials::new(token_url, client_id, secret))
        }
        _ => {
            let token = std::env::var("AZURE_OPENAI_TOKEN")
                .expect("AZURE_OPENAI_TOKEN or AZURE_CLIENT_* must be set");
            CredentialCache::new(StaticToken::new(token))
        }
    };
    let credentials = Arc::new(source);

    // ============================================================================================
    // Step 3: Client and Agent
    // ============================================================================================
    let endpoint = std::env::var("AZURE_OPENAI_ENDPOINT").expect("AZURE_OPENAI_ENDPOINT must be set");
    let deployment =
        std::env::var("AZURE_OPENAI_DEPLOYMENT").unwrap_or_else(|_| "gpt-35-turbo".to_string());
    let client = ChatCompletionsClient::builder(endpoint, deployment, credentials).build()?;

    let mut registry = ToolRegistry::new();
    registry.register_tool(WeatherTool)?;

    let options = AgentOptions::new()
        .with_max_turns(5)
        .with_request_timeout(Duration::from_secs(60))
        .with_handler_timeout(Duration::from_secs(10));
    let agent = Agent::with_options(client, Arc::new(registry), options);

    // ============================================================================================
    // Step 4: Run the Conversation
    // ============================================================================================
    // Ctrl-C cancels the run; whatever was appended so far stays in the conversation.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut conversation = Conversation::new(vec![
        Message::system("You are a helpful assistant."),
        Message::user("What's the weather like in Seattle?"),
    ]);

    println!("Running agent...");
    let answer = agent.run_with(&mut conversation, 5, &cancel).await?;

    println!("\nAssistant: {}", answer.content().unwrap_or_default());
    println!(
        "\n{} messages, {} tokens",
        conversation.len(),
        conversation.usage().total()
    );
    Ok(())
}
