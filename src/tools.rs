//! Tool definitions, handlers and the registry the agent dispatches through.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::ToolSchema;

/// Name, description and argument schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "parameters")]
    pub schema: ToolSchema,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: ToolSchema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }
}

/// Error type for tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The call failed; the model is shown the message and may retry.
    #[error("Tool error: {0}")]
    Failed(String),

    /// A non-retryable fault that aborts the whole run.
    #[error("Tool fault: {0}")]
    Fault(String),
}

impl ToolError {
    pub fn failed(message: impl fmt::Display) -> Self {
        ToolError::Failed(message.to_string())
    }

    pub fn fault(message: impl fmt::Display) -> Self {
        ToolError::Fault(message.to_string())
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ToolError::Fault(_))
    }
}

/// Local implementation of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with already validated arguments.
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError>;
}

/// A handler that also knows its own definition, as generated by `#[tool]`.
pub trait Tool: ToolHandler {
    fn definition(&self) -> ToolDefinition;
}

/// Adapts an async closure into a [`ToolHandler`]. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let handler = handler_fn(|args| async move {
///     Ok(serde_json::json!({"echo": args}))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        (self.0)(arguments).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Maps tool names to definitions and handlers, in registration order.
///
/// Built up front and then shared read-only (usually behind an `Arc`) by
/// every conversation that uses it.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    handlers: Vec<Arc<dyn ToolHandler>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, definition: ToolDefinition, handler: H) -> Result<(), RegistryError>
    where
        H: ToolHandler + 'static,
    {
        self.register_arc(definition, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool(definition.name));
        }
        self.index
            .insert(definition.name.clone(), self.definitions.len());
        self.definitions.push(definition);
        self.handlers.push(handler);
        Ok(())
    }

    /// Register a self-describing tool.
    pub fn register_tool<T>(&mut self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        let definition = tool.definition();
        self.register(definition, tool)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H>(mut self, definition: ToolDefinition, handler: H) -> Result<Self, RegistryError>
    where
        H: ToolHandler + 'static,
    {
        self.register(definition, handler)?;
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Result<(&ToolDefinition, &Arc<dyn ToolHandler>), RegistryError> {
        self.index
            .get(name)
            .map(|&i| (&self.definitions[i], &self.handlers[i]))
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// Definitions in registration order, as attached to every request.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "tools",
                &self.definitions.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertySchema;
    use serde_json::json;

    fn echo() -> impl ToolHandler {
        handler_fn(|args| async move { Ok(Value::Object(args)) })
    }

    fn definition(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "Echo the arguments",
            ToolSchema::new().property("text", PropertySchema::string()),
        )
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(definition("echo"), echo()).unwrap();

        let err = registry.register(definition("echo"), echo()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("echo".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_definitions_keep_registration_order() {
        let registry = ToolRegistry::new()
            .with(definition("zeta"), echo())
            .and_then(|r| r.with(definition("alpha"), echo()))
            .and_then(|r| r.with(definition("mid"), echo()))
            .unwrap();

        let names: Vec<_> = registry.definitions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_resolve_and_invoke() {
        let registry = ToolRegistry::new().with(definition("echo"), echo()).unwrap();

        let (def, handler) = registry.resolve("echo").unwrap();
        assert_eq!(def.name, "echo");

        let mut args = Map::new();
        args.insert("text".to_string(), json!("hi"));
        assert_eq!(handler.invoke(args).await.unwrap(), json!({"text": "hi"}));
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::UnknownTool(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_definition_wire_shape() {
        let value = serde_json::to_value(definition("echo")).unwrap();
        assert_eq!(value["name"], "echo");
        assert_eq!(value["parameters"]["type"], "object");
    }
}
