//! Tools: callables with JSON-schema metadata, for selectors and agents.
//!
//! # Example
//!
//! ```rust,ignore
//! use ragweave::tools::{FunctionTool, Tool};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: i64,
//!     b: i64,
//! }
//!
//! let add = FunctionTool::from_fn("add", "Add two integers", |args: AddArgs| async move {
//!     Ok(serde_json::json!(args.a + args.b))
//! });
//! let output = add.call(serde_json::json!({"a": 1, "b": 2})).await?;
//! assert_eq!(output.content, "3");
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{RagError, Result};
use crate::postprocessor::{NodePostprocessor, apply_postprocessors};
use crate::query_engine::QueryEngine;
use crate::retrievers::Retriever;
use crate::schema::{MetadataMode, QueryBundle};

/// Name, description and parameter schema of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    /// JSON Schema of the call input.
    pub parameters: Value,
    /// Hand the output straight back to the user instead of to the model.
    #[serde(default)]
    pub return_direct: bool,
}

impl ToolMetadata {
    /// Metadata taking a single string `input` parameter.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: default_parameters(),
            return_direct: false,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Derive the parameter schema from `T`.
    pub fn with_parameters_schema<T: JsonSchema>(self) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .unwrap_or_else(|_| default_parameters());
        self.with_parameters(schema)
    }

    pub fn with_return_direct(mut self, return_direct: bool) -> Self {
        self.return_direct = return_direct;
        self
    }

    /// Function-calling definition in the OpenAI tools format.
    pub fn to_openai_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

fn default_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "input": {"type": "string"}
        },
        "required": ["input"]
    })
}

/// Result of a tool call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_name: String,
    /// Text handed to the caller.
    pub content: String,
    pub is_error: bool,
    pub raw_input: Value,
    pub raw_output: Value,
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

impl ToolOutput {
    fn error(tool_name: &str, raw_input: Value, message: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            raw_output: Value::String(message.clone()),
            content: message,
            is_error: true,
            raw_input,
        }
    }
}

/// Something a selector or agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> &ToolMetadata;

    async fn call(&self, input: Value) -> Result<ToolOutput>;
}

/// The query text of a tool input: a bare string or `{"input": "..."}`.
fn input_text(input: &Value) -> Result<String> {
    match input {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get("input")
            .or_else(|| map.get("query"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RagError::InvalidArgument("tool input needs an 'input' string".into())),
        other => Err(RagError::InvalidArgument(format!("unsupported tool input: {other}"))),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON type a positional parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
}

impl ParamType {
    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

type ToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A tool backed by an async closure.
///
/// Errors from the closure, and inputs that fail to bind, come back as outputs
/// with `is_error` set rather than as `Err`.
#[derive(Clone)]
pub struct FunctionTool {
    metadata: ToolMetadata,
    func: ToolFn,
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

impl FunctionTool {
    /// Wrap a closure taking the raw JSON input.
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            metadata: ToolMetadata::new(name, description),
            func: Arc::new(move |input: Value| -> BoxFuture<'static, Result<Value>> {
                Box::pin(func(input))
            }),
        }
    }

    /// Wrap a closure over typed arguments; the schema is derived from `A`.
    pub fn from_fn<A, F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        func: F,
    ) -> Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let func = Arc::new(func);
        let tool = Self::new(name, description, move |input: Value| {
            let func = func.clone();
            async move {
                let args: A = serde_json::from_value(input)
                    .map_err(|e| RagError::InvalidArgument(format!("invalid arguments: {e}")))?;
                (*func)(args).await
            }
        });
        tool.with_parameters_schema::<A>()
    }

    /// Wrap a closure over positional arguments.
    ///
    /// Parameters are named by `params` (a `None` name becomes `arg{i}`). The
    /// input may be an object keyed by those names or an array in order.
    pub fn from_positional<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<(Option<String>, ParamType)>,
        func: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let params: Vec<(String, ParamType)> = params
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| (name.unwrap_or_else(|| format!("arg{i}")), ty))
            .collect();
        let properties: serde_json::Map<String, Value> = params
            .iter()
            .map(|(name, ty)| (name.clone(), json!({"type": ty.as_str()})))
            .collect();
        let required: Vec<&String> = params.iter().map(|(name, _)| name).collect();
        let schema = json!({"type": "object", "properties": properties, "required": required});

        let func = Arc::new(func);
        let bound = Arc::new(params);
        Self::new(name, description, move |input: Value| {
            let func = func.clone();
            let params = bound.clone();
            async move {
                let args = bind_positional(&params, input)?;
                (*func)(args).await
            }
        })
        .with_parameters(schema)
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.metadata.parameters = parameters;
        self
    }

    pub fn with_parameters_schema<T: JsonSchema>(mut self) -> Self {
        self.metadata = self.metadata.with_parameters_schema::<T>();
        self
    }

    pub fn with_return_direct(mut self, return_direct: bool) -> Self {
        self.metadata.return_direct = return_direct;
        self
    }
}

fn bind_positional(params: &[(String, ParamType)], input: Value) -> Result<Vec<Value>> {
    let values: Vec<Value> = match input {
        Value::Array(values) => values,
        Value::Object(mut map) => {
            params.iter().map(|(name, _)| map.remove(name).unwrap_or(Value::Null)).collect()
        }
        other if params.len() == 1 => vec![other],
        other => {
            return Err(RagError::InvalidArgument(format!(
                "expected {} arguments, got {other}",
                params.len()
            )));
        }
    };
    if values.len() != params.len() {
        return Err(RagError::InvalidArgument(format!(
            "expected {} arguments, got {}",
            params.len(),
            values.len()
        )));
    }
    for ((name, ty), value) in params.iter().zip(&values) {
        if !ty.accepts(value) {
            return Err(RagError::InvalidArgument(format!(
                "argument '{name}' must be {}, got {value}",
                ty.as_str()
            )));
        }
    }
    Ok(values)
}

#[async_trait]
impl Tool for FunctionTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, input: Value) -> Result<ToolOutput> {
        info!(tool = %self.metadata.name, "function tool called");
        match (self.func)(input.clone()).await {
            Ok(output) => Ok(ToolOutput {
                tool_name: self.metadata.name.clone(),
                content: value_text(&output),
                is_error: false,
                raw_input: input,
                raw_output: output,
            }),
            Err(e) => {
                warn!(tool = %self.metadata.name, error = %e, "function tool failed");
                Ok(ToolOutput::error(&self.metadata.name, input, e.to_string()))
            }
        }
    }
}

/// Answers the input with a query engine.
pub struct QueryEngineTool {
    query_engine: Arc<dyn QueryEngine>,
    metadata: ToolMetadata,
}

impl QueryEngineTool {
    pub fn new(query_engine: Arc<dyn QueryEngine>, metadata: ToolMetadata) -> Self {
        Self { query_engine, metadata }
    }
}

#[async_trait]
impl Tool for QueryEngineTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, input: Value) -> Result<ToolOutput> {
        let query = input_text(&input)?;
        info!(tool = %self.metadata.name, query = %query, "query engine tool called");
        let response = self.query_engine.query_str(&query).await?;
        Ok(ToolOutput {
            tool_name: self.metadata.name.clone(),
            content: response.response.clone(),
            is_error: false,
            raw_input: input,
            raw_output: serde_json::to_value(&response)?,
        })
    }
}

/// Retrieves for the input and returns the node texts, metadata included.
pub struct RetrieverTool {
    retriever: Arc<dyn Retriever>,
    metadata: ToolMetadata,
    postprocessors: Vec<Arc<dyn NodePostprocessor>>,
}

impl RetrieverTool {
    pub fn new(retriever: Arc<dyn Retriever>, metadata: ToolMetadata) -> Self {
        Self { retriever, metadata, postprocessors: Vec::new() }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn NodePostprocessor>) -> Self {
        self.postprocessors.push(postprocessor);
        self
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }
}

#[async_trait]
impl Tool for RetrieverTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, input: Value) -> Result<ToolOutput> {
        let query = QueryBundle::new(input_text(&input)?);
        let nodes = self.retriever.retrieve(&query).await?;
        let nodes = apply_postprocessors(&self.postprocessors, &query, nodes).await?;
        info!(tool = %self.metadata.name, nodes = nodes.len(), "retriever tool called");
        let content = nodes
            .iter()
            .map(|n| n.node.content(MetadataMode::Llm))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput {
            tool_name: self.metadata.name.clone(),
            content,
            is_error: false,
            raw_input: input,
            raw_output: serde_json::to_value(&nodes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocessor::SimilarityPostprocessor;
    use crate::schema::{Node, NodeWithScore};

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn typed_function_tool() {
        let tool = FunctionTool::from_fn("add", "Add two integers", |args: AddArgs| async move {
            Ok(json!(args.a + args.b))
        });
        let props = &tool.metadata().parameters["properties"];
        assert_eq!(props["a"]["type"], "integer");

        let output = tool.call(json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(output.content, "5");
        assert!(!output.is_error);

        let bad = tool.call(json!({"a": "two"})).await.unwrap();
        assert!(bad.is_error);
    }

    #[tokio::test]
    async fn positional_names_and_types() {
        let tool = FunctionTool::from_positional(
            "greet",
            "Greet someone",
            vec![(Some("name".to_string()), ParamType::String), (None, ParamType::Integer)],
            |args| async move { Ok(json!(format!("{} x{}", value_text(&args[0]), args[1]))) },
        );
        assert_eq!(tool.metadata().parameters["required"], json!(["name", "arg1"]));
        let output = tool.call(json!({"name": "Ada", "arg1": 2})).await.unwrap();
        assert_eq!(output.content, "Ada x2");
        let output = tool.call(json!(["Ada", 3])).await.unwrap();
        assert_eq!(output.content, "Ada x3");
        assert!(tool.call(json!(["Ada", "three"])).await.unwrap().is_error);
    }

    #[tokio::test]
    async fn function_errors_become_error_output() {
        let tool = FunctionTool::new("fail", "Always fails", |_| async {
            Err(RagError::upstream("test", "nope"))
        });
        let output = tool.call(json!({"input": "x"})).await.unwrap();
        assert!(output.is_error);
        assert!(output.content.contains("nope"));
    }

    struct Fixed;

    #[async_trait]
    impl Retriever for Fixed {
        async fn retrieve(&self, _query: &QueryBundle) -> Result<Vec<NodeWithScore>> {
            Ok(vec![
                NodeWithScore::new(Node::with_id("a", "first").with_metadata("src", "x"), 0.9),
                NodeWithScore::new(Node::with_id("b", "second"), 0.1),
            ])
        }
    }

    #[tokio::test]
    async fn retriever_tool_joins_llm_content() {
        let tool = RetrieverTool::new(Arc::new(Fixed), ToolMetadata::new("docs", "Search docs"))
            .with_postprocessor(Arc::new(SimilarityPostprocessor::new(0.5)));
        let output = tool.call(json!("query")).await.unwrap();
        assert_eq!(output.content, "src: x\n\nfirst");
    }

    #[test]
    fn openai_tool_shape() {
        let tool = ToolMetadata::new("docs", "Search docs").to_openai_tool();
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "docs");
        assert_eq!(tool["function"]["parameters"]["required"], json!(["input"]));
    }
}
