//! Tool discovery and invocation
//!
//! Capability providers are registered on a [`ToolEngine`] and describe their
//! operations as [`ToolDeclaration`]s. The engine resolves an incoming
//! [`ToolRequest`] to a declaration, marshals the wire arguments to the
//! declared parameter types and runs the handler on its own task.

use async_trait::async_trait;
use editor_mcp_core::{
    Arguments, BridgeError, LIST_TOOLS, ParamSpec, ParamType, Result, ToolInfo, ToolReply,
    ToolRequest,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Something that can run a tool with marshalled arguments
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: ToolArgs) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, args: ToolArgs) -> Result<Value> {
        (self)(args).await
    }
}

/// Adapter for handlers that return immediately
struct SyncHandler<F>(F);

#[async_trait]
impl<F> ToolHandler for SyncHandler<F>
where
    F: Fn(ToolArgs) -> Result<Value> + Send + Sync,
{
    async fn call(&self, args: ToolArgs) -> Result<Value> {
        (self.0)(args)
    }
}

/// One operation exposed by a provider
pub struct ToolDeclaration {
    ident: String,
    name: Option<String>,
    description: Option<String>,
    parameters: Vec<ParamSpec>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDeclaration {
    /// Declare an asynchronous operation; `ident` names it unless overridden
    pub fn new(ident: impl Into<String>, handler: impl ToolHandler + 'static) -> Self {
        Self {
            ident: ident.into(),
            name: None,
            description: None,
            parameters: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Declare a synchronous operation
    pub fn sync<F>(ident: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(ident, SyncHandler(handler))
    }

    /// Publish the operation under a different name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    /// Name the operation is invoked by
    pub fn resolved_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.ident)
    }
}

/// A capability provider
pub trait ToolProvider: Send + Sync {
    fn declare(self: Arc<Self>) -> Vec<ToolDeclaration>;
}

struct ToolEntry {
    info: ToolInfo,
    handler: Arc<dyn ToolHandler>,
}

/// Snapshot of every discovered tool
#[derive(Default)]
pub struct ToolTable {
    tools: HashMap<String, ToolEntry>,
}

impl ToolTable {
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.get(name).map(|entry| &entry.info)
    }

    /// Metadata of every tool, sorted by name
    pub fn catalog(&self) -> Vec<ToolInfo> {
        let mut catalog: Vec<ToolInfo> = self.tools.values().map(|e| e.info.clone()).collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }
}

/// Marshalled arguments handed to a tool handler
#[derive(Debug, Clone, Default)]
pub struct ToolArgs {
    values: Arguments,
}

impl ToolArgs {
    pub fn new(values: Arguments) -> Self {
        Self { values }
    }

    /// Raw value of a parameter, `Null` when absent
    pub fn value(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Null)
    }

    /// Deserialize a parameter into `T`
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_value(self.value(name).clone()).map_err(|e| {
            BridgeError::InvalidArgument {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Like [`get`](Self::get) but `Null` becomes `None`
    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.value(name) {
            Value::Null => Ok(None),
            _ => self.get(name).map(Some),
        }
    }

    pub fn into_inner(self) -> Arguments {
        self.values
    }
}

/// Resolves tool requests against registered providers
pub struct ToolEngine {
    providers: Vec<Arc<dyn ToolProvider>>,
    table: RwLock<Option<Arc<ToolTable>>>,
}

/// Builder for [`ToolEngine`]
#[derive(Default)]
pub struct ToolEngineBuilder {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl ToolEngineBuilder {
    pub fn provider<P: ToolProvider + 'static>(mut self, provider: Arc<P>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> ToolEngine {
        ToolEngine {
            providers: self.providers,
            table: RwLock::new(None),
        }
    }
}

impl ToolEngine {
    pub fn builder() -> ToolEngineBuilder {
        ToolEngineBuilder::default()
    }

    /// Scan every provider's declarations and replace the tool table
    pub fn discover(&self) -> Arc<ToolTable> {
        let mut table = ToolTable::default();

        for provider in &self.providers {
            for declaration in provider.clone().declare() {
                let name = declaration.resolved_name().to_string();
                if name == LIST_TOOLS {
                    warn!("Tool name '{}' is reserved, skipping declaration", LIST_TOOLS);
                    continue;
                }

                let entry = ToolEntry {
                    info: ToolInfo {
                        name: name.clone(),
                        description: declaration.description,
                        parameters: declaration.parameters,
                    },
                    handler: declaration.handler,
                };
                if table.tools.insert(name.clone(), entry).is_some() {
                    warn!("Duplicate tool name '{}', later declaration wins", name);
                }
            }
        }

        debug!("Discovered {} tools", table.len());
        let table = Arc::new(table);
        *self.table.write() = Some(table.clone());
        table
    }

    /// Current table, discovering on first use
    pub fn table(&self) -> Arc<ToolTable> {
        if let Some(table) = self.table.read().as_ref() {
            return table.clone();
        }
        self.discover()
    }

    /// Run the tool named by `request`; failures become `isError` replies
    pub async fn invoke(&self, request: ToolRequest) -> ToolReply {
        let table = self.table();

        if request.name == LIST_TOOLS {
            return match serde_json::to_value(table.catalog()) {
                Ok(catalog) => ToolReply::success(request.id, request.name, catalog),
                Err(e) => ToolReply::error_for(&request, &BridgeError::from(e)),
            };
        }

        let Some(entry) = table.tools.get(&request.name) else {
            warn!("Tool '{}' not found", request.name);
            return ToolReply::error_for(&request, &BridgeError::UnknownTool(request.name.clone()));
        };

        let args = match marshal(&entry.info.parameters, &request.arguments) {
            Ok(args) => args,
            Err(e) => return ToolReply::error_for(&request, &tool_failed(&request.name, e)),
        };

        debug!(tool = %request.name, id = %request.id, "Invoking tool");
        let handler = entry.handler.clone();
        let outcome = tokio::spawn(async move { handler.call(args).await }).await;

        match outcome {
            Ok(Ok(value)) => ToolReply::success(request.id, request.name, value),
            Ok(Err(e)) => {
                warn!(tool = %request.name, "Tool returned an error: {}", e);
                ToolReply::error_for(&request, &tool_failed(&request.name, e))
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "task was cancelled".to_string()
                };
                warn!(tool = %request.name, "Tool panicked: {}", message);
                ToolReply::error_for(&request, &tool_failed(&request.name, BridgeError::Failed(message)))
            }
        }
    }
}

fn tool_failed(tool: &str, error: BridgeError) -> BridgeError {
    match error {
        BridgeError::ToolFailed { .. } => error,
        other => BridgeError::ToolFailed {
            tool: tool.to_string(),
            message: other.to_string(),
        },
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Build handler arguments from the wire arguments
pub fn marshal(parameters: &[ParamSpec], arguments: &Arguments) -> Result<ToolArgs> {
    let mut values = Arguments::new();
    for param in parameters {
        let value = match arguments.get(&param.name) {
            Some(value) => coerce(param, value)?,
            None if param.has_default => param.default.clone(),
            None if param.nullable || !param.ty.is_value_like() => Value::Null,
            None => param.ty.zero_value(),
        };
        values.insert(param.name.clone(), value);
    }
    Ok(ToolArgs::new(values))
}

/// Convert a wire value to the parameter's declared type
pub fn coerce(param: &ParamSpec, value: &Value) -> Result<Value> {
    if let Some(value) = coerce_strict(param.ty, value) {
        return Ok(value);
    }

    let invalid = |reason: String| BridgeError::InvalidArgument {
        name: param.name.clone(),
        reason,
    };

    match (value, param.ty) {
        (Value::Null, _) if param.nullable => Ok(Value::Null),
        (Value::Null, _) if param.has_default => Ok(param.default.clone()),
        (Value::Null, ty) if ty.is_value_like() => Ok(ty.zero_value()),
        (Value::Null, _) => Ok(Value::Null),
        (Value::String(s), ParamType::Integer) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| invalid(format!("cannot parse '{}' as integer: {}", s, e))),
        (Value::String(s), ParamType::Number) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("cannot parse '{}' as number", s))),
        (Value::String(s), ParamType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid(format!("cannot parse '{}' as boolean", s))),
        },
        (Value::Number(n), ParamType::String) => Ok(Value::String(n.to_string())),
        (Value::Number(n), ParamType::Integer) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| Value::from(f as i64))
            .ok_or_else(|| invalid(format!("{} is not an integer", n))),
        (Value::Bool(b), ParamType::String) => Ok(Value::String(b.to_string())),
        _ => Err(invalid(format!(
            "expected {}, got {}",
            param.ty.schema_type().unwrap_or("any"),
            wire_kind(value)
        ))),
    }
}

fn coerce_strict(ty: ParamType, value: &Value) -> Option<Value> {
    let accepted = match (ty, value) {
        (ParamType::Any, _) => true,
        (ParamType::String, Value::String(_)) => true,
        (ParamType::Boolean, Value::Bool(_)) => true,
        (ParamType::Array, Value::Array(_)) => true,
        (ParamType::Object, Value::Object(_)) => true,
        (ParamType::Number, Value::Number(_)) => true,
        (ParamType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
        _ => false,
    };
    accepted.then(|| value.clone())
}

fn wire_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
