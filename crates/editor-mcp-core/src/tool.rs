//! Declarative tool metadata
//!
//! This is the only surface the invocation engine inspects on a capability
//! provider, and the shape in which the host publishes its catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name of the built-in catalog operation answered by every host
pub const LIST_TOOLS: &str = "list_tools";

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    /// Value-like types get a zero value when an argument is absent
    pub fn is_value_like(&self) -> bool {
        matches!(
            self,
            ParamType::Integer | ParamType::Number | ParamType::Boolean
        )
    }

    /// Zero value used when no argument and no default exist
    pub fn zero_value(&self) -> Value {
        match self {
            ParamType::Integer => json!(0),
            ParamType::Number => json!(0.0),
            ParamType::Boolean => Value::Bool(false),
            _ => Value::Null,
        }
    }

    /// JSON Schema `type` keyword for this parameter type
    pub fn schema_type(&self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Integer => Some("integer"),
            ParamType::Number => Some("number"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Array => Some("array"),
            ParamType::Object => Some("object"),
            ParamType::Any => None,
        }
    }
}

/// A declared tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub has_default: bool,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    /// A parameter the caller is expected to supply
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            has_default: false,
            default: Value::Null,
            description: None,
        }
    }

    /// A parameter with a declared default value
    pub fn optional(name: impl Into<String>, ty: ParamType, default: Value) -> Self {
        Self {
            nullable: default.is_null(),
            has_default: true,
            default,
            ..Self::required(name, ty)
        }
    }

    /// Allow `null` for this parameter
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// JSON Schema fragment describing this parameter
    pub fn to_schema(&self) -> Value {
        let mut schema = serde_json::Map::new();
        match (self.ty.schema_type(), self.nullable) {
            (Some(ty), true) => {
                schema.insert("type".into(), json!([ty, "null"]));
            }
            (Some(ty), false) => {
                schema.insert("type".into(), json!(ty));
            }
            (None, _) => {}
        }
        if let Some(description) = &self.description {
            schema.insert("description".into(), json!(description));
        }
        if self.has_default {
            schema.insert("default".into(), self.default.clone());
        }
        Value::Object(schema)
    }
}

/// Catalog entry describing one registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl ToolInfo {
    /// JSON Schema object for the tool's input
    pub fn input_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.to_schema()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| !p.has_default)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
