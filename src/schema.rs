//! Tool argument schemas and their validation.
//!
//! A [`ToolSchema`] is the JSON-schema-like object description advertised to
//! the model for one tool: named, typed properties, optional enumerations and
//! a list of required names. [`SchemaValidator`] checks a decoded argument
//! object against it without coercing anything.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use tracing::warn;

/// Primitive JSON types a property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl JsonType {
    /// The narrowest type describing `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => JsonType::Integer,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
            JsonType::Null => value.is_null(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Null => "null",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `type` keyword: a single type or a union such as `["string", "null"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    Single(JsonType),
    Union(Vec<JsonType>),
}

impl TypeSpec {
    pub fn types(&self) -> &[JsonType] {
        match self {
            TypeSpec::Single(t) => std::slice::from_ref(t),
            TypeSpec::Union(ts) => ts,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        self.types().iter().any(|t| t.accepts(value))
    }
}

impl From<JsonType> for TypeSpec {
    fn from(t: JsonType) -> Self {
        TypeSpec::Single(t)
    }
}

/// Schema of a single named property.
///
/// Keywords other than `type`, `description` and `enum` are kept in `extra`
/// and sent to the service unchanged; they are not validated.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "PropertyRepr")]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: Option<TypeSpec>,
    pub description: Option<String>,
    #[serde(rename = "enum")]
    pub allowed: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// `true` is a valid (unconstrained) property schema.
#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyRepr {
    Any(bool),
    Schema(PropertyFields),
}

#[derive(Deserialize)]
struct PropertyFields {
    #[serde(rename = "type")]
    kind: Option<TypeSpec>,
    description: Option<String>,
    #[serde(rename = "enum")]
    allowed: Option<Vec<Value>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<PropertyRepr> for PropertySchema {
    fn from(repr: PropertyRepr) -> Self {
        match repr {
            PropertyRepr::Any(_) => PropertySchema::default(),
            PropertyRepr::Schema(fields) => PropertySchema {
                kind: fields.kind,
                description: fields.description,
                allowed: fields.allowed,
                extra: fields.extra,
            },
        }
    }
}

impl PropertySchema {
    pub fn new(kind: impl Into<TypeSpec>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    pub fn string() -> Self {
        Self::new(JsonType::String)
    }

    pub fn number() -> Self {
        Self::new(JsonType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(JsonType::Boolean)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Restrict the property to an enumerated set of values.
    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn admit_null_if_nullable(&mut self) {
        let nullable = self
            .kind
            .as_ref()
            .is_some_and(|kind| kind.types().contains(&JsonType::Null));
        if let Some(allowed) = self.allowed.as_mut() {
            if nullable && !allowed.contains(&Value::Null) {
                allowed.push(Value::Null);
            }
        }
    }

    fn check(&self, value: &Value) -> Option<ViolationKind> {
        if let Some(kind) = &self.kind {
            if !kind.accepts(value) {
                return Some(ViolationKind::WrongType {
                    expected: kind.types().to_vec(),
                    found: JsonType::of(value),
                });
            }
        }
        match &self.allowed {
            Some(allowed) if !allowed.contains(value) => Some(ViolationKind::NotInEnum {
                allowed: allowed.clone(),
            }),
            _ => None,
        }
    }
}

fn object_type() -> JsonType {
    JsonType::Object
}

/// Argument schema of a tool: always an object with named properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "object_type")]
    kind: JsonType,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(
        rename = "additionalProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<Value>,
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self {
            kind: JsonType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: None,
        }
    }
}

impl ToolSchema {
    /// An object schema with no properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a schema from a Rust type.
    ///
    /// Subschemas are inlined so enum and nested properties stay readable
    /// by the model; `Option<T>` fields become nullable and optional.
    pub fn for_type<T: JsonSchema>() -> Self {
        let root = SchemaSettings::draft07()
            .with(|settings| {
                settings.inline_subschemas = true;
                settings.option_add_null_type = true;
            })
            .into_generator()
            .into_root_schema_for::<T>();

        let mut schema: ToolSchema = serde_json::to_value(&root.schema)
            .and_then(serde_json::from_value)
            .unwrap_or_else(|e| {
                warn!(
                    "Schema for {} is not an object schema: {}",
                    std::any::type_name::<T>(),
                    e
                );
                ToolSchema::default()
            });
        // schemars marks `Option<Enum>` nullable in `type` but not in `enum`.
        for property in schema.properties.values_mut() {
            property.admit_null_if_nullable();
        }
        schema
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn required_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    /// Reject properties not declared in `properties`.
    pub fn closed(mut self) -> Self {
        self.additional_properties = Some(Value::Bool(false));
        self
    }

    /// Whether the schema itself forbids undeclared properties.
    pub fn is_closed(&self) -> bool {
        matches!(self.additional_properties, Some(Value::Bool(false)))
    }
}

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    Unrecognized,
    WrongType {
        expected: Vec<JsonType>,
        found: JsonType,
    },
    NotInEnum {
        allowed: Vec<Value>,
    },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Missing => f.write_str("missing required property"),
            ViolationKind::Unrecognized => f.write_str("unrecognized property"),
            ViolationKind::WrongType { expected, found } => {
                write!(f, "expected {}, found {}", expected.iter().join(" | "), found)
            }
            ViolationKind::NotInEnum { allowed } => {
                write!(f, "value must be one of {}", allowed.iter().join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.kind)
    }
}

/// Every field-level reason a payload failed its schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("schema violation: {}", .violations.iter().join("; "))]
pub struct SchemaViolation {
    pub violations: Vec<FieldViolation>,
}

impl SchemaViolation {
    /// Whether any violation concerns `field`.
    pub fn names(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

/// Checks argument objects against tool schemas.
///
/// In strict mode every schema is treated as closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator {
    strict: bool,
}

impl SchemaValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn validate(
        &self,
        schema: &ToolSchema,
        payload: &Map<String, Value>,
    ) -> Result<(), SchemaViolation> {
        let closed = self.strict || schema.is_closed();
        let mut violations = Vec::new();

        for (field, value) in payload {
            let kind = match schema.properties.get(field) {
                Some(property) => property.check(value),
                None if closed => Some(ViolationKind::Unrecognized),
                None => None,
            };
            if let Some(kind) = kind {
                violations.push(FieldViolation {
                    field: field.clone(),
                    kind,
                });
            }
        }

        for field in &schema.required {
            if !payload.contains_key(field) {
                violations.push(FieldViolation {
                    field: field.clone(),
                    kind: ViolationKind::Missing,
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolation { violations })
        }
    }
}
