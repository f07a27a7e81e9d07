//! # API Definitions
//!
//! An API is a named collection of RPC signatures and event declarations.
//! Definitions are built with [`ApiDefinition::builder`], validated once and
//! then shared immutably.

use crate::errors::BusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Dotted API namespace such as `store` or `company.auth`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiName(String);

impl ApiName {
    /// Validate and wrap an API name.
    ///
    /// Segments are separated by `.`, must be non-empty and contain only
    /// ASCII letters, digits and `_`.
    pub fn parse(name: impl Into<String>) -> Result<Self, BusError> {
        let name = name.into();
        let invalid = |reason: &str| BusError::InvalidApiName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        for segment in name.split('.') {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(invalid("segments may only contain [A-Za-z0-9_]"));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ApiName {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ApiName> for String {
    fn from(name: ApiName) -> Self {
        name.0
    }
}

/// JSON type accepted by a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    Any,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

impl ParamType {
    /// Whether `value` satisfies this type. Integers are accepted where a
    /// number is expected; nothing else is coerced.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => value.is_null(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        }
    }

    /// Name of the JSON type `value` actually has, for error messages.
    pub fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

fn default_required() -> bool {
    true
}

/// A named parameter of an RPC or event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Parameter {
    /// Required parameter accepting any value.
    pub fn new(name: impl Into<String>) -> Self {
        Self::typed(name, ParamType::Any)
    }

    pub fn typed(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

impl From<&str> for Parameter {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<(&str, ParamType)> for Parameter {
    fn from((name, kind): (&str, ParamType)) -> Self {
        Self::typed(name, kind)
    }
}

/// Signature of a remote procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSignature {
    pub name: String,
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<ParamType>,
}

impl RpcSignature {
    pub fn new<P: Into<Parameter>>(
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = P>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.into_iter().map(Into::into).collect(),
            returns: None,
        }
    }

    #[must_use]
    pub fn returns(mut self, kind: ParamType) -> Self {
        self.returns = Some(kind);
        self
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Declaration of an event an API may fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDeclaration {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

impl EventDeclaration {
    pub fn new<P: Into<Parameter>>(
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = P>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }
}

/// A validated API: name, RPC signatures and event declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawApiDefinition")]
pub struct ApiDefinition {
    name: ApiName,
    rpcs: Vec<RpcSignature>,
    events: Vec<EventDeclaration>,
}

#[derive(Deserialize)]
struct RawApiDefinition {
    name: ApiName,
    #[serde(default)]
    rpcs: Vec<RpcSignature>,
    #[serde(default)]
    events: Vec<EventDeclaration>,
}

impl TryFrom<RawApiDefinition> for ApiDefinition {
    type Error = BusError;

    fn try_from(raw: RawApiDefinition) -> Result<Self, Self::Error> {
        let def = Self {
            name: raw.name,
            rpcs: raw.rpcs,
            events: raw.events,
        };
        def.validate()?;
        Ok(def)
    }
}

impl ApiDefinition {
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            name: name.into(),
            rpcs: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn rpcs(&self) -> &[RpcSignature] {
        &self.rpcs
    }

    pub fn events(&self) -> &[EventDeclaration] {
        &self.events
    }

    pub fn rpc(&self, name: &str) -> Option<&RpcSignature> {
        self.rpcs.iter().find(|r| r.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDeclaration> {
        self.events.iter().find(|e| e.name == name)
    }

    fn validate(&self) -> Result<(), BusError> {
        let mut members = HashSet::new();
        let rpcs = self.rpcs.iter().map(|r| ("rpc", &r.name, &r.parameters));
        let events = self.events.iter().map(|e| ("event", &e.name, &e.parameters));

        for (what, name, parameters) in rpcs.chain(events) {
            if !is_identifier(name) {
                return Err(BusError::InvalidDefinition(format!(
                    "{}: {what} name '{name}' is not an identifier",
                    self.name
                )));
            }
            if !members.insert((what, name.as_str())) {
                return Err(BusError::InvalidDefinition(format!(
                    "{}: duplicate {what} '{name}'",
                    self.name
                )));
            }
            let mut seen = HashSet::new();
            for param in parameters {
                if !is_identifier(&param.name) {
                    return Err(BusError::InvalidDefinition(format!(
                        "{}.{name}: parameter '{}' is not an identifier",
                        self.name, param.name
                    )));
                }
                if !seen.insert(param.name.as_str()) {
                    return Err(BusError::InvalidDefinition(format!(
                        "{}.{name}: duplicate parameter '{}'",
                        self.name, param.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`ApiDefinition`].
#[derive(Debug, Clone)]
pub struct ApiBuilder {
    name: String,
    rpcs: Vec<RpcSignature>,
    events: Vec<EventDeclaration>,
}

impl ApiBuilder {
    #[must_use]
    pub fn rpc(mut self, signature: RpcSignature) -> Self {
        self.rpcs.push(signature);
        self
    }

    #[must_use]
    pub fn event(mut self, declaration: EventDeclaration) -> Self {
        self.events.push(declaration);
        self
    }

    pub fn build(self) -> Result<ApiDefinition, BusError> {
        let def = ApiDefinition {
            name: ApiName::parse(self.name)?,
            rpcs: self.rpcs,
            events: self.events,
        };
        def.validate()?;
        Ok(def)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
