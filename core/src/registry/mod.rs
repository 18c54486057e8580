//! Operation registry
//!
//! Maps operation identifiers to descriptors: accepted input tags, the
//! declared output tag, the argument schema and the run function. The
//! engine only ever looks at an operation through this contract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use crate::errors::{OperationError, RegistryError};
use crate::types::{Tag, Value};

pub mod builtin;

/// Signature every operation implements
pub type RunFn = fn(&Value, &ResolvedArgs) -> Result<Value, OperationError>;

/// Kind of value a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Number,
    /// A number with no fractional part
    Integer,
    Boolean,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Integer => "integer",
            ArgKind::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Concrete argument value bound in a recipe step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl ArgValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Boolean(_) => "boolean",
            ArgValue::Number(_) => "number",
            ArgValue::String(_) => "string",
        }
    }

    /// Check this value against a parameter kind, returning the reason on mismatch
    pub fn check_kind(&self, kind: ArgKind) -> Result<(), String> {
        match (kind, self) {
            (ArgKind::String, ArgValue::String(_)) | (ArgKind::Boolean, ArgValue::Boolean(_)) => {
                Ok(())
            }
            // The text form has no spelling for inf or NaN
            (ArgKind::Number | ArgKind::Integer, ArgValue::Number(n)) if !n.is_finite() => {
                Err(format!("expected finite number, got {}", n))
            }
            (ArgKind::Number, ArgValue::Number(_)) => Ok(()),
            (ArgKind::Integer, ArgValue::Number(n)) if n.fract() == 0.0 => Ok(()),
            (ArgKind::Integer, ArgValue::Number(n)) => {
                Err(format!("expected integer, got {}", n))
            }
            (kind, value) => Err(format!("expected {}, got {}", kind, value.type_name())),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Boolean(b) => write!(f, "{}", b),
            ArgValue::Number(n) => write!(f, "{}", n),
            ArgValue::String(s) => write_quoted(f, s),
        }
    }
}

/// Quote `s` using only the escapes the recipe grammar accepts
fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::String(s.to_string())
    }
}

impl From<f64> for ArgValue {
    fn from(n: f64) -> Self {
        ArgValue::Number(n)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Boolean(b)
    }
}

/// One entry of an operation's argument schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamDef {
    pub name: String,
    pub kind: ArgKind,
    pub default: Option<ArgValue>,
}

impl ParamDef {
    /// A parameter that must be bound by every step using the operation
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    /// A parameter that falls back to `default` when left unbound
    pub fn optional(name: impl Into<String>, kind: ArgKind, default: impl Into<ArgValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default.into()),
        }
    }
}

/// Arguments after validation: every schema parameter present, kinds checked
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedArgs {
    values: BTreeMap<String, ArgValue>,
}

impl ResolvedArgs {
    pub(crate) fn insert(&mut self, name: String, value: ArgValue) {
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(ArgValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ArgValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.values.iter()
    }
}

/// Capability contract of one operation
#[derive(Clone)]
pub struct OperationDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_tags: Vec<Tag>,
    pub output_tag: Tag,
    pub params: Vec<ParamDef>,
    pub run: RunFn,
}

impl OperationDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input_tags: &[Tag],
        output_tag: Tag,
        run: RunFn,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            input_tags: input_tags.to_vec(),
            output_tag,
            params: Vec::new(),
            run,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    pub fn accepts(&self, tag: Tag) -> bool {
        self.input_tags.contains(&tag)
    }

    /// Guard used by run functions before touching the payload
    pub fn expect_input(accepted: &[Tag], value: &Value) -> Result<(), OperationError> {
        if accepted.contains(&value.tag()) {
            Ok(())
        } else {
            Err(OperationError::TypeMismatch {
                expected: accepted.to_vec(),
                actual: value.tag(),
            })
        }
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("id", &self.id)
            .field("input_tags", &self.input_tags)
            .field("output_tag", &self.output_tag)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Mapping from operation id to descriptor
///
/// Read-only once shared with a pool. Changing it means building a new
/// registry and installing it as a fresh snapshot.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, OperationDescriptor>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in operations
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Add an operation, refusing to shadow an existing id
    pub fn register(&mut self, descriptor: OperationDescriptor) -> Result<(), RegistryError> {
        if descriptor.input_tags.is_empty() {
            return Err(RegistryError::NoInputTags(descriptor.id));
        }
        if self.operations.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }
        self.operations.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Add or overwrite an operation, returning the descriptor it displaced
    pub fn replace(
        &mut self,
        descriptor: OperationDescriptor,
    ) -> Result<Option<OperationDescriptor>, RegistryError> {
        if descriptor.input_tags.is_empty() {
            return Err(RegistryError::NoInputTags(descriptor.id));
        }
        Ok(self.operations.insert(descriptor.id.clone(), descriptor))
    }

    pub fn get(&self, id: &str) -> Option<&OperationDescriptor> {
        self.operations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in id order
    pub fn iter(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.values()
    }
}
