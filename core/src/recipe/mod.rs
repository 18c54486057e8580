//! Recipes: ordered operation invocations applied to one input
//!
//! A [`Recipe`] is plain data built by the caller (directly, from JSON, or
//! from the text form handled by [`parser`]). It is checked against a
//! registry by [`validator::validate`] before anything runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::registry::ArgValue;

pub mod parser;
pub mod validator;

pub use parser::{parse_recipe, RecipeParseError};
pub use validator::{validate, TypedRecipe, TypedStep};

/// One operation invocation with its argument bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub op: String,

    /// Bound to the operation's parameters in schema order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<ArgValue>,

    /// Bound by parameter name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgValue>,
}

impl RecipeStep {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            positional: Vec::new(),
            args: BTreeMap::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Bind an argument by name
    pub fn named(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for RecipeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.positional.is_empty() && self.args.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = self
            .positional
            .iter()
            .map(ToString::to_string)
            .chain(self.args.iter().map(|(k, v)| format!("{}={}", k, v)))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Ordered sequence of steps; the empty recipe is the identity transform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipe {
    steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn new(steps: Vec<RecipeStep>) -> Self {
        Self { steps }
    }

    pub fn then(mut self, step: RecipeStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[RecipeStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Parse the `op | op(arg) | op(name=value)` text form
    pub fn from_text(text: &str) -> Result<Self, RecipeParseError> {
        parse_recipe(text)
    }
}

impl FromIterator<RecipeStep> for Recipe {
    fn from_iter<I: IntoIterator<Item = RecipeStep>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

/// Canonical text form, parseable by [`parse_recipe`]
impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(" | "))
    }
}
