//! Static type checking of recipes against a registry
//!
//! Validation only reads declared contracts (tags and argument schemas); it
//! never runs operation code, so it is cheap, pure and safe to repeat.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::{Recipe, RecipeStep};
use crate::errors::ValidationError;
use crate::registry::{OperationDescriptor, OperationRegistry, ResolvedArgs};
use crate::types::Tag;

/// A step whose operation exists and whose arguments are resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedStep {
    pub op_id: String,
    pub args: ResolvedArgs,
    pub input_tags: Vec<Tag>,
    pub output_tag: Tag,
}

/// Recipe that passed validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedRecipe {
    steps: Vec<TypedStep>,
    fingerprint: String,
}

impl TypedRecipe {
    pub fn steps(&self) -> &[TypedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// SHA-256 of the canonical recipe text, hex encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Tags the first step accepts; `None` for the identity recipe
    pub fn input_tags(&self) -> Option<&[Tag]> {
        self.steps.first().map(|s| s.input_tags.as_slice())
    }

    /// Tag produced when run on an input of `input` tag
    pub fn output_tag(&self, input: Tag) -> Tag {
        self.steps.last().map(|s| s.output_tag).unwrap_or(input)
    }

    /// Check the request's input against step 0
    pub fn check_input(&self, tag: Tag) -> Result<(), ValidationError> {
        match self.steps.first() {
            Some(first) if !first.input_tags.contains(&tag) => Err(ValidationError::TypeMismatch {
                step_index: 0,
                expected_tags: first.input_tags.clone(),
                actual_tag: tag,
            }),
            _ => Ok(()),
        }
    }
}

/// Type-check a recipe against the registry
///
/// Each step must name a registered operation and bind arguments matching
/// its schema; the declared output tag of step i-1 must be accepted by
/// step i. The first failure is returned.
pub fn validate(recipe: &Recipe, registry: &OperationRegistry) -> Result<TypedRecipe, ValidationError> {
    let mut steps = Vec::with_capacity(recipe.len());
    let mut previous: Option<Tag> = None;

    for (step_index, step) in recipe.steps().iter().enumerate() {
        let op = registry
            .get(&step.op)
            .ok_or_else(|| ValidationError::UnknownOperation {
                step_index,
                id: step.op.clone(),
            })?;

        if let Some(actual_tag) = previous {
            if !op.accepts(actual_tag) {
                return Err(ValidationError::TypeMismatch {
                    step_index,
                    expected_tags: op.input_tags.clone(),
                    actual_tag,
                });
            }
        }

        let args = resolve_args(step_index, step, op)?;
        previous = Some(op.output_tag);

        steps.push(TypedStep {
            op_id: op.id.clone(),
            args,
            input_tags: op.input_tags.clone(),
            output_tag: op.output_tag,
        });
    }

    Ok(TypedRecipe {
        steps,
        fingerprint: fingerprint(recipe),
    })
}

/// Validate and check the input tag in one go
pub fn validate_for_input(
    recipe: &Recipe,
    registry: &OperationRegistry,
    input: Tag,
) -> Result<TypedRecipe, ValidationError> {
    let typed = validate(recipe, registry)?;
    typed.check_input(input)?;
    Ok(typed)
}

/// Bind positional then named arguments, fill defaults, check kinds
fn resolve_args(
    step_index: usize,
    step: &RecipeStep,
    op: &OperationDescriptor,
) -> Result<ResolvedArgs, ValidationError> {
    let invalid = |param_name: &str, reason: String| ValidationError::InvalidArgument {
        step_index,
        param_name: param_name.to_string(),
        reason,
    };

    if step.positional.len() > op.params.len() {
        let param_name = format!("#{}", op.params.len());
        return Err(invalid(
            &param_name,
            format!(
                "'{}' takes at most {} argument(s), got {}",
                op.id,
                op.params.len(),
                step.positional.len()
            ),
        ));
    }

    let mut resolved = ResolvedArgs::default();
    let mut bound = HashSet::new();

    for (param, value) in op.params.iter().zip(&step.positional) {
        value.check_kind(param.kind).map_err(|reason| invalid(&param.name, reason))?;
        resolved.insert(param.name.clone(), value.clone());
        bound.insert(param.name.as_str());
    }

    for (name, value) in &step.args {
        let param = op
            .params
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| invalid(name, format!("'{}' has no parameter named '{}'", op.id, name)))?;
        if !bound.insert(param.name.as_str()) {
            return Err(invalid(name, "bound both positionally and by name".to_string()));
        }
        value.check_kind(param.kind).map_err(|reason| invalid(name, reason))?;
        resolved.insert(param.name.clone(), value.clone());
    }

    for param in &op.params {
        if bound.contains(param.name.as_str()) {
            continue;
        }
        match &param.default {
            Some(default) => resolved.insert(param.name.clone(), default.clone()),
            None => return Err(invalid(&param.name, "missing required argument".to_string())),
        }
    }

    Ok(resolved)
}

fn fingerprint(recipe: &Recipe) -> String {
    let mut hasher = Sha256::new();
    hasher.update(recipe.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
