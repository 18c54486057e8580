//! Recipe execution: a left fold of operations over one input value
//!
//! Each step looks its operation up in the registry snapshot and replaces
//! the current value with the operation's output. The first failing step
//! halts the fold; no partial output is ever returned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio_util::sync::CancellationToken;

use crate::errors::{OperationError, StepError};
use crate::recipe::{TypedRecipe, TypedStep};
use crate::registry::OperationRegistry;
use crate::types::{ExecutionOutcome, Value};

/// Why a fold stopped before the last step
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    Failed(StepError),
    /// Cancellation observed before running `step_index`
    Cancelled { step_index: usize },
}

/// Run a validated recipe to completion, checking `cancel` between steps
///
/// A cancellation observed after the last step still yields `Cancelled`;
/// the caller asked for the result to be discarded.
pub fn execute(
    recipe: &TypedRecipe,
    registry: &OperationRegistry,
    input: Value,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    match fold_steps(recipe, registry, input, Some(cancel), |_, _| {}) {
        Ok(_) if cancel.is_cancelled() => ExecutionOutcome::Cancelled,
        Ok(value) => ExecutionOutcome::Success(value),
        Err(Halt::Failed(err)) => ExecutionOutcome::Failure(err),
        Err(Halt::Cancelled { .. }) => ExecutionOutcome::Cancelled,
    }
}

/// Run a recipe and keep every intermediate value
///
/// Element `i` of the returned vector is the output of step `i`; the last
/// element is the final result. The identity recipe returns an empty trace.
pub fn execute_traced(
    recipe: &TypedRecipe,
    registry: &OperationRegistry,
    input: Value,
) -> Result<Vec<Value>, StepError> {
    let mut trace = Vec::with_capacity(recipe.len());
    let result = fold_steps(recipe, registry, input, None, |_, value| {
        trace.push(value.clone())
    });
    match result {
        Ok(_) => Ok(trace),
        Err(Halt::Failed(err)) => Err(err),
        Err(Halt::Cancelled { .. }) => unreachable!("traced execution has no cancel token"),
    }
}

fn fold_steps(
    recipe: &TypedRecipe,
    registry: &OperationRegistry,
    input: Value,
    cancel: Option<&CancellationToken>,
    mut on_step: impl FnMut(usize, &Value),
) -> Result<Value, Halt> {
    let mut current = input;

    for (step_index, step) in recipe.steps().iter().enumerate() {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Halt::Cancelled { step_index });
        }

        current = run_step(step_index, step, registry, &current).map_err(Halt::Failed)?;
        on_step(step_index, &current);
    }

    Ok(current)
}

fn run_step(
    step_index: usize,
    step: &TypedStep,
    registry: &OperationRegistry,
    input: &Value,
) -> Result<Value, StepError> {
    let fail = |source: OperationError| StepError {
        step_index,
        operation_id: step.op_id.clone(),
        source,
    };

    let op = registry.get(&step.op_id).ok_or_else(|| {
        fail(OperationError::domain(format!(
            "operation '{}' missing from registry snapshot",
            step.op_id
        )))
    })?;

    let output = catch_unwind(AssertUnwindSafe(|| (op.run)(input, &step.args)))
        .map_err(|panic| fail(OperationError::domain(panic_message(panic.as_ref()))))?
        .map_err(fail)?;

    debug_assert_eq!(
        output.tag(),
        step.output_tag,
        "operation '{}' returned a value outside its declared output tag",
        step.op_id
    );

    Ok(output)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("operation panicked: {}", detail)
}
