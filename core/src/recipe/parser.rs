//! PEST-based parser for the recipe text form
//!
//! ```text
//! upper_first | repeat(3, separator=", ") | length
//! ```

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use super::{Recipe, RecipeStep};
use crate::registry::ArgValue;

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "recipe/recipe.pest"]
struct RecipeParser;

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (line {line}, column {col})")]
pub struct RecipeParseError {
    pub message: String,
    /// 1-indexed
    pub line: usize,
    /// 1-indexed
    pub col: usize,
}

impl From<pest::error::Error<Rule>> for RecipeParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let (line, col) = match err.line_col {
            pest::error::LineColLocation::Pos(pos) => pos,
            pest::error::LineColLocation::Span(start, _) => start,
        };
        let message = match &err.variant {
            pest::error::ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
                let expected: Vec<String> = positives.iter().map(describe_rule).collect();
                format!("expected {}", expected.join(" or "))
            }
            pest::error::ErrorVariant::ParsingError { .. } => "unexpected input".to_string(),
            pest::error::ErrorVariant::CustomError { message } => message.clone(),
        };
        RecipeParseError { message, line, col }
    }
}

fn describe_rule(rule: &Rule) -> String {
    match rule {
        Rule::ident => "operation or parameter name".to_string(),
        Rule::string => "string".to_string(),
        Rule::number => "number".to_string(),
        Rule::boolean => "boolean".to_string(),
        Rule::named_arg => "argument".to_string(),
        Rule::EOI => "end of recipe".to_string(),
        other => format!("{:?}", other),
    }
}

/* ===================== Public API ===================== */

/// Parse recipe text into a [`Recipe`]
///
/// Empty (or comment-only) text yields the empty recipe.
pub fn parse_recipe(source: &str) -> Result<Recipe, RecipeParseError> {
    let mut pairs = RecipeParser::parse(Rule::recipe, source)?;
    let Some(recipe) = pairs.next() else {
        return Ok(Recipe::default());
    };

    recipe
        .into_inner()
        .filter(|pair| pair.as_rule() == Rule::step)
        .map(build_step)
        .collect::<Result<Vec<_>, _>>()
        .map(Recipe::new)
}

/* ===================== Builders ===================== */

fn build_step(pair: Pair<Rule>) -> Result<RecipeStep, RecipeParseError> {
    let mut inner = pair.into_inner();
    let op = inner.next().map(|p| p.as_str()).unwrap_or_default();
    let mut step = RecipeStep::new(op);

    if let Some(arguments) = inner.next() {
        for arg in arguments.into_inner() {
            match arg.as_rule() {
                Rule::named_arg => {
                    let (line, col) = arg.line_col();
                    let mut parts = arg.into_inner();
                    let name = parts.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                    let value = parts.next().map(build_value).transpose()?.ok_or_else(|| {
                        RecipeParseError {
                            message: format!("missing value for '{}'", name),
                            line,
                            col,
                        }
                    })?;
                    if step.args.contains_key(&name) {
                        return Err(RecipeParseError {
                            message: format!("argument '{}' given twice", name),
                            line,
                            col,
                        });
                    }
                    step.args.insert(name, value);
                }
                _ => step.positional.push(build_value(arg)?),
            }
        }
    }

    Ok(step)
}

fn build_value(pair: Pair<Rule>) -> Result<ArgValue, RecipeParseError> {
    let (line, col) = pair.line_col();
    match pair.as_rule() {
        Rule::boolean => Ok(ArgValue::Boolean(pair.as_str() == "true")),
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(ArgValue::Number)
            .map_err(|e| RecipeParseError {
                message: format!("invalid number '{}': {}", pair.as_str(), e),
                line,
                col,
            }),
        Rule::string => {
            let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or_default();
            Ok(ArgValue::String(unescape(raw)))
        }
        other => Err(RecipeParseError {
            message: format!("unexpected {:?}", other),
            line,
            col,
        }),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
