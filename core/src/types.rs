use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::StepError;

/// Kind of payload a [`Value`] carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    String,
    Number,
    Bytes,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::String, Tag::Number, Tag::Bytes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::String => "string",
            Tag::Number => "number",
            Tag::Bytes => "bytes",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" | "str" => Ok(Tag::String),
            "number" | "num" => Ok(Tag::Number),
            "bytes" | "hex" => Ok(Tag::Bytes),
            other => Err(format!(
                "Invalid tag: {}. Must be one of: string, number, bytes",
                other
            )),
        }
    }
}

/// Data flowing through a recipe
///
/// Values are never mutated in place; every operation produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Number(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::String(_) => Tag::String,
            Value::Number(_) => Tag::Number,
            Value::Bytes(_) => Tag::Bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Build a value of the given tag from command-line text.
    ///
    /// Bytes are read as hex pairs (whitespace ignored).
    pub fn parse_as(tag: Tag, text: &str) -> Result<Value, String> {
        match tag {
            Tag::String => Ok(Value::String(text.to_string())),
            Tag::Number => text
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|e| format!("Invalid number '{}': {}", text, e)),
            Tag::Bytes => decode_hex(text).map(Value::Bytes),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Bytes(b) => f.write_str(&encode_hex(b)),
        }
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits ({})", digits.len()));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).map_err(|_| format!("Invalid hex pair '{}'", s))
        })
        .collect()
}

/// Unique identity of one execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Terminal state of an execution request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "detail")]
pub enum ExecutionOutcome {
    Success(Value),
    Failure(StepError),
    Cancelled,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Finished(ExecutionOutcome),
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Finished(_))
    }

    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        match self {
            ExecutionStatus::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Snapshot of one request as seen through the result channel
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: RequestId,
    pub status: ExecutionStatus,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
