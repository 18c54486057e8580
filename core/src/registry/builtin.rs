//! Reference operation set
//!
//! A handful of string, number and byte operations so the engine is usable
//! on its own. Each checks its input tag before touching the payload.

use super::{ArgKind, OperationDescriptor, OperationRegistry, ParamDef, ResolvedArgs};
use crate::errors::OperationError;
use crate::types::{decode_hex, encode_hex, Tag, Value};

const STRING: &[Tag] = &[Tag::String];
const NUMBER: &[Tag] = &[Tag::Number];
const BYTES: &[Tag] = &[Tag::Bytes];
const TEXTUAL: &[Tag] = &[Tag::String, Tag::Bytes];

/// Upper bound on `repeat` output, keeps a typo from exhausting memory
const MAX_REPEAT_LEN: usize = 16 * 1024 * 1024;

/// Add the built-in operations to `registry`
///
/// Ids already registered are left untouched, so callers can seed a
/// registry with their own operations first and merge the built-ins after.
pub fn register_all(registry: &mut OperationRegistry) {
    let operations = [
        OperationDescriptor::new("upper_first", "Upper first", STRING, Tag::String, upper_first)
            .description("Uppercase the first character"),
        OperationDescriptor::new("uppercase", "To upper case", STRING, Tag::String, uppercase),
        OperationDescriptor::new("lowercase", "To lower case", STRING, Tag::String, lowercase),
        OperationDescriptor::new("reverse", "Reverse", STRING, Tag::String, reverse)
            .description("Reverse the characters of a string"),
        OperationDescriptor::new("trim", "Trim", STRING, Tag::String, trim)
            .description("Strip leading and trailing whitespace"),
        OperationDescriptor::new("length", "Length", TEXTUAL, Tag::Number, length)
            .description("Count characters of a string or bytes of a byte sequence"),
        OperationDescriptor::new("repeat", "Repeat", STRING, Tag::String, repeat)
            .param(ParamDef::optional("count", ArgKind::Integer, 2.0))
            .param(ParamDef::optional("separator", ArgKind::String, "")),
        OperationDescriptor::new("multiply", "Multiply", NUMBER, Tag::Number, multiply)
            .param(ParamDef::required("factor", ArgKind::Number)),
        OperationDescriptor::new("encode_utf8", "Encode UTF-8", STRING, Tag::Bytes, encode_utf8),
        OperationDescriptor::new("decode_utf8", "Decode UTF-8", BYTES, Tag::String, decode_utf8)
            .param(ParamDef::optional("lossy", ArgKind::Boolean, false)),
        OperationDescriptor::new("to_hex", "To hex", BYTES, Tag::String, to_hex),
        OperationDescriptor::new("from_hex", "From hex", STRING, Tag::Bytes, from_hex),
    ];

    for op in operations {
        // Merging into a populated registry keeps the existing entry
        if let Err(e) = registry.register(op) {
            tracing::debug!(error = %e, "Skipping built-in operation");
        }
    }
}

fn string_input<'a>(value: &'a Value) -> Result<&'a str, OperationError> {
    OperationDescriptor::expect_input(STRING, value)?;
    Ok(value.as_str().unwrap_or_default())
}

fn upper_first(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    let s = string_input(value)?;
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    Ok(Value::String(out))
}

fn uppercase(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    Ok(Value::String(string_input(value)?.to_uppercase()))
}

fn lowercase(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    Ok(Value::String(string_input(value)?.to_lowercase()))
}

fn reverse(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    Ok(Value::String(string_input(value)?.chars().rev().collect()))
}

fn trim(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    Ok(Value::String(string_input(value)?.trim().to_string()))
}

fn length(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    OperationDescriptor::expect_input(TEXTUAL, value)?;
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Number(_) => 0,
    };
    Ok(Value::Number(len as f64))
}

fn repeat(value: &Value, args: &ResolvedArgs) -> Result<Value, OperationError> {
    let s = string_input(value)?;
    let count = args.number("count").unwrap_or(2.0);
    if count < 0.0 {
        return Err(OperationError::domain(format!(
            "count must not be negative, got {}",
            count
        )));
    }
    if count > MAX_REPEAT_LEN as f64 {
        return Err(OperationError::domain(format!(
            "count {} exceeds limit of {}",
            count, MAX_REPEAT_LEN
        )));
    }
    let count = count as usize;
    if s.is_empty() || count == 0 {
        return Ok(Value::String(String::new()));
    }

    let separator = args.string("separator").unwrap_or_default();
    let total = s
        .len()
        .saturating_mul(count)
        .saturating_add(separator.len().saturating_mul(count - 1));
    if total > MAX_REPEAT_LEN {
        return Err(OperationError::domain(format!(
            "output of {} bytes exceeds limit of {}",
            total, MAX_REPEAT_LEN
        )));
    }

    let mut out = String::with_capacity(total);
    for i in 0..count {
        if i > 0 {
            out.push_str(separator);
        }
        out.push_str(s);
    }
    Ok(Value::String(out))
}

fn multiply(value: &Value, args: &ResolvedArgs) -> Result<Value, OperationError> {
    OperationDescriptor::expect_input(NUMBER, value)?;
    let n = value.as_number().unwrap_or_default();
    let factor = args.number("factor").unwrap_or(1.0);
    Ok(Value::Number(n * factor))
}

fn encode_utf8(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    Ok(Value::Bytes(string_input(value)?.as_bytes().to_vec()))
}

fn decode_utf8(value: &Value, args: &ResolvedArgs) -> Result<Value, OperationError> {
    OperationDescriptor::expect_input(BYTES, value)?;
    let bytes = value.as_bytes().unwrap_or_default();
    if args.boolean("lossy").unwrap_or(false) {
        return Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()));
    }
    std::str::from_utf8(bytes)
        .map(|s| Value::String(s.to_string()))
        .map_err(|e| OperationError::domain(format!("Invalid UTF-8: {}", e)))
}

fn to_hex(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    OperationDescriptor::expect_input(BYTES, value)?;
    Ok(Value::String(encode_hex(value.as_bytes().unwrap_or_default())))
}

fn from_hex(value: &Value, _args: &ResolvedArgs) -> Result<Value, OperationError> {
    decode_hex(string_input(value)?)
        .map(Value::Bytes)
        .map_err(OperationError::domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArgValue;

    fn run(id: &str, input: Value) -> Result<Value, OperationError> {
        run_with(id, input, &[])
    }

    fn run_with(id: &str, input: Value, args: &[(&str, ArgValue)]) -> Result<Value, OperationError> {
        let registry = OperationRegistry::with_builtins();
        let op = registry.get(id).unwrap();
        let mut resolved = ResolvedArgs::default();
        for param in &op.params {
            if let Some(default) = &param.default {
                resolved.insert(param.name.clone(), default.clone());
            }
        }
        for (name, value) in args {
            resolved.insert(name.to_string(), value.clone());
        }
        (op.run)(&input, &resolved)
    }

    #[test]
    fn test_string_operations() {
        assert_eq!(run("upper_first", "hello".into()).unwrap(), Value::from("Hello"));
        assert_eq!(run("upper_first", "".into()).unwrap(), Value::from(""));
        assert_eq!(run("uppercase", "Hello".into()).unwrap(), Value::from("HELLO"));
        assert_eq!(run("lowercase", "HeLLo".into()).unwrap(), Value::from("hello"));
        assert_eq!(run("reverse", "abc".into()).unwrap(), Value::from("cba"));
        assert_eq!(run("trim", "  x \n".into()).unwrap(), Value::from("x"));
    }

    #[test]
    fn test_length_accepts_strings_and_bytes() {
        assert_eq!(run("length", "héllo".into()).unwrap(), Value::Number(5.0));
        assert_eq!(run("length", vec![1u8, 2, 3].into()).unwrap(), Value::Number(3.0));
        assert!(matches!(
            run("length", 4.0.into()),
            Err(OperationError::TypeMismatch { actual: Tag::Number, .. })
        ));
    }

    #[test]
    fn test_repeat_uses_defaults_and_bindings() {
        assert_eq!(run("repeat", "ab".into()).unwrap(), Value::from("abab"));
        assert_eq!(
            run_with(
                "repeat",
                "ab".into(),
                &[("count", 3.0.into()), ("separator", "-".into())]
            )
            .unwrap(),
            Value::from("ab-ab-ab")
        );
        assert!(run_with("repeat", "ab".into(), &[("count", (-1.0).into())]).is_err());
        assert_eq!(
            run_with("repeat", "ab".into(), &[("count", 0.0.into())]).unwrap(),
            Value::from("")
        );
    }

    #[test]
    fn test_repeat_huge_count_is_bounded() {
        assert!(matches!(
            run_with("repeat", "".into(), &[("count", 1e17.into())]),
            Err(OperationError::Domain { .. })
        ));
        assert!(matches!(
            run_with("repeat", "x".into(), &[("count", 1e7.into()), ("separator", "--".into())]),
            Err(OperationError::Domain { .. })
        ));
        assert_eq!(
            run_with("repeat", "".into(), &[("count", 1000.0.into())]).unwrap(),
            Value::from("")
        );
    }

    #[test]
    fn test_multiply() {
        assert_eq!(
            run_with("multiply", 4.0.into(), &[("factor", 2.5.into())]).unwrap(),
            Value::Number(10.0)
        );
    }

    #[test]
    fn test_byte_operations() {
        let bytes = run("encode_utf8", "hi".into()).unwrap();
        assert_eq!(bytes, Value::Bytes(b"hi".to_vec()));
        assert_eq!(run("to_hex", bytes.clone()).unwrap(), Value::from("6869"));
        assert_eq!(run("from_hex", "6869".into()).unwrap(), bytes);
        assert_eq!(run("decode_utf8", bytes).unwrap(), Value::from("hi"));
    }

    #[test]
    fn test_domain_errors() {
        assert!(matches!(
            run("from_hex", "zz".into()),
            Err(OperationError::Domain { .. })
        ));
        assert!(matches!(
            run("decode_utf8", Value::Bytes(vec![0xff, 0xfe])),
            Err(OperationError::Domain { .. })
        ));
        assert!(run_with("decode_utf8", Value::Bytes(vec![0xff]), &[("lossy", true.into())]).is_ok());
    }

    #[test]
    fn test_declared_output_tags_hold() {
        let registry = OperationRegistry::with_builtins();
        let samples = [Value::from("48656c6c6f"), Value::from(2.0), Value::Bytes(b"ok".to_vec())];
        for op in registry.iter() {
            for sample in samples.iter().filter(|s| op.accepts(s.tag())) {
                let mut args = ResolvedArgs::default();
                for param in &op.params {
                    let value = param.default.clone().unwrap_or(ArgValue::Number(1.0));
                    args.insert(param.name.clone(), value);
                }
                if let Ok(out) = (op.run)(sample, &args) {
                    assert_eq!(out.tag(), op.output_tag, "operation {}", op.id);
                }
            }
        }
    }
}
