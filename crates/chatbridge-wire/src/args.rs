//! Positional type-tag argument decoding.
//!
//! Function-call arguments arrive as arrays whose first element is an
//! integer type tag: 1=null, 2=number, 3=string, 4=boolean, 5=nested
//! object. Objects encode their fields as `[key, tagged-value]` pairs and
//! recurse. A small recursive-descent decoder with explicit arity checks
//! turns this into plain JSON; unknown tags are an error so callers skip
//! the record instead of guessing.

use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};

const TAG_NULL: u64 = 1;
const TAG_NUMBER: u64 = 2;
const TAG_STRING: u64 = 3;
const TAG_BOOLEAN: u64 = 4;
const TAG_OBJECT: u64 = 5;

/// Decodes one tagged value into plain JSON.
pub fn decode_tagged(raw: &Value) -> Result<Value> {
    let parts = raw
        .as_array()
        .ok_or_else(|| DecodeError::Shape(format!("tagged value is not an array: {raw}")))?;
    let tag = parts
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Shape(format!("missing type tag in {raw}")))?;

    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_NUMBER => {
            let n = arity_one(tag, parts)?;
            n.as_f64()
                .map(|f| serde_json::json!(f))
                .or_else(|| n.as_i64().map(|i| serde_json::json!(i)))
                .ok_or_else(|| DecodeError::BadArity {
                    tag,
                    detail: format!("expected number, got {n}"),
                })
        }
        TAG_STRING => {
            let s = arity_one(tag, parts)?;
            s.as_str()
                .map(|s| Value::String(s.to_string()))
                .ok_or_else(|| DecodeError::BadArity {
                    tag,
                    detail: format!("expected string, got {s}"),
                })
        }
        TAG_BOOLEAN => {
            let b = arity_one(tag, parts)?;
            match b {
                Value::Bool(v) => Ok(Value::Bool(*v)),
                // Some producers encode booleans as 0/1.
                Value::Number(n) => Ok(Value::Bool(n.as_i64() == Some(1))),
                other => Err(DecodeError::BadArity {
                    tag,
                    detail: format!("expected boolean, got {other}"),
                }),
            }
        }
        TAG_OBJECT => {
            let fields = arity_one(tag, parts)?
                .as_array()
                .ok_or_else(|| DecodeError::BadArity {
                    tag,
                    detail: "object fields are not an array".into(),
                })?;
            let mut map = Map::new();
            for field in fields {
                let pair = field.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    DecodeError::BadArity {
                        tag,
                        detail: format!("object field is not a [key, value] pair: {field}"),
                    }
                })?;
                let key = pair[0].as_str().ok_or_else(|| DecodeError::BadArity {
                    tag,
                    detail: format!("object key is not a string: {}", pair[0]),
                })?;
                map.insert(key.to_string(), decode_tagged(&pair[1])?);
            }
            Ok(Value::Object(map))
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn arity_one<'a>(tag: u64, parts: &'a [Value]) -> Result<&'a Value> {
    if parts.len() != 2 {
        return Err(DecodeError::BadArity {
            tag,
            detail: format!("expected [tag, value], got {} elements", parts.len()),
        });
    }
    Ok(&parts[1])
}
