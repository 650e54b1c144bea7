//! PostgreSQL text-format encoding and decoding.
//!
//! The driver binds parameters and receives results in text format, so
//! decoding is driven by the column type OID from RowDescription.

use super::error::{PgError, PgResult};
use crate::value::Value;

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

/// Decode one non-NULL column value from its text representation.
pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Value> {
    let text = std::str::from_utf8(data)
        .map_err(|e| PgError::Type(format!("invalid UTF-8 in column of type {}: {}", oid.0, e)))?;

    let value = match oid {
        Oid::BOOL => Value::Bool(text == "t"),
        Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE => Value::Int(
            text.parse()
                .map_err(|_| PgError::Type(format!("invalid integer: {}", text)))?,
        ),
        Oid::FLOAT4 | Oid::FLOAT8 => Value::Float(
            text.parse()
                .map_err(|_| PgError::Type(format!("invalid float: {}", text)))?,
        ),
        Oid::JSON | Oid::JSONB => Value::Json(
            serde_json::from_str(text).map_err(|e| PgError::Type(format!("invalid json: {}", e)))?,
        ),
        Oid::BYTEA => Value::Bytes(decode_bytea_hex(text)?),
        // numeric, dates, uuids, ... keep their canonical text form
        _ => Value::Text(text.to_string()),
    };
    Ok(value)
}

/// Encode a parameter in text format. `None` binds SQL NULL.
pub fn encode_text(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { b"t".to_vec() } else { b"f".to_vec() }),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        Value::Float(f) => Some(f.to_string().into_bytes()),
        Value::Text(s) => Some(s.as_bytes().to_vec()),
        Value::Bytes(b) => {
            let mut out = Vec::with_capacity(2 + b.len() * 2);
            out.extend_from_slice(b"\\x");
            for byte in b {
                out.extend_from_slice(format!("{:02x}", byte).as_bytes());
            }
            Some(out)
        }
        Value::Json(j) => Some(j.to_string().into_bytes()),
    }
}

/// Decode bytea hex output (`\x0102ff`).
fn decode_bytea_hex(text: &str) -> PgResult<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| PgError::Type("bytea not in hex format".to_string()))?;
    if hex.len() % 2 != 0 {
        return Err(PgError::Type("odd-length bytea hex".to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| PgError::Type(format!("invalid bytea hex: {}", &hex[i..i + 2])))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_text(Oid::BOOL, b"t").unwrap(), Value::Bool(true));
        assert_eq!(decode_text(Oid::BOOL, b"f").unwrap(), Value::Bool(false));
        assert_eq!(decode_text(Oid::INT4, b"-42").unwrap(), Value::Int(-42));
        assert_eq!(decode_text(Oid::INT8, b"9000000000").unwrap(), Value::Int(9_000_000_000));
        assert_eq!(decode_text(Oid::FLOAT8, b"1.5").unwrap(), Value::Float(1.5));
        assert_eq!(
            decode_text(Oid::VARCHAR, b"hello").unwrap(),
            Value::Text("hello".to_string())
        );
    }

    #[test]
    fn test_decode_json_and_bytea() {
        assert_eq!(
            decode_text(Oid::JSONB, br#"{"a": [1, 2]}"#).unwrap(),
            Value::Json(serde_json::json!({"a": [1, 2]}))
        );
        assert_eq!(
            decode_text(Oid::BYTEA, b"\\xdeadbeef").unwrap(),
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert!(decode_text(Oid::BYTEA, b"\\xabc").is_err());
    }

    #[test]
    fn test_decode_invalid_integer() {
        assert!(matches!(decode_text(Oid::INT4, b"abc"), Err(PgError::Type(_))));
    }

    #[test]
    fn test_encode_text() {
        assert_eq!(encode_text(&Value::Null), None);
        assert_eq!(encode_text(&Value::Bool(true)), Some(b"t".to_vec()));
        assert_eq!(encode_text(&Value::Int(7)), Some(b"7".to_vec()));
        assert_eq!(encode_text(&Value::Bytes(vec![0x01, 0xff])), Some(b"\\x01ff".to_vec()));
        assert_eq!(
            encode_text(&Value::Json(serde_json::json!([1]))),
            Some(b"[1]".to_vec())
        );
    }
}
