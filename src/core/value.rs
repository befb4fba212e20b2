// Typed cell values and their transport form (display string computed eagerly).
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable form; empty for NULL.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(value) => value.to_string(),
            Value::SmallInt(value) => value.to_string(),
            Value::Int(value) => value.to_string(),
            Value::BigInt(value) => value.to_string(),
            Value::Double(value) => value.to_string(),
            Value::Text(value) => value.clone(),
            Value::Bytes(value) => format!("0x{}", hex::encode(value)),
            Value::Json(value) => value.to_string(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(value) => Some(i64::from(*value)),
            Value::Int(value) => Some(i64::from(*value)),
            Value::BigInt(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(value) => Some(*value),
            other => other.as_i64().map(|value| value as f64),
        }
    }

    /// Raw JSON form used by the JSON exporter and CLI output.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::SmallInt(value) => JsonValue::from(*value),
            Value::Int(value) => JsonValue::from(*value),
            Value::BigInt(value) => JsonValue::from(*value),
            Value::Double(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(value.to_string())),
            Value::Text(value) => JsonValue::String(value.clone()),
            Value::Bytes(_) => JsonValue::String(self.display()),
            Value::Json(value) => value.clone(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One value of a materialized row as handed to transport layers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellValue {
    pub display_value: String,
    pub is_null: bool,
    pub row_id: u64,
    #[serde(skip)]
    pub raw: Value,
}

impl CellValue {
    pub fn new(raw: Value, row_id: u64) -> Self {
        Self {
            display_value: raw.display(),
            is_null: raw.is_null(),
            row_id,
            raw,
        }
    }
}

pub(crate) fn cells_from_values(values: Vec<Value>, row_id: u64) -> Vec<CellValue> {
    values
        .into_iter()
        .map(|value| CellValue::new(value, row_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{CellValue, Value};
    use serde_json::json;

    #[test]
    fn display_strings() {
        assert_eq!(Value::Null.display(), "");
        assert_eq!(Value::Bool(true).display(), "true");
        assert_eq!(Value::Double(1.5).display(), "1.5");
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).display(), "0xdead");
        assert_eq!(Value::Json(json!({"a": [1, 2]})).display(), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn null_cell_has_empty_display() {
        let cell = CellValue::new(Value::Null, 7);
        assert!(cell.is_null);
        assert_eq!(cell.display_value, "");
        assert_eq!(cell.row_id, 7);
    }

    #[test]
    fn json_form_keeps_types() {
        assert_eq!(Value::BigInt(5).to_json(), json!(5));
        assert_eq!(Value::Double(f64::NAN).to_json(), json!("NaN"));
        assert_eq!(Value::Text("x".into()).to_json(), json!("x"));
    }
}
