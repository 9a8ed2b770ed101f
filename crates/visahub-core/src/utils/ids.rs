//! The backend is inconsistent about identifiers: some endpoints send
//! numeric ids, others strings. Everything client-side is a `String`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Deserialize a required id given as either a string or a number.
pub fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_id(value).ok_or_else(|| serde::de::Error::custom("expected string or numeric id"))
}

/// Deserialize an optional id given as a string, a number, or null.
pub fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(value_to_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "id_string")]
        id: String,
        #[serde(default, deserialize_with = "opt_id_string")]
        other: Option<String>,
    }

    #[test]
    fn test_numeric_and_string_ids() {
        let s: Sample = serde_json::from_str(r#"{"id": 42, "other": "c-7"}"#).unwrap();
        assert_eq!(s.id, "42");
        assert_eq!(s.other.as_deref(), Some("c-7"));

        let s: Sample = serde_json::from_str(r#"{"id": "u-1"}"#).unwrap();
        assert_eq!(s.id, "u-1");
        assert_eq!(s.other, None);
    }

    #[test]
    fn test_rejects_non_scalar_id() {
        assert!(serde_json::from_str::<Sample>(r#"{"id": [1]}"#).is_err());
    }
}
