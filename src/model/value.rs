use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{AdaptorError, AdaptorResult};
use crate::model::instance::{Instance, InstanceRef};
use crate::model::schema::{SchemaAttribute, ValueKind};

/// One typed attribute value.
#[derive(Clone)]
pub enum AttributeValue {
    Instance(InstanceRef),
    String(String),
    Integer(i32),
    Long(i64),
    Float(f64),
    Boolean(bool),
}

impl AttributeValue {
    /// Coerce a raw datastore/JSON value to the attribute's declared kind.
    ///
    /// Strings are parsed for numeric and boolean kinds so that values typed
    /// by a REST client (always strings) land with the right type.
    pub fn coerce(attribute: &SchemaAttribute, raw: &Value) -> AdaptorResult<Self> {
        let fail = || AdaptorError::TypeConversion {
            attribute: attribute.name.clone(),
            expected: attribute.kind.as_str().to_string(),
            value: raw.to_string(),
        };
        match attribute.kind {
            ValueKind::String => match raw {
                Value::String(s) => Ok(AttributeValue::String(s.clone())),
                Value::Number(n) => Ok(AttributeValue::String(n.to_string())),
                Value::Bool(b) => Ok(AttributeValue::String(b.to_string())),
                _ => Err(fail()),
            },
            ValueKind::Integer => match raw {
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .map(AttributeValue::Integer)
                    .ok_or_else(fail),
                Value::String(s) => s
                    .trim()
                    .parse::<i32>()
                    .map(AttributeValue::Integer)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueKind::Long => match raw {
                Value::Number(n) => n.as_i64().map(AttributeValue::Long).ok_or_else(fail),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(AttributeValue::Long)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueKind::Float => match raw {
                Value::Number(n) => n.as_f64().map(AttributeValue::Float).ok_or_else(fail),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(AttributeValue::Float)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueKind::Boolean => match raw {
                Value::Bool(b) => Ok(AttributeValue::Boolean(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(AttributeValue::Boolean(true)),
                    "false" => Ok(AttributeValue::Boolean(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            ValueKind::Instance => Err(fail()),
        }
    }

    /// Scalar JSON form of a primitive value; instances map to their DB_ID.
    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::Instance(i) => i.db_id().map(Value::from).unwrap_or(Value::Null),
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::Integer(v) => Value::from(*v),
            AttributeValue::Long(v) => Value::from(*v),
            AttributeValue::Float(v) => Value::from(*v),
            AttributeValue::Boolean(v) => Value::Bool(*v),
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceRef> {
        match self {
            AttributeValue::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Key used to count duplicate occurrences of a value.
    pub fn identity_key(&self) -> String {
        match self {
            AttributeValue::Instance(i) => match i.db_id() {
                Some(id) => format!("#{}", id),
                None => format!("@{:p}", Arc::as_ptr(i)),
            },
            other => other.to_json().to_string(),
        }
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttributeValue::Instance(a), AttributeValue::Instance(b)) => Instance::same(a, b),
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Integer(a), AttributeValue::Integer(b)) => a == b,
            (AttributeValue::Long(a), AttributeValue::Long(b)) => a == b,
            (AttributeValue::Float(a), AttributeValue::Float(b)) => a == b,
            (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Instances may be cyclic; print identity only
            AttributeValue::Instance(i) => {
                write!(f, "Instance({}:{:?})", i.class_name(), i.db_id())
            }
            AttributeValue::String(s) => write!(f, "{:?}", s),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Long(v) => write!(f, "{}L", v),
            AttributeValue::Float(v) => write!(f, "{}f", v),
            AttributeValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<InstanceRef> for AttributeValue {
    fn from(instance: InstanceRef) -> Self {
        AttributeValue::Instance(instance)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Long(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Boolean(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::Direction;
    use serde_json::json;

    fn attribute(kind: ValueKind) -> SchemaAttribute {
        SchemaAttribute {
            name: "releaseNumber".to_string(),
            origin: "_Release".to_string(),
            kind,
            multiple: false,
            direction: Direction::Outgoing,
            allowed_classes: vec![],
            defining: None,
        }
    }

    #[test]
    fn test_coerces_strings_to_declared_kind() {
        let v = AttributeValue::coerce(&attribute(ValueKind::Integer), &json!("87")).unwrap();
        assert_eq!(v, AttributeValue::Integer(87));
        let v = AttributeValue::coerce(&attribute(ValueKind::Long), &json!(" 5263598")).unwrap();
        assert_eq!(v, AttributeValue::Long(5263598));
        let v = AttributeValue::coerce(&attribute(ValueKind::Boolean), &json!("TRUE")).unwrap();
        assert_eq!(v, AttributeValue::Boolean(true));
    }

    #[test]
    fn test_conversion_failure_names_attribute() {
        let err =
            AttributeValue::coerce(&attribute(ValueKind::Long), &json!("R-HSA-1")).unwrap_err();
        match err {
            AdaptorError::TypeConversion { attribute, expected, .. } => {
                assert_eq!(attribute, "releaseNumber");
                assert_eq!(expected, "Long");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_integer_overflow_is_rejected() {
        let overflow = AttributeValue::coerce(&attribute(ValueKind::Integer), &json!(1_i64 << 40));
        assert!(overflow.is_err());
    }
}
