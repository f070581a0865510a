use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AdaptorError, AdaptorResult};
use crate::model::instance::InstanceRef;
use crate::model::schema::{Schema, SchemaAttribute};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Like,
    NotLike,
    Regexp,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// Compiled to a regular-expression match (`=~`).
    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike | Operator::Regexp)
    }

    pub fn is_like(&self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike)
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, Operator::Ne | Operator::NotLike)
    }
}

impl FromStr for Operator {
    type Err = AdaptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        match normalized.as_str() {
            "=" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "LIKE" => Ok(Operator::Like),
            "NOT LIKE" => Ok(Operator::NotLike),
            "REGEXP" => Ok(Operator::Regexp),
            "IS NULL" => Ok(Operator::IsNull),
            "IS NOT NULL" => Ok(Operator::IsNotNull),
            _ => Err(AdaptorError::UnknownOperator(s.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::Regexp => "REGEXP",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum QueryValue {
    Null,
    /// String, number or boolean.
    Scalar(Value),
    Instance(InstanceRef),
    Collection(Vec<QueryValue>),
    SubQuery(Box<QueryRequest>),
}

impl QueryValue {
    pub fn string(s: impl Into<String>) -> Self {
        QueryValue::Scalar(Value::String(s.into()))
    }

    /// Null or the empty string.
    pub fn is_blank(&self) -> bool {
        match self {
            QueryValue::Null => true,
            QueryValue::Scalar(Value::String(s)) => s.is_empty(),
            QueryValue::Scalar(Value::Null) => true,
            _ => false,
        }
    }
}

impl From<Value> for QueryValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => QueryValue::Null,
            Value::Array(items) => {
                QueryValue::Collection(items.into_iter().map(QueryValue::from).collect())
            }
            other => QueryValue::Scalar(other),
        }
    }
}

/// One condition: instances of `class_name` whose `attribute` satisfies
/// `operator value`.
#[derive(Debug, Clone)]
pub struct AttributeQuery {
    pub class_name: String,
    pub attribute: Arc<SchemaAttribute>,
    pub operator: Operator,
    pub value: QueryValue,
}

/// A forward condition, or one traversing the attribute backwards: instances
/// of `class_name` that are *values* of `attribute` on some other node.
#[derive(Debug, Clone)]
pub enum QueryRequest {
    Attribute(AttributeQuery),
    Reverse(AttributeQuery),
}

impl QueryRequest {
    /// Resolve `class_name.attribute_name` against the schema.
    pub fn attribute(
        schema: &Schema,
        class_name: &str,
        attribute_name: &str,
        operator: Operator,
        value: QueryValue,
    ) -> AdaptorResult<Self> {
        let class = schema.class(class_name)?;
        let attribute = class.attribute_or_err(attribute_name)?.clone();
        Ok(QueryRequest::Attribute(AttributeQuery {
            class_name: class_name.to_string(),
            attribute,
            operator,
            value,
        }))
    }

    /// Build from an already resolved attribute, scoped to its origin class.
    pub fn for_attribute(
        attribute: Arc<SchemaAttribute>,
        operator: Operator,
        value: QueryValue,
    ) -> Self {
        QueryRequest::Attribute(AttributeQuery {
            class_name: attribute.origin.clone(),
            attribute,
            operator,
            value,
        })
    }

    /// `attribute_name` must be a referrer attribute of `class_name`.
    pub fn reverse(
        schema: &Schema,
        class_name: &str,
        attribute_name: &str,
        operator: Operator,
        value: QueryValue,
    ) -> AdaptorResult<Self> {
        let class = schema.class(class_name)?;
        let attribute = class
            .referrer(attribute_name)
            .ok_or_else(|| AdaptorError::InvalidAttribute {
                class: class_name.to_string(),
                attribute: attribute_name.to_string(),
            })?
            .clone();
        Ok(QueryRequest::Reverse(AttributeQuery {
            class_name: class_name.to_string(),
            attribute,
            operator,
            value,
        }))
    }

    pub fn query(&self) -> &AttributeQuery {
        match self {
            QueryRequest::Attribute(q) | QueryRequest::Reverse(q) => q,
        }
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, QueryRequest::Reverse(_))
    }

    pub fn operator(&self) -> Operator {
        self.query().operator
    }
}
