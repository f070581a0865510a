use serde_json::Value;

use super::ir::*;
use crate::error::{AdaptorError, AdaptorResult};
use crate::model::query::{AttributeQuery, Operator, QueryRequest, QueryValue};
use crate::model::schema::{SchemaAttribute, ValueKind, DB_ID, DISPLAY_NAME};
use crate::model::value::AttributeValue;

const LIKE_METACHARACTERS: &[char] = &['[', ']', '(', ')', '?', '+', '*', '.'];

/// Backslash-escape regex metacharacters in a LIKE literal.
pub fn escape_like(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if LIKE_METACHARACTERS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn comparison(operator: Operator) -> Comparison {
    if operator.is_pattern() {
        Comparison::Matches
    } else {
        Comparison::Equals
    }
}

/// Pattern operand for `=~`: LIKE values are escaped and wrapped in `.*`.
fn pattern_value(operator: Operator, value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if operator.is_like() && !text.is_empty() {
        Value::String(format!(".*{}.*", escape_like(&text)))
    } else {
        Value::String(text)
    }
}

fn coerce_scalar(attribute: &SchemaAttribute, value: &QueryValue) -> AdaptorResult<Value> {
    match value {
        QueryValue::Scalar(raw) => Ok(AttributeValue::coerce(attribute, raw)?.to_json()),
        other => Err(AdaptorError::TypeConversion {
            attribute: attribute.name.clone(),
            expected: attribute.kind.as_str().to_string(),
            value: format!("{:?}", other),
        }),
    }
}

/// Compile conjunctive requests into one query binding result node `n`.
pub fn compile_instance_query(requests: &[QueryRequest]) -> AdaptorResult<InstanceQuery> {
    let mut query = InstanceQuery::default();
    for (i, request) in requests.iter().enumerate() {
        let var = format!("s{}", i + 1);
        let q = request.query();
        if q.attribute.is_instance_type() {
            compile_instance_request(&mut query, q, request.is_reverse(), &var)?;
        } else {
            query.clauses.push(MatchClause::Node {
                label: q.class_name.clone(),
                hop: None,
            });
            compile_primitive_request(&mut query, q)?;
        }
    }
    log::debug!("compiled {} request(s): {:?}", requests.len(), query);
    Ok(query)
}

fn nested_exists(var: &str, nested: &QueryRequest) -> AdaptorResult<MatchClause> {
    let q = nested.query();
    if q.operator != Operator::IsNotNull {
        return Err(AdaptorError::UnsupportedSubQueryOperator(q.operator.to_string()));
    }
    if !q.attribute.is_instance_type() {
        return Err(AdaptorError::NotInstanceAttribute(q.attribute.name.clone()));
    }
    let direction = if nested.is_reverse() {
        q.attribute.direction.flip()
    } else {
        q.attribute.direction
    };
    Ok(MatchClause::Exists {
        var: var.to_string(),
        label: q.class_name.clone(),
        rel: q.attribute.name.clone(),
        direction,
    })
}

fn persisted_id(value: &QueryValue, attribute: &SchemaAttribute) -> AdaptorResult<i64> {
    match value {
        QueryValue::Instance(instance) => instance
            .db_id()
            .filter(|id| *id >= 0)
            .ok_or_else(|| AdaptorError::DbIdNotSet(instance.class_name())),
        QueryValue::Scalar(Value::Number(n)) => {
            n.as_i64().ok_or_else(|| AdaptorError::TypeConversion {
                attribute: attribute.name.clone(),
                expected: "Long".to_string(),
                value: n.to_string(),
            })
        }
        other => Err(AdaptorError::TypeConversion {
            attribute: attribute.name.clone(),
            expected: ValueKind::Instance.as_str().to_string(),
            value: format!("{:?}", other),
        }),
    }
}

fn compile_instance_request(
    query: &mut InstanceQuery,
    q: &AttributeQuery,
    reverse: bool,
    var: &str,
) -> AdaptorResult<()> {
    let attribute = &q.attribute;
    let direction = if reverse {
        attribute.direction.flip()
    } else {
        attribute.direction
    };
    let rel = attribute.name.clone();

    // A blank value with anything but IS NOT NULL asks for a missing relationship
    let absent = q.operator == Operator::IsNull
        || (q.value.is_blank() && q.operator != Operator::IsNotNull);
    if absent {
        query.clauses.push(MatchClause::Node {
            label: q.class_name.clone(),
            hop: None,
        });
        query.filters.push(Filter::NoRelationship { rel, direction });
        return Ok(());
    }

    query.clauses.push(MatchClause::Node {
        label: q.class_name.clone(),
        hop: Some(Hop {
            rel,
            direction,
            var: var.to_string(),
        }),
    });

    match &q.value {
        QueryValue::Null => {}
        QueryValue::Collection(items) => {
            let mut ids = Vec::new();
            let mut nested = Vec::new();
            for item in items {
                match item {
                    QueryValue::SubQuery(sub) => nested.push(nested_exists(var, sub)?),
                    other => ids.push(persisted_id(other, attribute)?),
                }
                if !ids.is_empty() && !nested.is_empty() {
                    return Err(AdaptorError::InconsistentCollection);
                }
            }
            if !ids.is_empty() {
                query.filters.push(Filter::IdIn {
                    var: var.to_string(),
                    ids,
                });
            }
            query.clauses.extend(nested);
        }
        QueryValue::SubQuery(sub) => query.clauses.push(nested_exists(var, sub)?),
        QueryValue::Scalar(Value::String(text)) => {
            let value = if q.operator.is_pattern() {
                pattern_value(q.operator, &Value::String(text.clone()))
            } else {
                Value::String(text.clone())
            };
            query.filters.push(Filter::Compare {
                operand: Operand::property(var, DISPLAY_NAME),
                comparison: comparison(q.operator),
                value,
                negate: q.operator.is_negated(),
            });
        }
        value @ (QueryValue::Instance(_) | QueryValue::Scalar(_)) => {
            let id = persisted_id(value, attribute)?;
            let filter = if q.operator.is_negated() {
                Filter::Compare {
                    operand: Operand::property(var, DB_ID),
                    comparison: Comparison::Equals,
                    value: Value::from(id),
                    negate: true,
                }
            } else {
                Filter::IdEquals {
                    var: var.to_string(),
                    id,
                }
            };
            query.filters.push(filter);
        }
    }
    Ok(())
}

fn compile_primitive_request(query: &mut InstanceQuery, q: &AttributeQuery) -> AdaptorResult<()> {
    let attribute = &q.attribute;
    let property = attribute.name.clone();
    match q.operator {
        Operator::IsNull => {
            query.filters.push(Filter::IsNull { property });
            return Ok(());
        }
        Operator::IsNotNull => {
            query.filters.push(Filter::IsNotNull { property });
            return Ok(());
        }
        _ => {}
    }
    if matches!(q.value, QueryValue::Null | QueryValue::Scalar(Value::Null)) {
        // `= null` and `!= null` mean the property is (not) set
        let filter = if q.operator.is_negated() {
            Filter::IsNotNull { property }
        } else {
            Filter::IsNull { property }
        };
        query.filters.push(filter);
        return Ok(());
    }

    if let QueryValue::Collection(items) = &q.value {
        let values = items
            .iter()
            .map(|item| coerce_scalar(attribute, item))
            .collect::<AdaptorResult<Vec<_>>>()?;
        let filter = if attribute.multiple {
            Filter::AnyElementIn {
                property,
                values,
                negate: q.operator.is_negated(),
            }
        } else {
            Filter::In {
                operand: Operand::property("n", &property),
                values,
                negate: q.operator.is_negated(),
            }
        };
        query.filters.push(filter);
        return Ok(());
    }

    let value = match &q.value {
        QueryValue::Scalar(raw) if q.operator.is_pattern() => pattern_value(q.operator, raw),
        other => coerce_scalar(attribute, other)?,
    };
    let negate = q.operator.is_negated();
    let filter = if attribute.multiple {
        Filter::AnyElement {
            property,
            comparison: comparison(q.operator),
            value,
            negate,
        }
    } else {
        let operand = if q.operator.is_pattern() && attribute.kind != ValueKind::String {
            Operand::Text {
                var: "n".to_string(),
                name: property,
            }
        } else {
            Operand::property("n", &property)
        };
        Filter::Compare {
            operand,
            comparison: comparison(q.operator),
            value,
            negate,
        }
    };
    query.filters.push(filter);
    Ok(())
}
