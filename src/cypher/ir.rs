//! Intermediate representation of the graph statements the adaptor issues.
//!
//! Backends either render these to Cypher text (`render`) or evaluate them
//! directly (the in-memory store).

use serde_json::Value;

use crate::model::schema::Direction;

/// `sK` bound by a request's relationship hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub rel: String,
    pub direction: Direction,
    pub var: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchClause {
    /// `MATCH (n:label)` optionally followed by `-[:rel]->(sK)`.
    Node { label: String, hop: Option<Hop> },
    /// `MATCH (var:label)-[:rel]->()`: the relationship exists on `var`.
    Exists {
        var: String,
        label: String,
        rel: String,
        direction: Direction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `=`
    Equals,
    /// `=~` (full regular-expression match)
    Matches,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Property { var: String, name: String },
    /// `toString(var.name)`
    Text { var: String, name: String },
}

impl Operand {
    pub fn property(var: &str, name: &str) -> Self {
        Operand::Property {
            var: var.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    IdIn { var: String, ids: Vec<i64> },
    IdEquals { var: String, id: i64 },
    /// `NOT (n)-[:rel]->()`
    NoRelationship { rel: String, direction: Direction },
    Compare {
        operand: Operand,
        comparison: Comparison,
        value: Value,
        negate: bool,
    },
    In {
        operand: Operand,
        values: Vec<Value>,
        negate: bool,
    },
    /// `[NOT] ANY(x IN n.property WHERE x <cmp> value)`
    AnyElement {
        property: String,
        comparison: Comparison,
        value: Value,
        negate: bool,
    },
    /// `[NOT] ANY(x IN n.property WHERE x IN values)`
    AnyElementIn {
        property: String,
        values: Vec<Value>,
        negate: bool,
    },
    IsNull { property: String },
    IsNotNull { property: String },
}

/// Conjunctive instance query; every clause binds the same result node `n`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceQuery {
    pub clauses: Vec<MatchClause>,
    pub filters: Vec<Filter>,
}

/// Shape of the rows returned for one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueShape {
    /// `(dbId, value)`
    Primitive,
    /// `(dbId, targetId, targetClass[, ord, stoichiometry])`
    Instance {
        target_label: String,
        direction: Direction,
        multiple: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadQuery {
    /// Rows: `(dbId, displayName, schemaClass)`
    Instances(InstanceQuery),
    /// Rows: `(dbId, displayName, schemaClass)`
    InstancesByClass { label: String, ids: Option<Vec<i64>> },
    /// Bulk (`id == None`) or single-instance attribute values.
    AttributeValues {
        label: String,
        id: Option<i64>,
        attribute: String,
        shape: ValueShape,
    },
    /// One row with a column per property.
    NodeProperties {
        label: String,
        id: i64,
        properties: Vec<String>,
    },
    /// Rows: `(dbId)` of `origin` nodes pointing at the target via `attribute`.
    Referrers {
        origin_label: String,
        attribute: String,
        target_label: String,
        id: i64,
    },
    /// Rows: `(dbId)` of nodes holding `values` exactly `count` times.
    IdsByValueCount {
        origin_label: String,
        attribute: String,
        instance_valued: bool,
        values: Vec<Value>,
        count: i64,
    },
    /// Rows: `(count)`
    ClassCount { label: String },
    /// Rows: `(schemaClass, count)`
    InstanceCounts,
    /// Rows: `(maxDbId)`
    MaxDbId,
    /// Rows: `(dbId)`
    ExistingIds {
        label: String,
        ids: Vec<i64>,
        inverse: bool,
    },
    /// Rows: `(schemaClass)`
    SchemaClassOf { id: i64 },
    /// Rows: `(timestamp)`
    SchemaTimestamp,
    /// Rows: `(dbId, residueId)` for every sequence-to-residue link.
    ModifiedResidues,
    /// Rows: `(identifier, dbId, oldIdentifier)` of stable identifiers whose
    /// `oldIdentifier` is shared with another one.
    DuplicateStableIdentifiers,
}

pub const COL_DB_ID: &str = "dbId";
pub const COL_DISPLAY_NAME: &str = "displayName";
pub const COL_SCHEMA_CLASS: &str = "schemaClass";

pub const EWAS_CLASS: &str = "EntityWithAccessionedSequence";
pub const HAS_MODIFIED_RESIDUE: &str = "hasModifiedResidue";
pub const STABLE_IDENTIFIER_CLASS: &str = "StableIdentifier";
pub const IDENTIFIER: &str = "identifier";
pub const OLD_IDENTIFIER: &str = "oldIdentifier";

impl ReadQuery {
    /// Column names, in row order.
    pub fn columns(&self) -> Vec<String> {
        let cols: Vec<&str> = match self {
            ReadQuery::Instances(_) | ReadQuery::InstancesByClass { .. } => {
                vec![COL_DB_ID, COL_DISPLAY_NAME, COL_SCHEMA_CLASS]
            }
            ReadQuery::AttributeValues { shape, .. } => match shape {
                ValueShape::Primitive => vec![COL_DB_ID, "value"],
                ValueShape::Instance { multiple: false, .. } => {
                    vec![COL_DB_ID, "targetId", "targetClass"]
                }
                ValueShape::Instance { multiple: true, .. } => {
                    vec![COL_DB_ID, "targetId", "targetClass", "ord", "stoichiometry"]
                }
            },
            ReadQuery::NodeProperties { properties, .. } => {
                return properties.clone();
            }
            ReadQuery::Referrers { .. }
            | ReadQuery::IdsByValueCount { .. }
            | ReadQuery::ExistingIds { .. } => vec![COL_DB_ID],
            ReadQuery::ClassCount { .. } => vec!["count"],
            ReadQuery::InstanceCounts => vec![COL_SCHEMA_CLASS, "count"],
            ReadQuery::MaxDbId => vec!["maxDbId"],
            ReadQuery::SchemaClassOf { .. } => vec![COL_SCHEMA_CLASS],
            ReadQuery::SchemaTimestamp => vec!["timestamp"],
            ReadQuery::ModifiedResidues => vec![COL_DB_ID, "residueId"],
            ReadQuery::DuplicateStableIdentifiers => {
                vec![IDENTIFIER, COL_DB_ID, OLD_IDENTIFIER]
            }
        };
        cols.into_iter().map(str::to_string).collect()
    }
}

pub const DB_ID_SEQUENCE: &str = "dbIdSeq";

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
    /// Atomically increment the named counter; returns the new value.
    MintId { key: String },
    /// Returns the new node's DB_ID.
    CreateNode {
        labels: Vec<String>,
        id: i64,
        class_name: String,
        display_name: Option<String>,
    },
    /// `Value::Null` removes the property. Returns the DB_ID.
    SetProperty {
        label: String,
        id: i64,
        property: String,
        value: Value,
    },
    /// Relationship from `from` to `to`, carrying `stoichiometry` and `order`.
    CreateRelationship {
        from_label: String,
        from_id: i64,
        to_label: String,
        to_id: i64,
        rel: String,
        stoichiometry: i64,
        order: i64,
    },
    DeleteRelationships {
        label: String,
        id: i64,
        rel: String,
        direction: Direction,
    },
    DetachDelete { label: String, id: i64 },
}

impl WriteStatement {
    /// Labels of the nodes whose stored values the statement changes.
    pub fn touched_labels(&self) -> Vec<&str> {
        match self {
            WriteStatement::MintId { .. } => vec![],
            WriteStatement::CreateNode { class_name, .. } => vec![class_name.as_str()],
            WriteStatement::SetProperty { label, .. }
            | WriteStatement::DeleteRelationships { label, .. }
            | WriteStatement::DetachDelete { label, .. } => vec![label.as_str()],
            WriteStatement::CreateRelationship {
                from_label, to_label, ..
            } => vec![from_label.as_str(), to_label.as_str()],
        }
    }
}
