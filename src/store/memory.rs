//! In-process graph backend.
//!
//! Evaluates the statement IR directly against a small property graph. Used by
//! the test suite, the demo seed and local development without Neo4j.

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cypher::*;
use crate::error::StoreError;
use crate::model::schema::{Direction, DB_ID, DISPLAY_NAME, SCHEMA_CLASS};
use crate::store::traits::{GraphStore, GraphTransaction, Row, StoreResult};

#[derive(Debug, Clone, Default)]
struct Node {
    labels: BTreeSet<String>,
    props: BTreeMap<String, Value>,
}

impl Node {
    fn prop(&self, name: &str) -> Value {
        self.props.get(name).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
struct Relationship {
    from: i64,
    to: i64,
    kind: String,
    stoichiometry: i64,
    order: i64,
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: BTreeMap<i64, Node>,
    rels: Vec<Relationship>,
}

impl GraphData {
    fn labelled(&self, label: &str, id: i64) -> Option<&Node> {
        self.nodes.get(&id).filter(|n| n.labels.contains(label))
    }

    /// `(neighbour, relationship)` pairs reachable from `id` in `direction`.
    fn neighbours<'a>(
        &'a self,
        id: i64,
        kind: &'a str,
        direction: Direction,
    ) -> impl Iterator<Item = (i64, &'a Relationship)> + 'a {
        self.rels.iter().filter_map(move |r| {
            if r.kind != kind {
                return None;
            }
            match direction {
                Direction::Outgoing if r.from == id => Some((r.to, r)),
                Direction::Incoming if r.to == id => Some((r.from, r)),
                _ => None,
            }
        })
    }

    fn apply(&mut self, statement: &WriteStatement) -> Option<Value> {
        match statement {
            WriteStatement::MintId { .. } => None,
            WriteStatement::CreateNode {
                labels,
                id,
                class_name,
                display_name,
            } => {
                let mut node = Node {
                    labels: labels.iter().cloned().collect(),
                    props: BTreeMap::new(),
                };
                node.props.insert(DB_ID.to_string(), Value::from(*id));
                node.props
                    .insert(SCHEMA_CLASS.to_string(), Value::from(class_name.clone()));
                if let Some(name) = display_name {
                    node.props
                        .insert(DISPLAY_NAME.to_string(), Value::from(name.clone()));
                }
                self.nodes.insert(*id, node);
                Some(Value::from(*id))
            }
            WriteStatement::SetProperty {
                label,
                id,
                property,
                value,
            } => {
                let node = self.nodes.get_mut(id).filter(|n| n.labels.contains(label))?;
                if value.is_null() {
                    node.props.remove(property);
                } else {
                    node.props.insert(property.clone(), value.clone());
                }
                Some(Value::from(*id))
            }
            WriteStatement::CreateRelationship {
                from_label,
                from_id,
                to_label,
                to_id,
                rel,
                stoichiometry,
                order,
            } => {
                self.labelled(from_label, *from_id)?;
                self.labelled(to_label, *to_id)?;
                self.rels.push(Relationship {
                    from: *from_id,
                    to: *to_id,
                    kind: rel.clone(),
                    stoichiometry: *stoichiometry,
                    order: *order,
                });
                Some(Value::from(*from_id))
            }
            WriteStatement::DeleteRelationships {
                label,
                id,
                rel,
                direction,
            } => {
                self.labelled(label, *id)?;
                self.rels.retain(|r| {
                    let end = match direction {
                        Direction::Outgoing => r.from,
                        Direction::Incoming => r.to,
                    };
                    !(r.kind == *rel && end == *id)
                });
                None
            }
            WriteStatement::DetachDelete { label, id } => {
                self.labelled(label, *id)?;
                self.nodes.remove(id);
                self.rels.retain(|r| r.from != *id && r.to != *id);
                None
            }
        }
    }
}

struct Shared {
    graph: RwLock<GraphData>,
    sequences: Mutex<HashMap<String, i64>>,
    schema_timestamp: RwLock<Option<String>>,
    failures: Mutex<VecDeque<StoreError>>,
    reads: Mutex<Vec<ReadQuery>>,
    closed: AtomicBool,
}

/// Thread-safe in-memory graph; clones share the same data.
#[derive(Clone)]
pub struct MemoryGraphStore {
    shared: Arc<Shared>,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    /// An empty graph with the DB_ID sequence at zero.
    pub fn new() -> Self {
        let mut sequences = HashMap::new();
        sequences.insert(DB_ID_SEQUENCE.to_string(), 0);
        Self {
            shared: Arc::new(Shared {
                graph: RwLock::new(GraphData::default()),
                sequences: Mutex::new(sequences),
                schema_timestamp: RwLock::new(None),
                failures: Mutex::new(VecDeque::new()),
                reads: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_schema_timestamp(&self, timestamp: Option<String>) {
        *self.shared.schema_timestamp.write() = timestamp;
    }

    /// Make the next write statements fail with the given errors, in order.
    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.shared.failures.lock().extend(errors);
    }

    /// Every read executed so far.
    pub fn reads(&self) -> Vec<ReadQuery> {
        self.shared.reads.lock().clone()
    }

    pub fn node_count(&self) -> usize {
        self.shared.graph.read().nodes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> StoreResult<()> {
        match self.shared.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mint(&self, key: &str) -> Option<Value> {
        let mut sequences = self.shared.sequences.lock();
        let counter = sequences.get_mut(key)?;
        *counter += 1;
        Some(Value::from(*counter))
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryGraphStore {
    async fn query(&self, _database: &str, query: &ReadQuery) -> StoreResult<Vec<Row>> {
        self.shared.reads.lock().push(query.clone());
        let timestamp = self.shared.schema_timestamp.read().clone();
        let graph = self.shared.graph.read();
        evaluate(&graph, timestamp, query)
    }

    async fn begin(&self, _database: &str) -> StoreResult<Box<dyn GraphTransaction>> {
        if self.is_closed() {
            return Err(StoreError::Connection("store is closed".to_string()));
        }
        let working = self.shared.graph.read().clone();
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            working,
            log: Vec::new(),
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Applies statements to a private copy and replays them on commit.
struct MemoryTransaction {
    store: MemoryGraphStore,
    working: GraphData,
    log: Vec<WriteStatement>,
}

#[async_trait::async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn run(&mut self, statement: &WriteStatement) -> StoreResult<Option<Value>> {
        self.store.take_failure()?;
        if let WriteStatement::MintId { key } = statement {
            return Ok(self.store.mint(key));
        }
        let result = self.working.apply(statement);
        self.log.push(statement.clone());
        Ok(result)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut graph = self.store.shared.graph.write();
        for statement in &self.log {
            graph.apply(statement);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

// ---- Read evaluation ----

fn id_row(id: i64) -> Row {
    vec![Value::from(id)]
}

fn instance_row(id: i64, node: &Node) -> Row {
    vec![Value::from(id), node.prop(DISPLAY_NAME), node.prop(SCHEMA_CLASS)]
}

fn labelled<'a>(
    graph: &'a GraphData,
    label: &'a str,
) -> impl Iterator<Item = (i64, &'a Node)> + 'a {
    graph
        .nodes
        .iter()
        .filter(move |(_, n)| n.labels.contains(label))
        .map(|(id, n)| (*id, n))
}

fn evaluate(
    graph: &GraphData,
    timestamp: Option<String>,
    query: &ReadQuery,
) -> StoreResult<Vec<Row>> {
    let rows = match query {
        ReadQuery::Instances(q) => evaluate_instance_query(graph, q)?,
        ReadQuery::InstancesByClass { label, ids } => labelled(graph, label)
            .filter(|(id, _)| ids.as_ref().map(|ids| ids.contains(id)).unwrap_or(true))
            .map(|(id, n)| instance_row(id, n))
            .collect(),
        ReadQuery::AttributeValues {
            label,
            id,
            attribute,
            shape,
        } => {
            let mut rows = Vec::new();
            let nodes = labelled(graph, label).filter(|(i, _)| id.map(|x| x == *i).unwrap_or(true));
            for (node_id, node) in nodes {
                match shape {
                    ValueShape::Primitive => {
                        let value = node.prop(attribute);
                        if !value.is_null() {
                            rows.push(vec![Value::from(node_id), value]);
                        }
                    }
                    ValueShape::Instance {
                        target_label,
                        direction,
                        multiple,
                    } => {
                        for (target, rel) in graph.neighbours(node_id, attribute, *direction) {
                            let Some(target_node) = graph.labelled(target_label, target) else {
                                continue;
                            };
                            let mut row = vec![
                                Value::from(node_id),
                                Value::from(target),
                                target_node.prop(SCHEMA_CLASS),
                            ];
                            if *multiple {
                                row.push(Value::from(rel.order));
                                row.push(Value::from(rel.stoichiometry));
                            }
                            rows.push(row);
                        }
                    }
                }
            }
            rows
        }
        ReadQuery::NodeProperties {
            label,
            id,
            properties,
        } => match graph.labelled(label, *id) {
            Some(node) => vec![properties.iter().map(|p| node.prop(p)).collect()],
            None => vec![],
        },
        ReadQuery::Referrers {
            origin_label,
            attribute,
            target_label,
            id,
        } => {
            if graph.labelled(target_label, *id).is_none() {
                return Ok(vec![]);
            }
            let referrers: BTreeSet<i64> = graph
                .neighbours(*id, attribute, Direction::Incoming)
                .map(|(from, _)| from)
                .filter(|from| graph.labelled(origin_label, *from).is_some())
                .collect();
            referrers.into_iter().map(id_row).collect()
        }
        ReadQuery::IdsByValueCount {
            origin_label,
            attribute,
            instance_valued: true,
            values,
            count,
        } => {
            let mut occurrences: BTreeMap<(i64, i64), i64> = BTreeMap::new();
            for (node_id, _) in labelled(graph, origin_label) {
                for (target, rel) in graph.neighbours(node_id, attribute, Direction::Outgoing) {
                    if values.iter().any(|v| values_equal(v, &Value::from(target))) {
                        *occurrences.entry((node_id, target)).or_default() += rel.stoichiometry;
                    }
                }
            }
            let ids: BTreeSet<i64> = occurrences
                .into_iter()
                .filter(|(_, n)| n == count)
                .map(|((node_id, _), _)| node_id)
                .collect();
            ids.into_iter().map(id_row).collect()
        }
        ReadQuery::IdsByValueCount {
            origin_label,
            attribute,
            instance_valued: false,
            values,
            count,
        } => labelled(graph, origin_label)
            .filter(|(_, node)| {
                let n = elements(&node.prop(attribute))
                    .iter()
                    .filter(|e| values.iter().any(|v| values_equal(v, e)))
                    .count() as i64;
                n == *count
            })
            .map(|(id, _)| id_row(id))
            .collect(),
        ReadQuery::ClassCount { label } => {
            vec![vec![Value::from(labelled(graph, label).count() as i64)]]
        }
        ReadQuery::InstanceCounts => {
            let mut counts: BTreeMap<String, i64> = BTreeMap::new();
            for node in graph.nodes.values() {
                if let Value::String(class) = node.prop(SCHEMA_CLASS) {
                    *counts.entry(class).or_default() += 1;
                }
            }
            counts
                .into_iter()
                .map(|(class, n)| vec![Value::from(class), Value::from(n)])
                .collect()
        }
        ReadQuery::MaxDbId => {
            let max = graph.nodes.keys().max().map(|id| Value::from(*id));
            vec![vec![max.unwrap_or(Value::Null)]]
        }
        ReadQuery::ExistingIds { label, ids, inverse } => labelled(graph, label)
            .filter(|(id, _)| ids.contains(id) != *inverse)
            .map(|(id, _)| id_row(id))
            .collect(),
        ReadQuery::SchemaClassOf { id } => match graph.nodes.get(id) {
            Some(node) => vec![vec![node.prop(SCHEMA_CLASS)]],
            None => vec![],
        },
        ReadQuery::SchemaTimestamp => match timestamp {
            Some(ts) => vec![vec![Value::from(ts)]],
            None => vec![],
        },
        ReadQuery::ModifiedResidues => labelled(graph, EWAS_CLASS)
            .flat_map(|(id, _)| {
                graph
                    .neighbours(id, HAS_MODIFIED_RESIDUE, Direction::Outgoing)
                    .map(move |(residue, _)| vec![Value::from(id), Value::from(residue)])
            })
            .collect(),
        ReadQuery::DuplicateStableIdentifiers => {
            let shared = labelled(graph, STABLE_IDENTIFIER_CLASS)
                .map(|(_, n)| n.prop(OLD_IDENTIFIER))
                .filter(|old| !old.is_null())
                .map(|old| old.to_string())
                .counts();
            labelled(graph, STABLE_IDENTIFIER_CLASS)
                .filter(|(_, n)| {
                    let old = n.prop(OLD_IDENTIFIER);
                    !old.is_null() && shared.get(&old.to_string()).is_some_and(|c| *c > 1)
                })
                .map(|(id, n)| vec![n.prop(IDENTIFIER), Value::from(id), n.prop(OLD_IDENTIFIER)])
                .collect()
        }
    };
    Ok(rows)
}

type Bindings = HashMap<String, i64>;

fn evaluate_instance_query(graph: &GraphData, query: &InstanceQuery) -> StoreResult<Vec<Row>> {
    let patterns = compile_patterns(&query.filters)?;
    let mut matched = BTreeSet::new();
    'nodes: for (&id, _) in graph.nodes.iter() {
        let mut envs: Vec<Bindings> = vec![HashMap::new()];
        for clause in &query.clauses {
            envs = extend(graph, id, clause, envs);
            if envs.is_empty() {
                continue 'nodes;
            }
        }
        for env in &envs {
            let mut ok = true;
            for filter in &query.filters {
                if !test_filter(graph, id, env, filter, &patterns)? {
                    ok = false;
                    break;
                }
            }
            if ok {
                matched.insert(id);
                continue 'nodes;
            }
        }
    }
    Ok(matched
        .into_iter()
        .filter_map(|id| graph.nodes.get(&id).map(|n| instance_row(id, n)))
        .collect())
}

fn extend(graph: &GraphData, id: i64, clause: &MatchClause, envs: Vec<Bindings>) -> Vec<Bindings> {
    match clause {
        MatchClause::Node { label, hop } => {
            if graph.labelled(label, id).is_none() {
                return vec![];
            }
            let Some(hop) = hop else {
                return envs;
            };
            let mut out = Vec::new();
            for env in envs {
                for (target, _) in graph.neighbours(id, &hop.rel, hop.direction) {
                    match env.get(&hop.var) {
                        Some(bound) if *bound != target => {}
                        _ => {
                            let mut next = env.clone();
                            next.insert(hop.var.clone(), target);
                            out.push(next);
                        }
                    }
                }
            }
            out
        }
        MatchClause::Exists {
            var,
            label,
            rel,
            direction,
        } => envs
            .into_iter()
            .filter(|env| match env.get(var) {
                Some(bound) => {
                    graph.labelled(label, *bound).is_some()
                        && graph.neighbours(*bound, rel, *direction).next().is_some()
                }
                None => false,
            })
            .collect(),
    }
}

/// Pattern strings compiled once per query, anchored for a full match.
fn compile_patterns(filters: &[Filter]) -> StoreResult<HashMap<String, Regex>> {
    let mut out = HashMap::new();
    for filter in filters {
        let pattern = match filter {
            Filter::Compare {
                comparison: Comparison::Matches,
                value: Value::String(p),
                ..
            }
            | Filter::AnyElement {
                comparison: Comparison::Matches,
                value: Value::String(p),
                ..
            } => p,
            _ => continue,
        };
        if !out.contains_key(pattern) {
            let regex = Regex::new(&format!("^(?:{})$", pattern))
                .map_err(|e| StoreError::Statement(format!("invalid pattern {}: {}", pattern, e)))?;
            out.insert(pattern.clone(), regex);
        }
    }
    Ok(out)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn text(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

fn elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => vec![],
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn compare(
    left: &Value,
    comparison: Comparison,
    right: &Value,
    patterns: &HashMap<String, Regex>,
) -> bool {
    match comparison {
        Comparison::Equals => values_equal(left, right),
        Comparison::Matches => match (left, right) {
            (Value::String(s), Value::String(p)) => {
                patterns.get(p).map(|re| re.is_match(s)).unwrap_or(false)
            }
            _ => false,
        },
    }
}

/// Missing properties make a predicate null, which filters the row out
/// whether or not the predicate is negated.
fn test_filter(
    graph: &GraphData,
    id: i64,
    env: &Bindings,
    filter: &Filter,
    patterns: &HashMap<String, Regex>,
) -> StoreResult<bool> {
    let bound = |var: &str| -> Option<i64> {
        if var == "n" {
            Some(id)
        } else {
            env.get(var).copied()
        }
    };
    let operand_value = |operand: &Operand| -> Value {
        let (var, name, as_text) = match operand {
            Operand::Property { var, name } => (var, name, false),
            Operand::Text { var, name } => (var, name, true),
        };
        let value = bound(var)
            .and_then(|i| graph.nodes.get(&i))
            .map(|n| n.prop(name))
            .unwrap_or(Value::Null);
        if as_text {
            text(&value)
        } else {
            value
        }
    };
    let node = graph.nodes.get(&id);
    let prop = |name: &str| node.map(|n| n.prop(name)).unwrap_or(Value::Null);

    let result = match filter {
        Filter::IdIn { var, ids } => bound(var).map(|i| ids.contains(&i)).unwrap_or(false),
        Filter::IdEquals { var, id: expected } => bound(var) == Some(*expected),
        Filter::NoRelationship { rel, direction } => {
            graph.neighbours(id, rel, *direction).next().is_none()
        }
        Filter::Compare {
            operand,
            comparison,
            value,
            negate,
        } => {
            let left = operand_value(operand);
            if left.is_null() {
                false
            } else {
                compare(&left, *comparison, value, patterns) != *negate
            }
        }
        Filter::In {
            operand,
            values,
            negate,
        } => {
            let left = operand_value(operand);
            if left.is_null() {
                false
            } else {
                values.iter().any(|v| values_equal(&left, v)) != *negate
            }
        }
        Filter::AnyElement {
            property,
            comparison,
            value,
            negate,
        } => {
            let list = prop(property);
            if list.is_null() {
                false
            } else {
                elements(&list)
                    .iter()
                    .any(|e| compare(e, *comparison, value, patterns))
                    != *negate
            }
        }
        Filter::AnyElementIn {
            property,
            values,
            negate,
        } => {
            let list = prop(property);
            if list.is_null() {
                false
            } else {
                elements(&list)
                    .iter()
                    .any(|e| values.iter().any(|v| values_equal(e, v)))
                    != *negate
            }
        }
        Filter::IsNull { property } => prop(property).is_null(),
        Filter::IsNotNull { property } => !prop(property).is_null(),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn create(store: &MemoryGraphStore, id: i64, class: &str, names: Value) {
        let mut tx = store.begin("graph.db").await.unwrap();
        tx.run(&WriteStatement::CreateNode {
            labels: vec![class.to_string(), "DatabaseObject".to_string()],
            id,
            class_name: class.to_string(),
            display_name: Some(format!("{}-{}", class, id)),
        })
        .await
        .unwrap();
        tx.run(&WriteStatement::SetProperty {
            label: class.to_string(),
            id,
            property: "name".to_string(),
            value: names,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    fn name_query(comparison: Comparison, value: Value, negate: bool) -> ReadQuery {
        ReadQuery::Instances(InstanceQuery {
            clauses: vec![MatchClause::Node {
                label: "Pathway".to_string(),
                hop: None,
            }],
            filters: vec![Filter::AnyElement {
                property: "name".to_string(),
                comparison,
                value,
                negate,
            }],
        })
    }

    #[tokio::test]
    async fn test_writes_are_invisible_until_commit() {
        let store = MemoryGraphStore::new();
        let mut tx = store.begin("graph.db").await.unwrap();
        let id = tx
            .run(&WriteStatement::CreateNode {
                labels: vec!["Pathway".to_string()],
                id: 1,
                class_name: "Pathway".to_string(),
                display_name: None,
            })
            .await
            .unwrap();
        assert_eq!(id, Some(json!(1)));
        assert_eq!(store.node_count(), 0);
        tx.rollback().await.unwrap();
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_any_element_negation() {
        let store = MemoryGraphStore::new();
        create(&store, 1, "Pathway", json!(["Y", "Z"])).await;
        create(&store, 2, "Pathway", json!(["X", "Z"])).await;
        create(&store, 3, "Pathway", Value::Null).await;

        let rows = store
            .query("graph.db", &name_query(Comparison::Matches, json!(".*X.*"), true))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!(1));

        let rows = store
            .query("graph.db", &name_query(Comparison::Equals, json!("Z"), false))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_any_element_in_negation() {
        let store = MemoryGraphStore::new();
        create(&store, 1, "Pathway", json!(["Apoptosis", "Programmed cell death"])).await;
        create(&store, 2, "Pathway", json!(["Glycolysis"])).await;
        create(&store, 3, "Pathway", Value::Null).await;

        let in_query = |negate: bool| {
            ReadQuery::Instances(InstanceQuery {
                clauses: vec![MatchClause::Node {
                    label: "Pathway".to_string(),
                    hop: None,
                }],
                filters: vec![Filter::AnyElementIn {
                    property: "name".to_string(),
                    values: vec![json!("Apoptosis")],
                    negate,
                }],
            })
        };
        let rows = store.query("graph.db", &in_query(false)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!(1));

        let rows = store.query("graph.db", &in_query(true)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!(2));
    }

    #[tokio::test]
    async fn test_mint_increments_sequence() {
        let store = MemoryGraphStore::new();
        let mut tx = store.begin("graph.db").await.unwrap();
        let mint = WriteStatement::MintId {
            key: DB_ID_SEQUENCE.to_string(),
        };
        assert_eq!(tx.run(&mint).await.unwrap(), Some(json!(1)));
        assert_eq!(tx.run(&mint).await.unwrap(), Some(json!(2)));
        let unknown = WriteStatement::MintId {
            key: "other".to_string(),
        };
        assert_eq!(tx.run(&unknown).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = MemoryGraphStore::new();
        store.fail_next_writes([StoreError::Deadlock("lock".into())]);
        let mut tx = store.begin("graph.db").await.unwrap();
        let mint = WriteStatement::MintId {
            key: DB_ID_SEQUENCE.to_string(),
        };
        assert!(tx.run(&mint).await.unwrap_err().is_deadlock());
        assert!(tx.run(&mint).await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_delete_removes_relationships() {
        let store = MemoryGraphStore::new();
        create(&store, 1, "Pathway", json!(["A"])).await;
        create(&store, 2, "Pathway", json!(["B"])).await;
        let mut tx = store.begin("graph.db").await.unwrap();
        tx.run(&WriteStatement::CreateRelationship {
            from_label: "Pathway".to_string(),
            from_id: 1,
            to_label: "Pathway".to_string(),
            to_id: 2,
            rel: "hasEvent".to_string(),
            stoichiometry: 1,
            order: 0,
        })
        .await
        .unwrap();
        tx.run(&WriteStatement::DetachDelete {
            label: "Pathway".to_string(),
            id: 2,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let referrers = store
            .query(
                "graph.db",
                &ReadQuery::Referrers {
                    origin_label: "Pathway".to_string(),
                    attribute: "hasEvent".to_string(),
                    target_label: "Pathway".to_string(),
                    id: 2,
                },
            )
            .await
            .unwrap();
        assert!(referrers.is_empty());
        assert_eq!(store.node_count(), 1);
    }

    async fn stable_identifier(store: &MemoryGraphStore, id: i64, identifier: &str, old: Value) {
        let mut tx = store.begin("graph.db").await.unwrap();
        tx.run(&WriteStatement::CreateNode {
            labels: vec![STABLE_IDENTIFIER_CLASS.to_string()],
            id,
            class_name: STABLE_IDENTIFIER_CLASS.to_string(),
            display_name: Some(identifier.to_string()),
        })
        .await
        .unwrap();
        for (property, value) in [(IDENTIFIER, json!(identifier)), (OLD_IDENTIFIER, old)] {
            tx.run(&WriteStatement::SetProperty {
                label: STABLE_IDENTIFIER_CLASS.to_string(),
                id,
                property: property.to_string(),
                value,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_stable_identifiers() {
        let store = MemoryGraphStore::new();
        stable_identifier(&store, 1, "R-HSA-1", json!("REACT_1")).await;
        stable_identifier(&store, 2, "R-HSA-2", json!("REACT_2")).await;
        stable_identifier(&store, 3, "R-HSA-3", json!("REACT_1")).await;
        stable_identifier(&store, 4, "R-HSA-4", Value::Null).await;
        stable_identifier(&store, 5, "R-HSA-5", Value::Null).await;

        let rows = store
            .query("graph.db", &ReadQuery::DuplicateStableIdentifiers)
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![json!("R-HSA-1"), json!(1), json!("REACT_1")],
                vec![json!("R-HSA-3"), json!(3), json!("REACT_1")],
            ]
        );
    }

    #[tokio::test]
    async fn test_modified_residues_follow_sequence_links_only() {
        let store = MemoryGraphStore::new();
        create(&store, 1, EWAS_CLASS, json!(["TP53"])).await;
        create(&store, 2, "ModifiedResidue", json!(["phospho-Ser15"])).await;
        create(&store, 3, "ModifiedResidue", json!(["acetyl-Lys120"])).await;
        create(&store, 4, "Complex", json!(["TP53 tetramer"])).await;
        let mut tx = store.begin("graph.db").await.unwrap();
        for (from, from_label, to) in [(1, EWAS_CLASS, 2), (1, EWAS_CLASS, 3), (4, "Complex", 3)] {
            tx.run(&WriteStatement::CreateRelationship {
                from_label: from_label.to_string(),
                from_id: from,
                to_label: "ModifiedResidue".to_string(),
                to_id: to,
                rel: HAS_MODIFIED_RESIDUE.to_string(),
                stoichiometry: 1,
                order: 0,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let rows = store.query("graph.db", &ReadQuery::ModifiedResidues).await.unwrap();
        assert_eq!(rows, vec![vec![json!(1), json!(2)], vec![json!(1), json!(3)]]);
    }
}
