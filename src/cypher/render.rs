use serde_json::Value;
use std::collections::BTreeMap;

use super::ir::*;
use crate::model::schema::{Direction, DB_ID, DISPLAY_NAME, SCHEMA_CLASS};

/// Cypher text plus its named parameters (`$p1`, `$p2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: BTreeMap<String, Value>,
}

#[derive(Default)]
struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    fn bind(&mut self, value: impl Into<Value>) -> String {
        let name = format!("p{}", self.values.len() + 1);
        self.values.insert(name.clone(), value.into());
        format!("${}", name)
    }
}

/// `(a)-[spec]->(b)` or `(a)<-[spec]-(b)`.
fn pattern(from: &str, rel: &str, direction: Direction, to: &str) -> String {
    match direction {
        Direction::Outgoing => format!("({})-[{}]->({})", from, rel, to),
        Direction::Incoming => format!("({})<-[{}]-({})", from, rel, to),
    }
}

fn cmp_op(comparison: Comparison) -> &'static str {
    match comparison {
        Comparison::Equals => "=",
        Comparison::Matches => "=~",
    }
}

fn operand(op: &Operand) -> String {
    match op {
        Operand::Property { var, name } => format!("{}.{}", var, name),
        Operand::Text { var, name } => format!("toString({}.{})", var, name),
    }
}

fn negated(negate: bool, predicate: String) -> String {
    if negate {
        format!("NOT ({})", predicate)
    } else {
        predicate
    }
}

fn render_filter(filter: &Filter, params: &mut Params) -> String {
    match filter {
        Filter::IdIn { var, ids } => format!("{}.{} IN {}", var, DB_ID, params.bind(ids.clone())),
        Filter::IdEquals { var, id } => format!("{}.{} = {}", var, DB_ID, params.bind(*id)),
        Filter::NoRelationship { rel, direction } => {
            format!("NOT {}", pattern("n", &format!(":{}", rel), *direction, ""))
        }
        Filter::Compare {
            operand: op,
            comparison,
            value,
            negate,
        } => negated(
            *negate,
            format!("{} {} {}", operand(op), cmp_op(*comparison), params.bind(value.clone())),
        ),
        Filter::In {
            operand: op,
            values,
            negate,
        } => negated(
            *negate,
            format!("{} IN {}", operand(op), params.bind(values.clone())),
        ),
        Filter::AnyElement {
            property,
            comparison,
            value,
            negate,
        } => negated(
            *negate,
            format!(
                "ANY(x IN n.{} WHERE x {} {})",
                property,
                cmp_op(*comparison),
                params.bind(value.clone())
            ),
        ),
        Filter::AnyElementIn {
            property,
            values,
            negate,
        } => negated(
            *negate,
            format!(
                "ANY(x IN n.{} WHERE x IN {})",
                property,
                params.bind(values.clone())
            ),
        ),
        Filter::IsNull { property } => format!("n.{} IS NULL", property),
        Filter::IsNotNull { property } => format!("n.{} IS NOT NULL", property),
    }
}

const INSTANCE_PROJECTION: &str =
    "n.DB_ID AS dbId, n._displayName AS displayName, n.schemaClass AS schemaClass";

fn render_instance_query(query: &InstanceQuery, params: &mut Params) -> String {
    let mut text = String::new();
    for clause in &query.clauses {
        if !text.is_empty() {
            text.push(' ');
        }
        match clause {
            MatchClause::Node { label, hop: None } => {
                text.push_str(&format!("MATCH (n:{})", label));
            }
            MatchClause::Node {
                label,
                hop: Some(hop),
            } => {
                text.push_str("MATCH ");
                text.push_str(&pattern(
                    &format!("n:{}", label),
                    &format!(":{}", hop.rel),
                    hop.direction,
                    &hop.var,
                ));
            }
            MatchClause::Exists {
                var,
                label,
                rel,
                direction,
            } => {
                text.push_str("MATCH ");
                text.push_str(&pattern(
                    &format!("{}:{}", var, label),
                    &format!(":{}", rel),
                    *direction,
                    "",
                ));
            }
        }
    }
    let filters: Vec<String> = query
        .filters
        .iter()
        .map(|f| render_filter(f, params))
        .collect();
    if !filters.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&filters.join(" AND "));
    }
    text.push_str(" RETURN DISTINCT ");
    text.push_str(INSTANCE_PROJECTION);
    text
}

impl ReadQuery {
    pub fn render(&self) -> Statement {
        let mut params = Params::default();
        let text = match self {
            ReadQuery::Instances(query) => render_instance_query(query, &mut params),
            ReadQuery::InstancesByClass { label, ids } => match ids {
                Some(ids) => format!(
                    "MATCH (n:{}) WHERE n.DB_ID IN {} RETURN {}",
                    label,
                    params.bind(ids.clone()),
                    INSTANCE_PROJECTION
                ),
                None => format!("MATCH (n:{}) RETURN {}", label, INSTANCE_PROJECTION),
            },
            ReadQuery::AttributeValues {
                label,
                id,
                attribute,
                shape,
            } => {
                let node = match id {
                    Some(id) => format!("n:{} {{DB_ID: {}}}", label, params.bind(*id)),
                    None => format!("n:{}", label),
                };
                match shape {
                    ValueShape::Primitive => format!(
                        "MATCH ({}) WHERE n.{att} IS NOT NULL \
                         RETURN n.DB_ID AS dbId, n.{att} AS value",
                        node,
                        att = attribute
                    ),
                    ValueShape::Instance {
                        target_label,
                        direction,
                        multiple,
                    } => {
                        let mut text = format!(
                            "MATCH {} RETURN n.DB_ID AS dbId, s.DB_ID AS targetId, \
                             s.schemaClass AS targetClass",
                            pattern(
                                &node,
                                &format!("r:{}", attribute),
                                *direction,
                                &format!("s:{}", target_label)
                            )
                        );
                        if *multiple {
                            text.push_str(", r.order AS ord, r.stoichiometry AS stoichiometry");
                        }
                        text
                    }
                }
            }
            ReadQuery::NodeProperties {
                label,
                id,
                properties,
            } => {
                let columns: Vec<String> = properties
                    .iter()
                    .map(|p| format!("n.{p} AS {p}", p = p))
                    .collect();
                format!(
                    "MATCH (n:{} {{DB_ID: {}}}) RETURN {}",
                    label,
                    params.bind(*id),
                    columns.join(", ")
                )
            }
            ReadQuery::Referrers {
                origin_label,
                attribute,
                target_label,
                id,
            } => format!(
                "MATCH (n:{})-[:{}]->(s:{} {{DB_ID: {}}}) RETURN DISTINCT n.DB_ID AS dbId",
                origin_label,
                attribute,
                target_label,
                params.bind(*id)
            ),
            ReadQuery::IdsByValueCount {
                origin_label,
                attribute,
                instance_valued: true,
                values,
                count,
            } => format!(
                "MATCH (n:{})-[r:{}]->(s) WHERE s.DB_ID IN {} \
                 WITH n.DB_ID AS dbId, s.DB_ID AS targetId, \
                 sum(coalesce(r.stoichiometry, 1)) AS occurrences \
                 WHERE occurrences = {} RETURN DISTINCT dbId",
                origin_label,
                attribute,
                params.bind(values.clone()),
                params.bind(*count)
            ),
            ReadQuery::IdsByValueCount {
                origin_label,
                attribute,
                instance_valued: false,
                values,
                count,
            } => format!(
                "MATCH (n:{}) WITH n.DB_ID AS dbId, \
                 size([x IN coalesce(n.{}, []) WHERE x IN {}]) AS occurrences \
                 WHERE occurrences = {} RETURN dbId",
                origin_label,
                attribute,
                params.bind(values.clone()),
                params.bind(*count)
            ),
            ReadQuery::ClassCount { label } => {
                format!("MATCH (n:{}) RETURN count(n) AS count", label)
            }
            ReadQuery::InstanceCounts => format!(
                "MATCH (n) WHERE n.{sc} IS NOT NULL \
                 RETURN n.{sc} AS schemaClass, count(n) AS count",
                sc = SCHEMA_CLASS
            ),
            ReadQuery::MaxDbId => "MATCH (n) RETURN max(n.DB_ID) AS maxDbId".to_string(),
            ReadQuery::ExistingIds { label, ids, inverse } => format!(
                "MATCH (n:{}) WHERE {}n.DB_ID IN {} RETURN n.DB_ID AS dbId",
                label,
                if *inverse { "NOT " } else { "" },
                params.bind(ids.clone())
            ),
            ReadQuery::SchemaClassOf { id } => format!(
                "MATCH (n {{DB_ID: {}}}) RETURN n.{} AS schemaClass",
                params.bind(*id),
                SCHEMA_CLASS
            ),
            ReadQuery::SchemaTimestamp => {
                "MATCH (s:Schema) RETURN s.timestamp AS timestamp".to_string()
            }
            ReadQuery::ModifiedResidues => format!(
                "MATCH (e:{})-[:{}]->(r) RETURN e.DB_ID AS dbId, r.DB_ID AS residueId",
                EWAS_CLASS, HAS_MODIFIED_RESIDUE
            ),
            ReadQuery::DuplicateStableIdentifiers => format!(
                "MATCH (s:{label}) WHERE s.{old} IS NOT NULL \
                 WITH s.{old} AS oldId, collect(s) AS recs WHERE size(recs) > 1 \
                 UNWIND recs AS s \
                 RETURN s.{id} AS {id}, s.DB_ID AS dbId, s.{old} AS {old}",
                label = STABLE_IDENTIFIER_CLASS,
                id = IDENTIFIER,
                old = OLD_IDENTIFIER
            ),
        };
        Statement {
            text,
            params: params.values,
        }
    }
}

impl WriteStatement {
    pub fn render(&self) -> Statement {
        let mut params = Params::default();
        let text = match self {
            WriteStatement::MintId { key } => format!(
                "MATCH (s:Seq {{key: {}}}) CALL apoc.atomic.add(s, 'value', 1, 10) \
                 YIELD newValue AS seq RETURN seq",
                params.bind(key.clone())
            ),
            WriteStatement::CreateNode {
                labels,
                id,
                class_name,
                display_name,
            } => format!(
                "CREATE (n:{} {{{}: {}, {}: {}, {}: {}}}) RETURN n.DB_ID AS dbId",
                labels.join(":"),
                DB_ID,
                params.bind(*id),
                DISPLAY_NAME,
                params.bind(display_name.clone()),
                SCHEMA_CLASS,
                params.bind(class_name.clone())
            ),
            WriteStatement::SetProperty {
                label,
                id,
                property,
                value,
            } => format!(
                "MATCH (n:{} {{DB_ID: {}}}) SET n.{} = {} RETURN n.DB_ID AS dbId",
                label,
                params.bind(*id),
                property,
                params.bind(value.clone())
            ),
            WriteStatement::CreateRelationship {
                from_label,
                from_id,
                to_label,
                to_id,
                rel,
                stoichiometry,
                order,
            } => {
                let from = params.bind(*from_id);
                let to = params.bind(*to_id);
                let spec = format!(
                    "r:{} {{stoichiometry: {}, order: {}}}",
                    rel,
                    params.bind(*stoichiometry),
                    params.bind(*order)
                );
                format!(
                    "MATCH (n:{} {{DB_ID: {}}}) MATCH (p:{} {{DB_ID: {}}}) \
                     CREATE {} RETURN n.DB_ID AS dbId",
                    from_label,
                    from,
                    to_label,
                    to,
                    pattern("n", &spec, Direction::Outgoing, "p")
                )
            }
            WriteStatement::DeleteRelationships {
                label,
                id,
                rel,
                direction,
            } => format!(
                "MATCH {} DELETE r",
                pattern(
                    &format!("n:{} {{DB_ID: {}}}", label, params.bind(*id)),
                    &format!("r:{}", rel),
                    *direction,
                    ""
                )
            ),
            WriteStatement::DetachDelete { label, id } => format!(
                "MATCH (n:{} {{DB_ID: {}}}) DETACH DELETE n",
                label,
                params.bind(*id)
            ),
        };
        Statement {
            text,
            params: params.values,
        }
    }
}
