use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    Graph, Query, Txn,
};
use serde_json::Value;

use crate::cypher::{ReadQuery, Statement, WriteStatement};
use crate::error::StoreError;
use crate::store::traits::{GraphStore, GraphTransaction, Row, StoreResult};

/// Graph backend speaking Bolt to a Neo4j server.
pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> StoreResult<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        log::info!("connected to neo4j at {}", uri);
        Ok(Self { graph })
    }
}

/// Map a driver failure onto the store error taxonomy.
fn classify(err: neo4rs::Error) -> StoreError {
    let message = err.to_string();
    if message.contains("DeadlockDetected") {
        StoreError::Deadlock(message)
    } else if message.to_ascii_lowercase().contains("connection") {
        StoreError::Connection(message)
    } else {
        StoreError::Statement(message)
    }
}

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => BoltType::String(BoltString::from(s.as_str())),
        Value::Array(items) => {
            BoltType::List(BoltList::from(items.iter().map(to_bolt).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut bolt = BoltMap::new();
            for (k, v) in map {
                bolt.put(BoltString::from(k.as_str()), to_bolt(v));
            }
            BoltType::Map(bolt)
        }
    }
}

fn prepare(statement: Statement) -> Query {
    log::debug!("cypher: {} {:?}", statement.text, statement.params);
    statement
        .params
        .iter()
        .fold(query(&statement.text), |q, (name, value)| q.param(name, to_bolt(value)))
}

fn read_row(row: &neo4rs::Row, columns: &[String]) -> StoreResult<Row> {
    columns
        .iter()
        .map(|c| {
            row.get::<Value>(c)
                .map_err(|e| StoreError::Protocol(format!("column {}: {}", c, e)))
        })
        .collect()
}

#[async_trait::async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn query(&self, database: &str, read: &ReadQuery) -> StoreResult<Vec<Row>> {
        let columns = read.columns();
        let mut stream = self
            .graph
            .execute_on(database, prepare(read.render()))
            .await
            .map_err(classify)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(classify)? {
            rows.push(read_row(&row, &columns)?);
        }
        Ok(rows)
    }

    async fn begin(&self, database: &str) -> StoreResult<Box<dyn GraphTransaction>> {
        let txn = self.graph.start_txn_on(database).await.map_err(classify)?;
        Ok(Box::new(Neo4jTransaction { txn }))
    }

    async fn close(&self) -> StoreResult<()> {
        // Connections are pooled and released when the graph is dropped
        log::info!("neo4j store closed");
        Ok(())
    }
}

struct Neo4jTransaction {
    txn: Txn,
}

#[async_trait::async_trait]
impl GraphTransaction for Neo4jTransaction {
    async fn run(&mut self, statement: &WriteStatement) -> StoreResult<Option<Value>> {
        let mut stream = self
            .txn
            .execute(prepare(statement.render()))
            .await
            .map_err(classify)?;
        let mut first = None;
        while let Some(row) = stream.next(self.txn.handle()).await.map_err(classify)? {
            if first.is_none() {
                first = row.get::<Value>(row_key(statement)).ok();
            }
        }
        Ok(first.filter(|v| !v.is_null()))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.txn.rollback().await.map_err(classify)
    }
}

/// Name of the scalar column a write statement returns.
fn row_key(statement: &WriteStatement) -> &'static str {
    match statement {
        WriteStatement::MintId { .. } => "seq",
        _ => "dbId",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deadlock_classification_uses_status_code() {
        let err = neo4rs::Error::UnexpectedMessage(
            "Neo.TransientError.Transaction.DeadlockDetected".to_string(),
        );
        assert!(classify(err).is_deadlock());
    }

    #[test]
    fn test_json_to_bolt_lists() {
        match to_bolt(&json!([1, "a"])) {
            BoltType::List(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
    }
}
