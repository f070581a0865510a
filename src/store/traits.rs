use serde_json::Value;

use crate::cypher::{ReadQuery, WriteStatement};
use crate::error::StoreError;

/// One result row; columns in `ReadQuery::columns()` order.
pub type Row = Vec<Value>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A labeled-property graph the adaptor reads from and writes to.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Run a read outside any transaction.
    async fn query(&self, database: &str, query: &ReadQuery) -> StoreResult<Vec<Row>>;

    /// Open a write transaction on `database`.
    async fn begin(&self, database: &str) -> StoreResult<Box<dyn GraphTransaction>>;

    async fn close(&self) -> StoreResult<()>;
}

/// Writes made through a transaction become visible on commit.
#[async_trait::async_trait]
pub trait GraphTransaction: Send {
    /// Execute one statement; returns the single scalar the statement yields, if any.
    async fn run(&mut self, statement: &WriteStatement) -> StoreResult<Option<Value>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
