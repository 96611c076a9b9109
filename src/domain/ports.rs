use crate::domain::model::{Environment, QueryResult, SecretRef};
use crate::utils::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read(&self, secret: &SecretRef) -> Result<String>;
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a read statement and returns at most `max_rows` rows.
    async fn fetch(&self, environment: Environment, sql: &str, max_rows: usize)
        -> Result<QueryResult>;

    /// Runs a write statement in a transaction and returns the affected row count.
    async fn execute(&self, environment: Environment, sql: &str) -> Result<u64>;
}
