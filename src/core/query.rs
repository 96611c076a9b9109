use crate::config::StolonConfig;
use crate::core::tunnel::TunnelManager;
use crate::domain::model::{Environment, QueryResult};
use crate::domain::ports::{QueryExecutor, SecretStore};
use crate::utils::error::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::mysql::MySqlConnection;
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Runs SQL against an environment's database through its CloudSQL proxy.
pub struct MySqlExecutor {
    config: Arc<StolonConfig>,
    tunnels: Arc<TunnelManager>,
    secrets: Arc<dyn SecretStore>,
    pools: RwLock<HashMap<Environment, (u16, MySqlPool)>>,
}

impl MySqlExecutor {
    pub fn new(
        config: Arc<StolonConfig>,
        tunnels: Arc<TunnelManager>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            config,
            tunnels,
            secrets,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// A pool bound to the proxy's current port; rebuilt if the proxy was restarted.
    async fn pool(&self, environment: Environment) -> Result<MySqlPool> {
        let proxy = self.tunnels.ensure_cloud_sql_proxy(environment, None).await?;

        if let Some((port, pool)) = self.pools.read().await.get(&environment) {
            if *port == proxy.local_port && !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let db = self.config.database(environment)?;
        let password = self.secrets.read(&db.password).await?;
        let options = MySqlConnectOptions::new()
            .host("127.0.0.1")
            .port(proxy.local_port)
            .username(&db.user)
            .password(&password)
            .database(&db.name);

        tracing::info!(%environment, port = proxy.local_port, database = %db.name, "connecting");
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(15))
            .connect_with(options)
            .await?;

        if let Some((_, old)) = self
            .pools
            .write()
            .await
            .insert(environment, (proxy.local_port, pool.clone()))
        {
            old.close().await;
        }
        Ok(pool)
    }

    pub async fn close(&self) {
        for (_, (_, pool)) in self.pools.write().await.drain() {
            pool.close().await;
        }
    }
}

/// Decodes one row into JSON values in column order.
pub fn decode_row(row: &MySqlRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|col| {
            let idx = col.ordinal();
            match row.try_get_raw(idx) {
                Ok(raw) if raw.is_null() => Value::Null,
                Ok(raw) => {
                    let type_name = raw.type_info().name().to_ascii_uppercase();
                    decode_value(row, idx, &type_name)
                }
                Err(_) => Value::Null,
            }
        })
        .collect()
}

fn decode_value(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    let unsigned = type_name.contains("UNSIGNED");
    let base = type_name.split_whitespace().next().unwrap_or("");

    let decoded = match base {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::Bool).ok(),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" if unsigned => {
            row.try_get::<u64, _>(idx).map(Value::from).ok()
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).map(Value::from).ok()
        }
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| Value::from(v as f64)).ok(),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(Value::from).ok(),
        "JSON" => row.try_get::<Value, _>(idx).ok(),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .ok(),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| Value::String(v.to_rfc3339()))
            .ok(),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| Value::String(v.to_string()))
            .ok(),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|v| Value::String(v.to_string()))
            .ok(),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|bytes| decode_bytes(&bytes))
            .ok(),
        _ => None,
    };

    // DECIMAL arrives as text on the wire; ENUM, SET, TEXT and CHAR are text already.
    decoded
        .or_else(|| row.try_get_unchecked::<String, _>(idx).map(Value::String).ok())
        .unwrap_or(Value::Null)
}

/// Printable bytes stay text, other 16-byte values are BINARY(16) UUIDs, the rest become hex.
pub fn decode_bytes(bytes: &[u8]) -> Value {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if !text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Value::String(text.to_string());
        }
    }
    match Uuid::from_slice(bytes) {
        Ok(uuid) => Value::String(uuid.to_string()),
        Err(_) => Value::String(format!("0x{}", hex::encode(bytes))),
    }
}

/// Runs `sql` inside `START TRANSACTION READ ONLY` and always rolls back, so the
/// server refuses any statement that would change data.
pub async fn fetch_read_only(
    pool: &MySqlPool,
    sql: &str,
    max_rows: usize,
) -> Result<QueryResult> {
    let mut conn = pool.acquire().await?;
    (&mut *conn)
        .execute(sqlx::raw_sql("START TRANSACTION READ ONLY"))
        .await?;

    let outcome = read_rows(&mut conn, sql, max_rows).await;

    if let Err(e) = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await {
        tracing::warn!(error = %e, "rollback after read failed, discarding connection");
        conn.close_on_drop();
    }
    outcome
}

async fn read_rows(
    conn: &mut MySqlConnection,
    sql: &str,
    max_rows: usize,
) -> Result<QueryResult> {
    // Column names come from the statement itself so an empty result keeps its header.
    let mut columns: Vec<String> = match (&mut *conn).describe(sql).await {
        Ok(described) => described
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "could not describe statement");
            Vec::new()
        }
    };

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut stream = sqlx::query(sql).fetch(&mut *conn);
    while let Some(row) = stream.try_next().await? {
        if columns.is_empty() {
            columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        if rows.len() == max_rows {
            truncated = true;
            break;
        }
        rows.push(decode_row(&row));
    }

    Ok(QueryResult::new(columns, rows, truncated))
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    async fn fetch(
        &self,
        environment: Environment,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult> {
        let pool = self.pool(environment).await?;
        let started = Instant::now();

        let mut result = fetch_read_only(&pool, sql, max_rows).await?;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            %environment,
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = result.elapsed_ms,
            "query finished"
        );
        Ok(result)
    }

    async fn execute(&self, environment: Environment, sql: &str) -> Result<u64> {
        let pool = self.pool(environment).await?;
        let mut tx = pool.begin().await?;
        let done = sqlx::query(sql).execute(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!(%environment, rows_affected = done.rows_affected(), "write committed");
        Ok(done.rows_affected())
    }
}
