use crate::domain::model::{Environment, LogEvent, QueryLogEntry};
use crate::utils::error::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Append-only JSON-lines audit log of queries, results and writes.
pub struct QueryLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl QueryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &QueryLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn log_query(
        &self,
        environment: Environment,
        sql: &str,
        note: Option<String>,
    ) -> Result<QueryLogEntry> {
        let mut entry = QueryLogEntry::new(LogEvent::Query, environment);
        entry.sql = Some(sql.to_string());
        entry.note = note;
        self.append(&entry).await?;
        Ok(entry)
    }

    /// `sample` must already be sanitized; it is written as given.
    pub async fn log_result(
        &self,
        environment: Environment,
        query_id: Option<Uuid>,
        row_count: usize,
        sample: Option<serde_json::Value>,
        note: Option<String>,
    ) -> Result<QueryLogEntry> {
        let mut entry = QueryLogEntry::new(LogEvent::Result, environment);
        entry.query_id = query_id;
        entry.row_count = Some(row_count);
        entry.sample = sample;
        entry.note = note;
        self.append(&entry).await?;
        Ok(entry)
    }

    pub async fn log_write(
        &self,
        environment: Environment,
        query_id: Option<Uuid>,
        sql: &str,
        rows_affected: u64,
        note: Option<String>,
    ) -> Result<QueryLogEntry> {
        let mut entry = QueryLogEntry::new(LogEvent::Write, environment);
        entry.query_id = query_id;
        entry.sql = Some(sql.to_string());
        entry.rows_affected = Some(rows_affected);
        entry.note = note;
        self.append(&entry).await?;
        Ok(entry)
    }

    /// All entries, oldest first. Lines that fail to parse are skipped.
    pub async fn entries(&self) -> Result<Vec<QueryLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_query_and_result() {
        let dir = TempDir::new().unwrap();
        let log = QueryLog::new(dir.path().join("logs").join("queries.jsonl"));

        let query = log
            .log_query(Environment::Dev, "SELECT 1", Some("smoke".to_string()))
            .await
            .unwrap();
        log.log_result(
            Environment::Dev,
            Some(query.id),
            1,
            Some(serde_json::json!([{"1": 1}])),
            None,
        )
        .await
        .unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, LogEvent::Query);
        assert_eq!(entries[0].sql.as_deref(), Some("SELECT 1"));
        assert_eq!(entries[1].event, LogEvent::Result);
        assert_eq!(entries[1].query_id, Some(query.id));
        assert_eq!(entries[1].row_count, Some(1));
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = QueryLog::new(dir.path().join("none.jsonl"));
        assert!(log.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lines_are_json() {
        let dir = TempDir::new().unwrap();
        let log = QueryLog::new(dir.path().join("q.jsonl"));
        log.log_write(Environment::Demo, None, "UPDATE t SET a = 1", 3, None)
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(log.path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["event"], "write");
        assert_eq!(value["environment"], "demo");
        assert_eq!(value["rows_affected"], 3);
        assert!(value.get("sample").is_none());
    }
}
