//! Two-person approval for write statements.
//!
//! A write is submitted, held as pending until someone other than the
//! requester approves it, and then runs exactly once. Pending writes expire.

use crate::config::StolonConfig;
use crate::core::query_log::QueryLog;
use crate::core::statement;
use crate::domain::model::{Environment, PendingWrite, StatementKind, WriteStatus};
use crate::domain::ports::QueryExecutor;
use crate::utils::error::{Result, StolonError};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct ApprovalQueue {
    config: Arc<StolonConfig>,
    executor: Arc<dyn QueryExecutor>,
    log: Arc<QueryLog>,
    ttl: Duration,
    writes: Mutex<HashMap<Uuid, PendingWrite>>,
}

impl ApprovalQueue {
    pub fn new(
        config: Arc<StolonConfig>,
        executor: Arc<dyn QueryExecutor>,
        log: Arc<QueryLog>,
    ) -> Self {
        let ttl = Duration::minutes(config.query.approval_ttl_minutes);
        Self {
            config,
            executor,
            log,
            ttl,
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn submit(
        &self,
        environment: Environment,
        sql: &str,
        requested_by: &str,
        reason: Option<String>,
    ) -> Result<PendingWrite> {
        if requested_by.trim().is_empty() {
            return Err(StolonError::ValidationError {
                message: "requested_by is required".to_string(),
            });
        }
        if statement::classify(sql)? != StatementKind::Write {
            return Err(StolonError::InvalidStatement {
                message: "read statements go through /query".to_string(),
            });
        }

        let env = self.config.environment(environment)?;
        if !env.allow_writes {
            return Err(StolonError::WriteNotAllowed {
                environment: environment.to_string(),
            });
        }

        let now = Utc::now();
        let mut write = PendingWrite {
            id: Uuid::new_v4(),
            environment,
            sql: sql.trim().to_string(),
            requested_by: requested_by.trim().to_string(),
            reason,
            created_at: now,
            expires_at: now + self.ttl,
            status: WriteStatus::Pending,
            decided_by: None,
            rows_affected: None,
        };

        if !env.requires_approval(environment) {
            tracing::info!(%environment, id = %write.id, "running write without approval");
            let rows = self.run(&write).await?;
            write.status = WriteStatus::Executed;
            write.rows_affected = Some(rows);
        } else {
            tracing::info!(
                %environment,
                id = %write.id,
                requested_by = %write.requested_by,
                "write awaiting approval"
            );
        }

        self.writes.lock().await.insert(write.id, write.clone());
        Ok(write)
    }

    pub async fn approve(&self, id: Uuid, approver: &str) -> Result<PendingWrite> {
        let write = self.decide(id, approver, WriteStatus::Approved).await?;

        match self.run(&write).await {
            Ok(rows) => {
                let mut writes = self.writes.lock().await;
                let entry = writes.get_mut(&id).ok_or_else(|| not_found(id))?;
                entry.status = WriteStatus::Executed;
                entry.rows_affected = Some(rows);
                Ok(entry.clone())
            }
            Err(e) => {
                // Back to pending so it can be approved again once the cause is fixed.
                if let Some(entry) = self.writes.lock().await.get_mut(&id) {
                    entry.status = WriteStatus::Pending;
                    entry.decided_by = None;
                }
                Err(e)
            }
        }
    }

    pub async fn reject(&self, id: Uuid, approver: &str) -> Result<PendingWrite> {
        let write = self.decide(id, approver, WriteStatus::Rejected).await?;
        tracing::info!(id = %id, approver, "write rejected");
        Ok(write)
    }

    /// Moves a pending write to `status` after checking expiry and the approver.
    async fn decide(&self, id: Uuid, approver: &str, status: WriteStatus) -> Result<PendingWrite> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(StolonError::ValidationError {
                message: "approver is required".to_string(),
            });
        }

        let mut writes = self.writes.lock().await;
        let entry = writes.get_mut(&id).ok_or_else(|| not_found(id))?;

        if entry.status == WriteStatus::Pending && Utc::now() >= entry.expires_at {
            entry.status = WriteStatus::Expired;
        }
        match entry.status {
            WriteStatus::Pending => {}
            WriteStatus::Expired => {
                return Err(StolonError::ApprovalExpired { id: id.to_string() })
            }
            other => {
                return Err(StolonError::InvalidState {
                    message: format!("write {} is already {:?}", id, other).to_lowercase(),
                })
            }
        }
        if entry.requested_by.eq_ignore_ascii_case(approver) {
            return Err(StolonError::ValidationError {
                message: "a write cannot be approved or rejected by its requester".to_string(),
            });
        }

        entry.status = status;
        entry.decided_by = Some(approver.to_string());
        Ok(entry.clone())
    }

    async fn run(&self, write: &PendingWrite) -> Result<u64> {
        let rows = self.executor.execute(write.environment, &write.sql).await?;
        let note = match &write.decided_by {
            Some(approver) => format!("requested by {}, approved by {}", write.requested_by, approver),
            None => format!("requested by {}", write.requested_by),
        };
        if let Err(e) = self
            .log
            .log_write(write.environment, Some(write.id), &write.sql, rows, Some(note))
            .await
        {
            tracing::warn!(id = %write.id, "failed to record write in query log: {}", e);
        }
        Ok(rows)
    }

    pub async fn get(&self, id: Uuid) -> Result<PendingWrite> {
        self.writes
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    /// All known writes, newest first, with stale pending ones marked expired.
    pub async fn list(&self) -> Vec<PendingWrite> {
        let now = Utc::now();
        let mut writes = self.writes.lock().await;
        for write in writes.values_mut() {
            if write.status == WriteStatus::Pending && now >= write.expires_at {
                write.status = WriteStatus::Expired;
            }
        }
        let mut all: Vec<PendingWrite> = writes.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}

fn not_found(id: Uuid) -> StolonError {
    StolonError::NotFound {
        what: format!("write request {}", id),
    }
}
