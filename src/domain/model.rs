use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::error::StolonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Environment {
    #[serde(rename = "dev")]
    #[cfg_attr(feature = "cli", value(name = "dev"))]
    Dev,
    #[serde(rename = "demo")]
    #[cfg_attr(feature = "cli", value(name = "demo"))]
    Demo,
    #[serde(rename = "na-prod", alias = "prod", alias = "na", alias = "production")]
    #[cfg_attr(feature = "cli", value(name = "na-prod", alias = "prod"))]
    NaProd,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Demo, Environment::NaProd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Demo => "demo",
            Environment::NaProd => "na-prod",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::NaProd)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = StolonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "demo" => Ok(Environment::Demo),
            "na-prod" | "prod" | "na" | "production" => Ok(Environment::NaProd),
            _ => Err(StolonError::UnknownEnvironment {
                name: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessKind {
    PortForward,
    CloudSqlProxy,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::PortForward => "port-forward",
            ProcessKind::CloudSqlProxy => "cloud-sql-proxy",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

pub fn port_forward_name(environment: Environment, service: &str) -> String {
    format!("{}:{}:{}", ProcessKind::PortForward, environment, service)
}

pub fn cloud_sql_proxy_name(environment: Environment) -> String {
    format!("{}:{}", ProcessKind::CloudSqlProxy, environment)
}

/// A tunnel subprocess known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub kind: ProcessKind,
    pub environment: Environment,
    /// Service name for port-forwards, instance connection name for proxies.
    pub target: String,
    pub pid: u32,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub started_at: DateTime<Utc>,
    /// OS start time of `pid`, used to tell it apart from a later process reusing the PID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>, truncated: bool) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            truncated,
            elapsed_ms: 0,
        }
    }

    /// Rows as column-keyed objects, in column order.
    pub fn records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: Uuid,
    pub environment: Environment,
    pub sql: String,
    pub requested_by: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: WriteStatus,
    pub decided_by: Option<String>,
    pub rows_affected: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEvent {
    Query,
    Result,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<serde_json::Value>,
}

impl QueryLogEntry {
    pub fn new(event: LogEvent, environment: Environment) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
            environment,
            query_id: None,
            sql: None,
            row_count: None,
            rows_affected: None,
            note: None,
            sample: None,
        }
    }
}

/// Where a secret lives. Values are resolved lazily through a `SecretStore`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SecretRef {
    #[serde(rename = "onepassword", alias = "1password", alias = "op")]
    OnePassword { reference: String },
    Britive {
        path: String,
        #[serde(default)]
        field: Option<String>,
    },
    Env { var: String },
    Literal { value: String },
}

impl SecretRef {
    pub fn source_name(&self) -> &'static str {
        match self {
            SecretRef::OnePassword { .. } => "1Password",
            SecretRef::Britive { .. } => "Britive",
            SecretRef::Env { .. } => "environment",
            SecretRef::Literal { .. } => "config",
        }
    }

    /// Stable identifier for memoization; never the secret value itself for stores.
    pub fn cache_key(&self) -> String {
        match self {
            SecretRef::OnePassword { reference } => format!("op:{}", reference),
            SecretRef::Britive { path, field } => {
                format!("britive:{}#{}", path, field.as_deref().unwrap_or(""))
            }
            SecretRef::Env { var } => format!("env:{}", var),
            SecretRef::Literal { .. } => "literal".to_string(),
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::OnePassword { reference } => {
                f.debug_struct("OnePassword").field("reference", reference).finish()
            }
            SecretRef::Britive { path, field } => f
                .debug_struct("Britive")
                .field("path", path)
                .field("field", field)
                .finish(),
            SecretRef::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            SecretRef::Literal { .. } => f.write_str("Literal(<redacted>)"),
        }
    }
}
