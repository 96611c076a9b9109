use crate::config::ToolsConfig;
use crate::domain::model::SecretRef;
use crate::domain::ports::SecretStore;
use crate::utils::error::{Result, StolonError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};

/// Reads secrets through the 1Password and Britive command line tools.
#[derive(Debug, Clone)]
pub struct CliSecretStore {
    op: String,
    pybritive: String,
}

impl CliSecretStore {
    pub fn new(op: impl Into<String>, pybritive: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            pybritive: pybritive.into(),
        }
    }

    pub fn from_tools(tools: &ToolsConfig) -> Self {
        Self::new(tools.op.clone(), tools.pybritive.clone())
    }

    async fn run(&self, binary: &str, args: &[&str], source_name: &str) -> Result<String> {
        tracing::debug!(tool = binary, "reading secret from {}", source_name);
        let output = Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StolonError::ToolNotFound {
                    tool: binary.to_string(),
                },
                _ => StolonError::IoError(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(StolonError::SecretUnavailable {
                source_name: source_name.to_string(),
                message: if stderr.is_empty() {
                    format!("{} exited with {}", binary, output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Picks the secret out of `pybritive secret view` output.
///
/// JSON output yields `field` when given, else `value`, else the only string
/// member. Anything that is not JSON is returned trimmed.
pub fn extract_britive_value(output: &str, field: Option<&str>) -> Result<String> {
    let trimmed = output.trim();
    let json: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(json) => json,
        Err(_) if field.is_none() => return Ok(trimmed.to_string()),
        Err(_) => {
            return Err(StolonError::SecretUnavailable {
                source_name: "Britive".to_string(),
                message: "expected JSON output when a field is requested".to_string(),
            })
        }
    };

    let as_text = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    let found = match (&json, field) {
        (serde_json::Value::Object(map), Some(field)) => map.get(field).and_then(as_text),
        (serde_json::Value::Object(map), None) => map.get("value").and_then(as_text).or_else(|| {
            let strings: Vec<&String> = map
                .values()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    _ => None,
                })
                .collect();
            match strings.as_slice() {
                [only] => Some((*only).clone()),
                _ => None,
            }
        }),
        (serde_json::Value::String(s), None) => Some(s.clone()),
        _ => None,
    };

    found.ok_or_else(|| StolonError::SecretUnavailable {
        source_name: "Britive".to_string(),
        message: match field {
            Some(field) => format!("field '{}' not present in secret", field),
            None => "could not pick a value from the secret; set `field`".to_string(),
        },
    })
}

#[async_trait]
impl SecretStore for CliSecretStore {
    async fn read(&self, secret: &SecretRef) -> Result<String> {
        match secret {
            SecretRef::OnePassword { reference } => {
                let value = self
                    .run(&self.op, &["read", "--no-newline", reference.as_str()], secret.source_name())
                    .await?;
                Ok(value.trim_end_matches(['\r', '\n']).to_string())
            }
            SecretRef::Britive { path, field } => {
                let output = self
                    .run(
                        &self.pybritive,
                        &["secret", "view", path.as_str(), "--format", "json"],
                        secret.source_name(),
                    )
                    .await?;
                extract_britive_value(&output, field.as_deref())
            }
            SecretRef::Env { var } => {
                std::env::var(var).map_err(|_| StolonError::SecretUnavailable {
                    source_name: secret.source_name().to_string(),
                    message: format!("{} is not set", var),
                })
            }
            SecretRef::Literal { value } => Ok(value.clone()),
        }
    }
}

/// Memoizes secrets for the lifetime of the process so each one prompts once.
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
    cache: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn forget_all(&self) {
        self.cache.lock().await.clear();
    }
}

#[async_trait]
impl SecretStore for SecretResolver {
    async fn read(&self, secret: &SecretRef) -> Result<String> {
        if let SecretRef::Literal { value } = secret {
            return Ok(value.clone());
        }

        // One cell per secret: concurrent readers wait on the same CLI call,
        // and a failed call leaves the cell empty for the next reader.
        let cell = self
            .cache
            .lock()
            .await
            .entry(secret.cache_key())
            .or_default()
            .clone();
        let value = cell.get_or_try_init(|| self.store.read(secret)).await?;
        Ok(value.clone())
    }
}
