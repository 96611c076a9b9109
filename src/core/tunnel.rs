//! Starts and stops `kubectl port-forward` and `cloud-sql-proxy` subprocesses.
//!
//! A tunnel is ready once its output names the local port it listens on.
//! Output keeps being drained into the registry's log buffer afterwards.

use crate::config::StolonConfig;
use crate::core::registry::{LogBuffer, ProcessRegistry};
use crate::domain::model::{
    cloud_sql_proxy_name, port_forward_name, Environment, ProcessKind, ProcessRecord,
};
use crate::utils::error::{Result, StolonError};
use crate::utils::process;
use chrono::Utc;
use regex::Regex;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

/// Lines of output kept in a startup failure.
const FAILURE_TAIL: usize = 20;

fn port_forward_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+)").expect("valid port-forward regex")
    })
}

fn proxy_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"Listening on (?:\[[^\]]*\]|[^\s:]+):(\d+)").expect("valid proxy regex")
    })
}

/// Extracts the local port from a readiness line, if this is one.
pub fn parse_ready_port(kind: ProcessKind, line: &str) -> Option<u16> {
    let regex = match kind {
        ProcessKind::PortForward => port_forward_regex(),
        ProcessKind::CloudSqlProxy => proxy_regex(),
    };
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .filter(|port: &u16| *port != 0)
}

/// Asks the OS for a port that is free right now.
pub fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Everything needed to launch one tunnel process.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub name: String,
    pub kind: ProcessKind,
    pub environment: Environment,
    pub target: String,
    pub program: String,
    pub args: Vec<String>,
    pub remote_port: Option<u16>,
}

pub struct TunnelManager {
    config: Arc<StolonConfig>,
    registry: Arc<ProcessRegistry>,
    start_lock: Mutex<()>,
}

impl TunnelManager {
    pub fn new(config: Arc<StolonConfig>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            registry,
            start_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn port_forward_spec(
        &self,
        environment: Environment,
        service: &str,
        local_port: Option<u16>,
    ) -> Result<TunnelSpec> {
        let env = self.config.environment(environment)?;
        let svc = self.config.service(environment, service)?;
        let local = local_port
            .or(svc.local_port)
            .map(|p| p.to_string())
            .unwrap_or_default();

        let mut args = Vec::new();
        if let Some(context) = &env.kube_context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend([
            "--namespace".to_string(),
            env.namespace.clone(),
            "port-forward".to_string(),
            "--address".to_string(),
            "127.0.0.1".to_string(),
            svc.target.clone(),
            format!("{}:{}", local, svc.remote_port),
        ]);

        Ok(TunnelSpec {
            name: port_forward_name(environment, service),
            kind: ProcessKind::PortForward,
            environment,
            target: service.to_string(),
            program: self.config.tools.kubectl.clone(),
            args,
            remote_port: Some(svc.remote_port),
        })
    }

    pub fn cloud_sql_proxy_spec(
        &self,
        environment: Environment,
        port: Option<u16>,
    ) -> Result<TunnelSpec> {
        let db = self.config.database(environment)?;
        let port = match port.or(db.local_port) {
            Some(port) => port,
            None => free_local_port()?,
        };

        let mut args = vec![
            "--address".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if db.private_ip {
            args.push("--private-ip".to_string());
        }
        args.push(db.instance.clone());

        Ok(TunnelSpec {
            name: cloud_sql_proxy_name(environment),
            kind: ProcessKind::CloudSqlProxy,
            environment,
            target: db.instance.clone(),
            program: self.config.tools.cloud_sql_proxy.clone(),
            args,
            remote_port: None,
        })
    }

    /// Returns the running port-forward for `service`, starting it if needed.
    pub async fn ensure_port_forward(
        &self,
        environment: Environment,
        service: &str,
        local_port: Option<u16>,
    ) -> Result<ProcessRecord> {
        let spec = self.port_forward_spec(environment, service, local_port)?;
        self.ensure(spec).await
    }

    /// Returns the running CloudSQL proxy for `environment`, starting it if needed.
    pub async fn ensure_cloud_sql_proxy(
        &self,
        environment: Environment,
        port: Option<u16>,
    ) -> Result<ProcessRecord> {
        let name = cloud_sql_proxy_name(environment);
        let _guard = self.start_lock.lock().await;
        if let Some(existing) = self.running(&name).await? {
            return Ok(existing);
        }
        let spec = self.cloud_sql_proxy_spec(environment, port)?;
        self.launch(spec).await
    }

    async fn ensure(&self, spec: TunnelSpec) -> Result<ProcessRecord> {
        let _guard = self.start_lock.lock().await;
        if let Some(existing) = self.running(&spec.name).await? {
            return Ok(existing);
        }
        self.launch(spec).await
    }

    /// A live tunnel called `name`, whether this process or another stolon
    /// process started it. Tunnels owned elsewhere are used but not adopted.
    async fn running(&self, name: &str) -> Result<Option<ProcessRecord>> {
        if let Some(existing) = self.registry.get(name).await {
            tracing::debug!(name, port = existing.local_port, "reusing running tunnel");
            return Ok(Some(existing));
        }
        let foreign = self.registry.live_persisted(name).await?;
        if let Some(record) = &foreign {
            tracing::info!(
                name,
                pid = record.pid,
                port = record.local_port,
                "reusing tunnel started by another stolon process"
            );
        }
        Ok(foreign)
    }

    /// Spawns the process and waits for its readiness line.
    pub async fn launch(&self, spec: TunnelSpec) -> Result<ProcessRecord> {
        tracing::info!(name = %spec.name, program = %spec.program, "starting tunnel");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StolonError::ToolNotFound {
                    tool: spec.program.clone(),
                },
                _ => StolonError::IoError(e),
            })?;

        let pid = child.id().ok_or_else(|| StolonError::TunnelStartFailed {
            name: spec.name.clone(),
            reason: "process exited immediately".to_string(),
            output: Vec::new(),
        })?;

        let logs = Arc::new(LogBuffer::new(self.config.tools.log_buffer_lines));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, spec.name.clone(), logs.clone(), tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, spec.name.clone(), logs.clone(), tx.clone()));
        }
        drop(tx);

        let kind = spec.kind;
        let wait_for_port = async move {
            while let Some(line) = rx.recv().await {
                if let Some(port) = parse_ready_port(kind, &line) {
                    return Some(port);
                }
            }
            None
        };

        let timeout = Duration::from_secs(self.config.tools.ready_timeout_seconds);
        let started = Instant::now();
        let local_port = match tokio::time::timeout(timeout, wait_for_port).await {
            Ok(Some(port)) => port,
            Ok(None) => {
                // Output closed; give the process what is left of the timeout to exit.
                let remaining = timeout.saturating_sub(started.elapsed());
                let status = match tokio::time::timeout(remaining, child.wait()).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        let _ = child.start_kill();
                        None
                    }
                };
                return Err(StolonError::TunnelStartFailed {
                    name: spec.name,
                    reason: match status {
                        Some(status) => format!("exited before becoming ready ({})", status),
                        None => "closed its output without becoming ready".to_string(),
                    },
                    output: tail(&logs.snapshot(), FAILURE_TAIL),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(StolonError::TunnelStartFailed {
                    name: spec.name,
                    reason: format!("not ready after {}s", timeout.as_secs()),
                    output: tail(&logs.snapshot(), FAILURE_TAIL),
                });
            }
        };

        let record = ProcessRecord {
            name: spec.name,
            kind: spec.kind,
            environment: spec.environment,
            target: spec.target,
            pid,
            local_port,
            remote_port: spec.remote_port,
            started_at: Utc::now(),
            process_start: process::start_time(pid),
        };
        tracing::info!(name = %record.name, pid, port = local_port, "tunnel ready");

        self.registry
            .insert(record.clone(), Some(child), logs)
            .await?;
        Ok(record)
    }

    pub async fn stop(&self, name: &str) -> Result<ProcessRecord> {
        self.registry.stop(name).await
    }

    pub async fn stop_all(&self) -> Vec<ProcessRecord> {
        self.registry.stop_all().await
    }
}

async fn drain_output<R>(
    reader: R,
    name: String,
    logs: Arc<LogBuffer>,
    ready: mpsc::UnboundedSender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(process = %name, "{}", line);
                logs.push(line.clone());
                // The receiver goes away once the tunnel is ready.
                let _ = ready.send(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(process = %name, "output stream closed: {}", e);
                break;
            }
        }
    }
    tracing::debug!(process = %name, "output drained");
}

fn tail(lines: &[String], n: usize) -> Vec<String> {
    lines[lines.len().saturating_sub(n)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TunnelManager {
        let config = StolonConfig::from_toml_str(
            r#"
[tools]
kubectl = "/opt/bin/kubectl"

[environments.dev]
kube_context = "gke_acme-dev"
namespace = "core"

[environments.dev.database]
instance = "acme-dev:us-central1:main"
name = "app"
user = "reader"
private_ip = true
local_port = 3307
password = { source = "env", var = "DEV_DB_PASSWORD" }

[environments.dev.services.billing]
target = "svc/billing"
remote_port = 8080
"#,
        )
        .unwrap();
        TunnelManager::new(Arc::new(config), Arc::new(ProcessRegistry::in_memory()))
    }

    #[test]
    fn test_parse_ready_port() {
        assert_eq!(
            parse_ready_port(
                ProcessKind::PortForward,
                "Forwarding from 127.0.0.1:54321 -> 8080"
            ),
            Some(54321)
        );
        assert_eq!(
            parse_ready_port(ProcessKind::PortForward, "Forwarding from [::1]:54321 -> 8080"),
            None
        );
        assert_eq!(
            parse_ready_port(
                ProcessKind::CloudSqlProxy,
                "2024/01/01 10:00:00 Authorizing with Application Default Credentials"
            ),
            None
        );
        assert_eq!(
            parse_ready_port(
                ProcessKind::CloudSqlProxy,
                "2024/01/01 10:00:00 [acme-dev:us-central1:main] Listening on 127.0.0.1:3307"
            ),
            Some(3307)
        );
        assert_eq!(
            parse_ready_port(
                ProcessKind::CloudSqlProxy,
                "Listening on 127.0.0.1:3306 for acme-dev:us-central1:main"
            ),
            Some(3306)
        );
    }

    #[test]
    fn test_port_forward_spec() {
        let spec = manager()
            .port_forward_spec(Environment::Dev, "billing", None)
            .unwrap();
        assert_eq!(spec.name, "port-forward:dev:billing");
        assert_eq!(spec.program, "/opt/bin/kubectl");
        assert_eq!(
            spec.args,
            vec![
                "--context",
                "gke_acme-dev",
                "--namespace",
                "core",
                "port-forward",
                "--address",
                "127.0.0.1",
                "svc/billing",
                ":8080"
            ]
        );

        let spec = manager()
            .port_forward_spec(Environment::Dev, "billing", Some(18080))
            .unwrap();
        assert_eq!(spec.args.last().unwrap(), "18080:8080");
    }

    #[test]
    fn test_cloud_sql_proxy_spec() {
        let spec = manager()
            .cloud_sql_proxy_spec(Environment::Dev, None)
            .unwrap();
        assert_eq!(spec.name, "cloud-sql-proxy:dev");
        assert_eq!(spec.program, "cloud-sql-proxy");
        assert_eq!(
            spec.args,
            vec![
                "--address",
                "127.0.0.1",
                "--port",
                "3307",
                "--private-ip",
                "acme-dev:us-central1:main"
            ]
        );
    }

    #[test]
    fn test_unknown_service() {
        assert!(matches!(
            manager().port_forward_spec(Environment::Dev, "ledger", None),
            Err(StolonError::UnknownService { .. })
        ));
        assert!(matches!(
            manager().cloud_sql_proxy_spec(Environment::Demo, None),
            Err(StolonError::UnknownEnvironment { .. })
        ));
    }

    #[test]
    fn test_free_local_port() {
        assert!(free_local_port().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let result = manager()
            .ensure_port_forward(Environment::Dev, "billing", None)
            .await;
        assert!(matches!(result, Err(StolonError::ToolNotFound { .. })));
    }
}
