#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stolon::core::registry::ProcessRegistry;
use stolon::core::tunnel::TunnelManager;
use stolon::utils::process;
use stolon::{Environment, StolonConfig, StolonError};
use tempfile::TempDir;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn manager(dir: &TempDir, kubectl: &Path, proxy: &Path, timeout: u64) -> TunnelManager {
    let config = StolonConfig::from_toml_str(&format!(
        r#"
[tools]
kubectl = "{}"
cloud_sql_proxy = "{}"
ready_timeout_seconds = {}

[environments.dev]
namespace = "core"

[environments.dev.database]
instance = "acme-dev:us-central1:main"
name = "app"
user = "reader"
password = {{ source = "env", var = "DEV_DB_PASSWORD" }}

[environments.dev.services.billing]
target = "svc/billing"
remote_port = 8080
"#,
        kubectl.display(),
        proxy.display(),
        timeout
    ))
    .unwrap();
    let registry = ProcessRegistry::new(Some(dir.path().join("processes.json")));
    TunnelManager::new(Arc::new(config), Arc::new(registry))
}

async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..40 {
        if !process::is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_port_forward_ready_and_reused() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(
        dir.path(),
        "kubectl",
        "echo 'Forwarding from 127.0.0.1:45678 -> 8080'\nexec sleep 30",
    );
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");
    let tunnels = manager(&dir, &kubectl, &proxy, 10);

    let first = tunnels
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap();
    assert_eq!(first.name, "port-forward:dev:billing");
    assert_eq!(first.local_port, 45678);
    assert_eq!(first.remote_port, Some(8080));
    assert!(process::is_alive(first.pid));

    let second = tunnels
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap();
    assert_eq!(second.pid, first.pid);
    assert_eq!(tunnels.registry().list().await.len(), 1);

    let logs = tunnels.registry().logs(&first.name).await.unwrap();
    assert!(logs[0].contains("Forwarding from"));

    let persisted = tunnels.registry().persisted().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].alive);

    tunnels.stop(&first.name).await.unwrap();
    assert!(wait_until_dead(first.pid).await);
    assert!(tunnels.registry().list().await.is_empty());
    assert!(tunnels.registry().persisted().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cloud_sql_proxy_uses_requested_port() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(dir.path(), "kubectl", "exit 1");
    // args: --address 127.0.0.1 --port <port> <instance>
    let proxy = script(
        dir.path(),
        "cloud-sql-proxy",
        "echo \"Authorizing with Application Default Credentials\" >&2\necho \"[$5] Listening on 127.0.0.1:$4\" >&2\nexec sleep 30",
    );
    let tunnels = manager(&dir, &kubectl, &proxy, 10);

    let record = tunnels
        .ensure_cloud_sql_proxy(Environment::Dev, Some(43307))
        .await
        .unwrap();
    assert_eq!(record.name, "cloud-sql-proxy:dev");
    assert_eq!(record.local_port, 43307);
    assert_eq!(record.target, "acme-dev:us-central1:main");

    let stopped = tunnels.stop_all().await;
    assert_eq!(stopped.len(), 1);
    assert!(wait_until_dead(record.pid).await);
}

#[tokio::test]
async fn test_early_exit_reports_output() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(
        dir.path(),
        "kubectl",
        "echo 'error: services \"billing\" not found' >&2\nexit 1",
    );
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");
    let tunnels = manager(&dir, &kubectl, &proxy, 10);

    let err = tunnels
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap_err();
    match err {
        StolonError::TunnelStartFailed { name, output, .. } => {
            assert_eq!(name, "port-forward:dev:billing");
            assert!(output.iter().any(|l| l.contains("not found")));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(tunnels.registry().list().await.is_empty());
}

#[tokio::test]
async fn test_not_ready_times_out() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(dir.path(), "kubectl", "echo 'waiting for pod'\nexec sleep 30");
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");
    let tunnels = manager(&dir, &kubectl, &proxy, 1);

    let err = tunnels
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap_err();
    match err {
        StolonError::TunnelStartFailed { reason, output, .. } => {
            assert!(reason.contains("1s"));
            assert_eq!(output, vec!["waiting for pod".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_tool() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("no-such-kubectl");
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");
    let tunnels = manager(&dir, &missing, &proxy, 1);

    let err = tunnels
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StolonError::ToolNotFound { .. }));
}

#[tokio::test]
async fn test_closed_output_does_not_hang_startup() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(
        dir.path(),
        "kubectl",
        "echo 'starting'\nexec >&- 2>&-\nexec sleep 30",
    );
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");
    let tunnels = manager(&dir, &kubectl, &proxy, 1);

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        tunnels.ensure_port_forward(Environment::Dev, "billing", None),
    )
    .await
    .expect("startup should give up within the ready timeout");

    match outcome.unwrap_err() {
        StolonError::TunnelStartFailed { reason, output, .. } => {
            assert!(reason.contains("without becoming ready"), "{}", reason);
            assert_eq!(output, vec!["starting".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_tunnel_from_another_invocation_is_reused_not_adopted() {
    let dir = TempDir::new().unwrap();
    let kubectl = script(
        dir.path(),
        "kubectl",
        "echo 'Forwarding from 127.0.0.1:45679 -> 8080'\nexec sleep 30",
    );
    let proxy = script(dir.path(), "cloud-sql-proxy", "exit 1");

    // Two managers over one state file, like `stolon serve` and `stolon forward`.
    let server = manager(&dir, &kubectl, &proxy, 10);
    let cli = manager(&dir, &kubectl, &proxy, 10);

    let started = server
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap();
    let reused = cli
        .ensure_port_forward(Environment::Dev, "billing", None)
        .await
        .unwrap();
    assert_eq!(reused.pid, started.pid);
    assert_eq!(reused.local_port, 45679);
    assert!(!cli.registry().owns(&started.name).await);

    // The borrower shutting down leaves the owner's tunnel running and tracked.
    assert!(cli.stop_all().await.is_empty());
    assert!(process::is_alive(started.pid));
    let tracked = server.registry().persisted().await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert!(tracked[0].alive);

    server.stop_all().await;
    assert!(wait_until_dead(started.pid).await);
}
