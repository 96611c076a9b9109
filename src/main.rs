use clap::Parser;
use std::sync::Arc;
use stolon::app::{self, AppState};
use stolon::config::{Cli, Command, StolonConfig};
use stolon::core::query::MySqlExecutor;
use stolon::core::registry::ProcessRegistry;
use stolon::core::sanitize::Sanitizer;
use stolon::core::secrets::{CliSecretStore, SecretResolver};
use stolon::core::statement;
use stolon::core::tunnel::TunnelManager;
use stolon::domain::model::{Environment, ProcessRecord, StatementKind};
use stolon::domain::ports::{QueryExecutor, SecretStore};
use stolon::utils::error::{ErrorSeverity, StolonError};
use stolon::utils::{logger, validation::Validate};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.json_logs {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::debug!("CLI arguments: {:?}", cli);

    if let Err(e) = run(cli).await {
        tracing::error!(
            "❌ {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        eprintln!("❌ {}", e.user_friendly_message());
        if let StolonError::TunnelStartFailed { output, .. } = &e {
            for line in output {
                eprintln!("   | {}", line);
            }
        }
        eprintln!("💡 {}", e.recovery_suggestion());

        std::process::exit(exit_code(e.severity()));
    }
}

/// Every failure exits non-zero; severity only picks which code.
fn exit_code(severity: ErrorSeverity) -> i32 {
    match severity {
        ErrorSeverity::Low | ErrorSeverity::High => 1,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::Critical => 3,
    }
}

async fn run(cli: Cli) -> stolon::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let state = AppState::from_config(config)?;
            app::run(state, &host, port).await
        }
        Command::Forward {
            environment,
            service,
            local_port,
        } => {
            let tunnels = tunnel_manager(Arc::new(config));
            let record = tunnels
                .ensure_port_forward(environment, &service, local_port)
                .await?;
            hold_until_interrupted(&tunnels, &record).await
        }
        Command::Proxy { environment, port } => {
            let tunnels = tunnel_manager(Arc::new(config));
            let record = tunnels.ensure_cloud_sql_proxy(environment, port).await?;
            hold_until_interrupted(&tunnels, &record).await
        }
        Command::Query {
            environment,
            sql,
            max_rows,
            raw,
        } => query(config, environment, &sql, max_rows, raw).await,
        Command::Ps => {
            let registry = ProcessRegistry::new(Some(config.registry.state_file()));
            let processes = registry.persisted().await?;
            if processes.is_empty() {
                println!("no recorded processes");
            }
            for p in processes {
                println!(
                    "{:<32} pid {:<8} port {:<6} {:<8} {}",
                    p.record.name,
                    p.record.pid,
                    p.record.local_port,
                    if p.alive { "running" } else { "exited" },
                    p.record.target
                );
            }
            Ok(())
        }
        Command::Stop { name, all } => {
            let registry = ProcessRegistry::new(Some(config.registry.state_file()));
            let names: Vec<String> = match (name, all) {
                (Some(name), _) => vec![name],
                (None, true) => registry
                    .persisted()
                    .await?
                    .into_iter()
                    .map(|p| p.record.name)
                    .collect(),
                (None, false) => {
                    return Err(StolonError::ValidationError {
                        message: "give a process name or --all".to_string(),
                    })
                }
            };
            for name in names {
                let record = registry.stop(&name).await?;
                println!("✅ stopped {} (pid {})", record.name, record.pid);
            }
            Ok(())
        }
        Command::Doctor => {
            doctor(&config);
            Ok(())
        }
    }
}

fn load_config(path: &str) -> stolon::Result<StolonConfig> {
    let config = StolonConfig::from_file(path)?;
    config.validate()?;
    tracing::debug!(
        "loaded {} with environments {:?}",
        path,
        config.configured_environments()
    );
    Ok(config)
}

fn tunnel_manager(config: Arc<StolonConfig>) -> Arc<TunnelManager> {
    let registry = Arc::new(ProcessRegistry::new(Some(config.registry.state_file())));
    Arc::new(TunnelManager::new(config, registry))
}

async fn hold_until_interrupted(
    tunnels: &TunnelManager,
    record: &ProcessRecord,
) -> stolon::Result<()> {
    if !tunnels.registry().owns(&record.name).await {
        println!(
            "✅ {} is already running on 127.0.0.1:{} (pid {}) under another stolon process",
            record.name, record.local_port, record.pid
        );
        return Ok(());
    }
    println!(
        "✅ {} listening on 127.0.0.1:{} (pid {}), Ctrl-C to stop",
        record.name, record.local_port, record.pid
    );
    tokio::signal::ctrl_c().await?;
    tunnels.stop(&record.name).await?;
    println!("stopped {}", record.name);
    Ok(())
}

async fn query(
    config: StolonConfig,
    environment: Environment,
    sql: &str,
    max_rows: Option<usize>,
    raw: bool,
) -> stolon::Result<()> {
    if statement::classify(sql)? == StatementKind::Write {
        return Err(StolonError::InvalidStatement {
            message: "the query command only runs read statements".to_string(),
        });
    }
    if raw && environment.is_production() {
        return Err(StolonError::ValidationError {
            message: format!("--raw is not allowed for {}", environment),
        });
    }

    let config = Arc::new(config);
    let sanitizer = Sanitizer::from_config(&config.sanitize)?;
    let tunnels = tunnel_manager(config.clone());
    let secrets: Arc<dyn SecretStore> = Arc::new(SecretResolver::new(Arc::new(
        CliSecretStore::from_tools(&config.tools),
    )));
    let executor = MySqlExecutor::new(config.clone(), tunnels.clone(), secrets);

    let max_rows = max_rows
        .unwrap_or(config.query.max_rows)
        .clamp(1, config.query.max_rows);
    let outcome = executor.fetch(environment, sql, max_rows).await;

    executor.close().await;
    tunnels.stop_all().await;

    let result = outcome?;
    let result = if raw {
        result
    } else {
        sanitizer.sanitize_result(result)
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.truncated {
        eprintln!("⚠️  truncated at {} rows", max_rows);
    }
    Ok(())
}

fn doctor(config: &StolonConfig) {
    let tools = [
        ("kubectl", &config.tools.kubectl),
        ("cloud-sql-proxy", &config.tools.cloud_sql_proxy),
        ("op", &config.tools.op),
        ("pybritive", &config.tools.pybritive),
    ];
    for (label, program) in tools {
        match which::which(program) {
            Ok(path) => println!("✅ {:<16} {}", label, path.display()),
            Err(_) => println!("❌ {:<16} '{}' not found on PATH", label, program),
        }
    }
    for environment in Environment::ALL {
        let status = if config.environment(environment).is_ok() {
            "configured"
        } else {
            "not configured"
        };
        println!("   {:<16} {}", environment, status);
    }
}
