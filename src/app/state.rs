use crate::config::StolonConfig;
use crate::core::api_gateway::ApiGateway;
use crate::core::approval::ApprovalQueue;
use crate::core::query::MySqlExecutor;
use crate::core::query_log::QueryLog;
use crate::core::registry::ProcessRegistry;
use crate::core::sanitize::Sanitizer;
use crate::core::secrets::{CliSecretStore, SecretResolver};
use crate::core::tunnel::TunnelManager;
use crate::domain::ports::{QueryExecutor, SecretStore};
use crate::utils::error::Result;
use std::sync::Arc;

/// Shared services behind the HTTP handlers.
pub struct AppState {
    pub config: Arc<StolonConfig>,
    pub tunnels: Arc<TunnelManager>,
    pub executor: Arc<dyn QueryExecutor>,
    pub sanitizer: Arc<Sanitizer>,
    pub approvals: Arc<ApprovalQueue>,
    pub query_log: Arc<QueryLog>,
    pub gateway: Arc<ApiGateway>,
}

impl AppState {
    /// Production wiring: CLI-backed secrets, MySQL through the CloudSQL proxy,
    /// and a registry mirrored to the configured state file.
    pub fn from_config(config: StolonConfig) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ProcessRegistry::new(Some(config.registry.state_file())));
        let secrets: Arc<dyn SecretStore> = Arc::new(SecretResolver::new(Arc::new(
            CliSecretStore::from_tools(&config.tools),
        )));
        let tunnels = Arc::new(TunnelManager::new(config.clone(), registry));
        let executor: Arc<dyn QueryExecutor> = Arc::new(MySqlExecutor::new(
            config.clone(),
            tunnels.clone(),
            secrets.clone(),
        ));
        Self::assemble(config, tunnels, secrets, executor)
    }

    pub fn assemble(
        config: Arc<StolonConfig>,
        tunnels: Arc<TunnelManager>,
        secrets: Arc<dyn SecretStore>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Result<Self> {
        let sanitizer = Arc::new(Sanitizer::from_config(&config.sanitize)?);
        let query_log = Arc::new(QueryLog::new(config.query.log_path.clone()));
        let approvals = Arc::new(ApprovalQueue::new(
            config.clone(),
            executor.clone(),
            query_log.clone(),
        ));
        let gateway = Arc::new(ApiGateway::new(
            config.clone(),
            tunnels.clone(),
            secrets,
            sanitizer.clone(),
        )?);

        Ok(Self {
            config,
            tunnels,
            executor,
            sanitizer,
            approvals,
            query_log,
            gateway,
        })
    }
}
