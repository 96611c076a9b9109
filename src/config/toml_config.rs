use crate::domain::model::{Environment, SecretRef};
use crate::utils::error::{Result, StolonError};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StolonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sanitize: SanitizeConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_cloud_sql_proxy")]
    pub cloud_sql_proxy: String,
    #[serde(default = "default_op")]
    pub op: String,
    #[serde(default = "default_pybritive")]
    pub pybritive: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_seconds: u64,
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeConfig {
    #[serde(default = "default_salt")]
    pub salt: String,
    #[serde(default = "default_pii_columns")]
    pub pii_columns: Vec<String>,
    #[serde(default)]
    pub pii_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub hash_uuids: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_minutes: i64,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub kube_context: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_true")]
    pub allow_writes: bool,
    #[serde(default = "default_true")]
    pub require_approval: bool,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// CloudSQL instance connection name, `project:region:instance`.
    pub instance: String,
    pub name: String,
    pub user: String,
    pub password: SecretRef,
    #[serde(default)]
    pub private_ip: bool,
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// kubectl resource, e.g. `svc/billing` or `deployment/billing`.
    pub target: String,
    pub remote_port: u16,
    pub local_port: Option<u16>,
    pub token: Option<SecretRef>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_cloud_sql_proxy() -> String {
    "cloud-sql-proxy".to_string()
}

fn default_op() -> String {
    "op".to_string()
}

fn default_pybritive() -> String {
    "pybritive".to_string()
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_log_buffer_lines() -> usize {
    200
}

fn default_salt() -> String {
    "stolon".to_string()
}

fn default_pii_columns() -> Vec<String> {
    [
        "email",
        "first_name",
        "last_name",
        "full_name",
        "phone",
        "phone_number",
        "address",
        "street",
        "ssn",
        "date_of_birth",
        "ip_address",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_rows() -> usize {
    1000
}

fn default_approval_ttl() -> i64 {
    30
}

fn default_log_path() -> PathBuf {
    PathBuf::from("./logs/queries.jsonl")
}

fn default_sample_rows() -> usize {
    5
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            cloud_sql_proxy: default_cloud_sql_proxy(),
            op: default_op(),
            pybritive: default_pybritive(),
            ready_timeout_seconds: default_ready_timeout(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            salt: default_salt(),
            pii_columns: default_pii_columns(),
            pii_patterns: Vec::new(),
            hash_uuids: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            approval_ttl_minutes: default_approval_ttl(),
            log_path: default_log_path(),
            sample_rows: default_sample_rows(),
        }
    }
}

impl RegistryConfig {
    /// Configured state file, or `~/.stolon/processes.json`.
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".stolon")
                .join("processes.json")
        })
    }
}

impl EnvironmentConfig {
    /// Production always requires a second person, whatever the file says.
    pub fn requires_approval(&self, environment: Environment) -> bool {
        self.require_approval || environment.is_production()
    }
}

fn env_var_regex() -> &'static regex::Regex {
    static REGEX: OnceLock<regex::Regex> = OnceLock::new();
    REGEX.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var regex"))
}

impl StolonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| StolonError::ConfigError {
            message: format!("cannot read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| StolonError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replaces `${VAR}` with the variable's value; unknown variables are left as written.
    fn substitute_env_vars(content: &str) -> String {
        env_var_regex()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn environment(&self, environment: Environment) -> Result<&EnvironmentConfig> {
        self.environments
            .get(environment.as_str())
            .ok_or_else(|| StolonError::UnknownEnvironment {
                name: environment.to_string(),
            })
    }

    pub fn database(&self, environment: Environment) -> Result<&DatabaseConfig> {
        self.environment(environment)?
            .database
            .as_ref()
            .ok_or_else(|| StolonError::MissingConfigError {
                field: format!("environments.{}.database", environment),
            })
    }

    pub fn service(&self, environment: Environment, service: &str) -> Result<&ServiceConfig> {
        self.environment(environment)?
            .services
            .get(service)
            .ok_or_else(|| StolonError::UnknownService {
                environment: environment.to_string(),
                service: service.to_string(),
            })
    }

    pub fn configured_environments(&self) -> Vec<Environment> {
        self.environments
            .keys()
            .filter_map(|key| key.parse().ok())
            .collect()
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("server.host", &self.server.host)?;
        validation::validate_port("server.port", self.server.port)?;
        validation::validate_range(
            "tools.ready_timeout_seconds",
            self.tools.ready_timeout_seconds,
            1,
            600,
        )?;
        validation::validate_positive_number("tools.log_buffer_lines", self.tools.log_buffer_lines, 1)?;
        validation::validate_positive_number("query.max_rows", self.query.max_rows, 1)?;
        validation::validate_range(
            "query.approval_ttl_minutes",
            self.query.approval_ttl_minutes,
            1,
            24 * 60,
        )?;

        for (i, pattern) in self.sanitize.pii_patterns.iter().enumerate() {
            validation::validate_regex(&format!("sanitize.pii_patterns[{}]", i), pattern)?;
        }

        if self.environments.is_empty() {
            return Err(StolonError::MissingConfigError {
                field: "environments".to_string(),
            });
        }

        for (key, env) in &self.environments {
            let environment: Environment =
                key.parse()
                    .map_err(|_| StolonError::InvalidConfigValueError {
                        field: "environments".to_string(),
                        value: key.clone(),
                        reason: "Expected one of: dev, demo, na-prod".to_string(),
                    })?;

            if let Some(database) = &env.database {
                let prefix = format!("environments.{}.database", environment);
                validation::validate_non_empty_string(&format!("{}.instance", prefix), &database.instance)?;
                validation::validate_non_empty_string(&format!("{}.name", prefix), &database.name)?;
                validation::validate_non_empty_string(&format!("{}.user", prefix), &database.user)?;
                if let Some(port) = database.local_port {
                    validation::validate_port(&format!("{}.local_port", prefix), port)?;
                }
                if environment.is_production() && matches!(database.password, SecretRef::Literal { .. }) {
                    return Err(StolonError::InvalidConfigValueError {
                        field: format!("{}.password", prefix),
                        value: "<literal>".to_string(),
                        reason: "Production passwords must come from a secret store".to_string(),
                    });
                }
            }

            for (name, service) in &env.services {
                let prefix = format!("environments.{}.services.{}", environment, name);
                validation::validate_non_empty_string(&format!("{}.target", prefix), &service.target)?;
                validation::validate_port(&format!("{}.remote_port", prefix), service.remote_port)?;
            }
        }

        Ok(())
    }
}

impl Validate for StolonConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[server]
port = 9000

[environments.dev]
kube_context = "gke_acme-dev_us-central1_dev"
namespace = "core"
require_approval = false

[environments.dev.database]
instance = "acme-dev:us-central1:main"
name = "app"
user = "reader"
password = { source = "onepassword", reference = "op://Dev/mysql/password" }

[environments.dev.services.billing]
target = "svc/billing"
remote_port = 8080
"#;

    #[test]
    fn test_parse_basic_config() {
        let config = StolonConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tools.kubectl, "kubectl");
        assert_eq!(config.query.max_rows, 1000);

        let dev = config.environment(Environment::Dev).unwrap();
        assert_eq!(dev.namespace, "core");
        assert!(!dev.requires_approval(Environment::Dev));

        let billing = config.service(Environment::Dev, "billing").unwrap();
        assert_eq!(billing.remote_port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_lookups() {
        let config = StolonConfig::from_toml_str(BASIC).unwrap();
        assert!(matches!(
            config.environment(Environment::NaProd),
            Err(StolonError::UnknownEnvironment { .. })
        ));
        assert!(matches!(
            config.service(Environment::Dev, "ledger"),
            Err(StolonError::UnknownService { .. })
        ));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("STOLON_TEST_SALT", "pepper");

        let config = StolonConfig::from_toml_str(
            r#"
[sanitize]
salt = "${STOLON_TEST_SALT}"

[environments.dev]
"#,
        )
        .unwrap();
        assert_eq!(config.sanitize.salt, "pepper");

        std::env::remove_var("STOLON_TEST_SALT");
    }

    #[test]
    fn test_unknown_env_var_is_left_alone() {
        let content = StolonConfig::substitute_env_vars("salt = \"${STOLON_SURELY_UNSET_VAR}\"");
        assert_eq!(content, "salt = \"${STOLON_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_config_validation() {
        let config = StolonConfig::from_toml_str("[environments.staging]\n").unwrap();
        assert!(config.validate().is_err());

        let config = StolonConfig::from_toml_str("").unwrap();
        assert!(matches!(
            config.validate(),
            Err(StolonError::MissingConfigError { .. })
        ));

        let config = StolonConfig::from_toml_str(
            r#"
[environments.na-prod.database]
instance = "acme-prod:us-east1:main"
name = "app"
user = "reader"
password = { source = "literal", value = "hunter2" }
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_always_requires_approval() {
        let config = StolonConfig::from_toml_str(
            "[environments.na-prod]\nrequire_approval = false\n",
        )
        .unwrap();
        let prod = config.environment(Environment::NaProd).unwrap();
        assert!(prod.requires_approval(Environment::NaProd));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();

        let config = StolonConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.configured_environments(), vec![Environment::Dev]);
    }
}
