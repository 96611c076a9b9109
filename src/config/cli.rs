use crate::domain::model::Environment;
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "stolon")]
#[command(about = "Sanitized access to internal databases and APIs across environments")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "STOLON_CONFIG", default_value = "stolon.toml", global = true)]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the local HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Port-forward a service until interrupted
    Forward {
        #[arg(value_enum)]
        environment: Environment,
        service: String,
        #[arg(long)]
        local_port: Option<u16>,
    },

    /// Run the CloudSQL proxy for an environment until interrupted
    Proxy {
        #[arg(value_enum)]
        environment: Environment,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one read query and print sanitized rows as JSON
    Query {
        #[arg(value_enum)]
        environment: Environment,
        sql: String,
        #[arg(long)]
        max_rows: Option<usize>,
        /// Skip sanitization (refused for na-prod)
        #[arg(long)]
        raw: bool,
    },

    /// List tunnel processes recorded in the state file
    Ps,

    /// Stop recorded tunnel processes
    Stop {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// Check that the external tools are installed
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::parse_from([
            "stolon",
            "--config",
            "other.toml",
            "query",
            "prod",
            "SELECT 1",
            "--max-rows",
            "10",
        ]);
        assert_eq!(cli.config, "other.toml");
        match cli.command {
            Command::Query {
                environment,
                sql,
                max_rows,
                raw,
            } => {
                assert_eq!(environment, Environment::NaProd);
                assert_eq!(sql, "SELECT 1");
                assert_eq!(max_rows, Some(10));
                assert!(!raw);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_stop_name_conflicts_with_all() {
        assert!(Cli::try_parse_from(["stolon", "stop", "cloud-sql-proxy:dev", "--all"]).is_err());
        assert!(Cli::try_parse_from(["stolon", "stop", "--all"]).is_ok());
    }
}
