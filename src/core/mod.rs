pub mod api_gateway;
pub mod approval;
pub mod query;
pub mod query_log;
pub mod registry;
pub mod sanitize;
pub mod secrets;
pub mod statement;
pub mod tunnel;

pub use crate::domain::model::{Environment, ProcessRecord, QueryResult};
pub use crate::domain::ports::{QueryExecutor, SecretStore};
pub use crate::utils::error::Result;
