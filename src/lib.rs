pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::Cli;

pub use app::AppState;
pub use config::StolonConfig;
pub use domain::model::Environment;
pub use utils::error::{Result, StolonError};
