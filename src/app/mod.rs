// Application layer: the local HTTP API over the core services.

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use server::{routes, run};
pub use state::AppState;
