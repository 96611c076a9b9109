use actix_web::{web, App, HttpServer};

use crate::app::handlers;
use crate::app::state::AppState;
use crate::utils::error::{Result, StolonError};

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health))
        .route("/processes", web::get().to(handlers::list_processes))
        .route("/processes/{name}", web::delete().to(handlers::stop_process))
        .route("/processes/{name}/logs", web::get().to(handlers::process_logs))
        .route("/port-forward", web::post().to(handlers::start_port_forward))
        .route("/cloud-sql-proxy", web::post().to(handlers::start_cloud_sql_proxy))
        .route("/query", web::post().to(handlers::run_query))
        .route("/log/query", web::post().to(handlers::log_query))
        .route("/log/result", web::post().to(handlers::log_result))
        .route("/write-query", web::post().to(handlers::submit_write))
        .route("/write-query", web::get().to(handlers::list_writes))
        .route("/write-query/{id}/approve", web::post().to(handlers::approve_write))
        .route("/write-query/{id}/reject", web::post().to(handlers::reject_write))
        .route("/api/{environment}/{service}", web::post().to(handlers::api_request));
}

/// Malformed JSON bodies get the same error shape as every other failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(1024 * 1024)
        .error_handler(|err, _req| {
            StolonError::ValidationError {
                message: err.to_string(),
            }
            .into()
        })
}

/// Serves until interrupted, then stops every tunnel this server started.
pub async fn run(state: AppState, host: &str, port: u16) -> Result<()> {
    let data = web::Data::new(state);
    let app_data = data.clone();

    tracing::info!("local API listening on http://{}:{}", host, port);
    HttpServer::new(move || {
        App::new()
            .app_data(app_data.clone())
            .app_data(json_config())
            .configure(routes)
    })
    .bind((host, port))?
    .run()
    .await?;

    let stopped = data.tunnels.stop_all().await;
    tracing::info!("shut down, stopped {} tunnel(s)", stopped.len());
    Ok(())
}
