//! HTTP handlers for the local API.

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::state::AppState;
use crate::core::api_gateway::ApiRequest;
use crate::core::statement;
use crate::domain::model::{Environment, QueryResult, StatementKind, WriteStatus};
use crate::utils::error::{Result, StolonError};

#[derive(Debug, Deserialize)]
pub struct PortForwardRequest {
    pub environment: Environment,
    pub service: String,
    pub local_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct CloudSqlProxyRequest {
    pub environment: Environment,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub environment: Environment,
    pub sql: String,
    pub max_rows: Option<usize>,
    #[serde(default = "default_true")]
    pub sanitize: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query_id: Uuid,
    pub sanitized: bool,
    #[serde(flatten)]
    pub result: QueryResult,
}

#[derive(Debug, Deserialize)]
pub struct LogQueryRequest {
    pub environment: Environment,
    pub sql: String,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogResultRequest {
    pub environment: Environment,
    pub query_id: Option<Uuid>,
    pub row_count: usize,
    pub sample: Option<serde_json::Value>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteQueryRequest {
    pub environment: Environment,
    pub sql: String,
    pub requested_by: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approver: String,
}

fn default_true() -> bool {
    true
}

/// `GET /health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let processes = state.tunnels.registry().list().await.len();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "processes": processes,
    }))
}

/// `GET /processes`
pub async fn list_processes(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.tunnels.registry().list().await)
}

/// `DELETE /processes/{name}`
pub async fn stop_process(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let record = state.tunnels.stop(&name).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// `GET /processes/{name}/logs`
pub async fn process_logs(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let lines = state
        .tunnels
        .registry()
        .logs(&name)
        .await
        .ok_or_else(|| StolonError::NotFound {
            what: format!("process '{}'", name),
        })?;
    Ok(HttpResponse::Ok().json(lines))
}

/// `POST /port-forward`
pub async fn start_port_forward(
    state: web::Data<AppState>,
    body: web::Json<PortForwardRequest>,
) -> Result<HttpResponse> {
    let record = state
        .tunnels
        .ensure_port_forward(body.environment, &body.service, body.local_port)
        .await?;
    Ok(HttpResponse::Ok().json(record))
}

/// `POST /cloud-sql-proxy`
pub async fn start_cloud_sql_proxy(
    state: web::Data<AppState>,
    body: web::Json<CloudSqlProxyRequest>,
) -> Result<HttpResponse> {
    let record = state
        .tunnels
        .ensure_cloud_sql_proxy(body.environment, body.port)
        .await?;
    Ok(HttpResponse::Ok().json(record))
}

/// `POST /query`
///
/// Runs one read statement. Results are sanitized unless the caller opts out,
/// which production ignores. The query and a sanitized sample of the result
/// are written to the query log.
pub async fn run_query(
    state: web::Data<AppState>,
    body: web::Json<QueryRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    if statement::classify(&request.sql)? == StatementKind::Write {
        return Err(StolonError::InvalidStatement {
            message: "write statements must go through /write-query".to_string(),
        });
    }
    state.config.environment(request.environment)?;

    let sanitize = request.sanitize || request.environment.is_production();
    if !request.sanitize && sanitize {
        tracing::warn!(environment = %request.environment, "raw results are not available here");
    }
    let max_rows = request
        .max_rows
        .unwrap_or(state.config.query.max_rows)
        .clamp(1, state.config.query.max_rows);

    let logged = state
        .query_log
        .log_query(request.environment, &request.sql, None)
        .await?;

    let result = state
        .executor
        .fetch(request.environment, &request.sql, max_rows)
        .await?;
    let result = if sanitize {
        state.sanitizer.sanitize_result(result)
    } else {
        result
    };

    let sample: Vec<serde_json::Value> = result
        .records()
        .into_iter()
        .take(state.config.query.sample_rows)
        .map(serde_json::Value::Object)
        .collect();
    let sample = state
        .sanitizer
        .sanitize_json(&serde_json::Value::Array(sample));
    state
        .query_log
        .log_result(
            request.environment,
            Some(logged.id),
            result.row_count,
            Some(sample),
            result.truncated.then(|| "truncated".to_string()),
        )
        .await?;

    Ok(HttpResponse::Ok().json(QueryResponse {
        query_id: logged.id,
        sanitized: sanitize,
        result,
    }))
}

/// `POST /log/query`
pub async fn log_query(
    state: web::Data<AppState>,
    body: web::Json<LogQueryRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    let entry = state
        .query_log
        .log_query(request.environment, &request.sql, request.note)
        .await?;
    Ok(HttpResponse::Created().json(entry))
}

/// `POST /log/result`
pub async fn log_result(
    state: web::Data<AppState>,
    body: web::Json<LogResultRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    let sample = request.sample.map(|s| state.sanitizer.sanitize_json(&s));
    let entry = state
        .query_log
        .log_result(
            request.environment,
            request.query_id,
            request.row_count,
            sample,
            request.note,
        )
        .await?;
    Ok(HttpResponse::Created().json(entry))
}

/// `POST /write-query`
pub async fn submit_write(
    state: web::Data<AppState>,
    body: web::Json<WriteQueryRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    let write = state
        .approvals
        .submit(
            request.environment,
            &request.sql,
            &request.requested_by,
            request.reason,
        )
        .await?;

    Ok(match write.status {
        WriteStatus::Pending => HttpResponse::Accepted().json(write),
        _ => HttpResponse::Ok().json(write),
    })
}

/// `GET /write-query`
pub async fn list_writes(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.approvals.list().await)
}

/// `POST /write-query/{id}/approve`
pub async fn approve_write(
    state: web::Data<AppState>,
    id: web::Path<Uuid>,
    body: web::Json<DecisionRequest>,
) -> Result<HttpResponse> {
    let write = state.approvals.approve(*id, &body.approver).await?;
    Ok(HttpResponse::Ok().json(write))
}

/// `POST /write-query/{id}/reject`
pub async fn reject_write(
    state: web::Data<AppState>,
    id: web::Path<Uuid>,
    body: web::Json<DecisionRequest>,
) -> Result<HttpResponse> {
    let write = state.approvals.reject(*id, &body.approver).await?;
    Ok(HttpResponse::Ok().json(write))
}

/// `POST /api/{environment}/{service}`
pub async fn api_request(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<ApiRequest>,
) -> Result<HttpResponse> {
    let (environment, service) = path.into_inner();
    let environment: Environment = environment.parse()?;
    let response = state
        .gateway
        .request(environment, &service, &body)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}
