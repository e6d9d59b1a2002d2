//! Request handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, RawQuery, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::deploy::webhook::{EVENT_HEADER, SIGNATURE_HEADER};
use crate::deploy::WebhookOutcome;
use crate::error::ValidationErrors;
use crate::model::{
    CommitInfo, DeploymentId, Repository, ResourceId, ResourceSpec, ServerId, SharedPath, Site,
    SiteId,
};
use crate::provision::StepReport;
use crate::status::Operation;

const TOKEN_HEADER: &str = "x-hostwright-token";

pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        // Host-facing, signed
        .route("/servers/{id}/provision/script", get(provision_script))
        .route("/servers/{id}/provision/step", post(provision_step))
        .route("/sites/{id}/webhook", post(webhook))
        // Management
        .route("/servers", post(register_server))
        .route("/servers/{id}/provision/retry", post(retry_provisioning))
        .route("/servers/{id}/resources", post(install_resource))
        .route("/servers/{id}/sites", post(add_site))
        .route(
            "/resources/{id}",
            axum::routing::patch(update_resource).delete(remove_resource),
        )
        .route("/resources/{id}/{operation}", post(resource_operation))
        .route("/sites/{id}/deployments", post(deploy_site))
        .route("/deployments/{id}", get(deployment_status))
}

/// Grants access to management endpoints.
pub struct Authenticated(pub Arc<AppState>);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.api_token else {
            return Ok(Authenticated(Arc::clone(state)));
        };

        let provided = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        match provided {
            Some(token) if token == expected => Ok(Authenticated(Arc::clone(state))),
            Some(_) => Err(unauthorized("Invalid API token")),
            None => Err(unauthorized("Missing X-Hostwright-Token header")),
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Fields of a form or JSON body. JSON numbers are kept as their text.
fn body_fields(headers: &HeaderMap, body: &[u8]) -> Result<Vec<(String, String)>, ApiError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return Ok(url::form_urlencoded::parse(body).into_owned().collect());
    }

    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(map) = value else {
        return Err(ValidationErrors::single("body", "The body must be a JSON object.").into());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            _ => None,
        })
        .collect())
}

fn field<'a>(name: &str, sources: [&'a [(String, String)]; 2]) -> Option<&'a str> {
    sources
        .into_iter()
        .find_map(|pairs| pairs.iter().find(|(k, _)| k == name))
        .map(|(_, v)| v.as_str())
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "hostwright",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /servers/{id}/provision/script (signed)
async fn provision_script(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<ServerId>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    state
        .provisioner
        .verify_script_request(server_id, &query_pairs(query.as_deref()))?;
    let script = state.provisioner.bootstrap_script(server_id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/x-shellscript; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        script,
    )
        .into_response())
}

/// POST /servers/{id}/provision/step (signed)
///
/// `step` and `status` come from the body or the query string.
async fn provision_step(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<ServerId>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let query = query_pairs(query.as_deref());
    state.provisioner.verify_callback(server_id, &query)?;

    let body = body_fields(&headers, &body)?;
    let report = StepReport::parse(
        field("step", [body.as_slice(), query.as_slice()]),
        field("status", [body.as_slice(), query.as_slice()]),
    )?;
    let server = state.provisioner.record_step(server_id, report).await?;

    Ok(Json(json!({
        "ok": true,
        "provision_status": server.provision_status,
    })))
}

/// POST /sites/{id}/webhook (HMAC signed)
async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<SiteId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let outcome = state
        .deployer
        .handle_webhook(site_id, header_value(EVENT_HEADER), header_value(SIGNATURE_HEADER), &body)
        .await?;

    let response = match outcome {
        WebhookOutcome::Pong => (StatusCode::OK, Json(json!({ "pong": true }))),
        WebhookOutcome::Deployed { deployment } => (
            StatusCode::CREATED,
            Json(json!({ "deployed": true, "deployment": deployment })),
        ),
        WebhookOutcome::Ignored { reason } => (
            StatusCode::ACCEPTED,
            Json(json!({ "deployed": false, "reason": reason })),
        ),
    };
    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
struct RegisterServer {
    name: String,
    ip_address: String,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// POST /servers
async fn register_server(
    Authenticated(state): Authenticated,
    Json(request): Json<RegisterServer>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let registration = state
        .provisioner
        .register(&request.name, &request.ip_address, request.ssh_port)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "server": registration.server,
            "script_url": registration.script_url.as_str(),
            "command": registration.command,
        })),
    ))
}

/// POST /servers/{id}/provision/retry
async fn retry_provisioning(
    Authenticated(state): Authenticated,
    Path(server_id): Path<ServerId>,
) -> Result<Json<Value>, ApiError> {
    let server = state.provisioner.retry_provisioning(server_id).await?;
    let script_url = state.provisioner.script_url(server_id)?;
    Ok(Json(json!({
        "server": server,
        "script_url": script_url.as_str(),
    })))
}

/// POST /servers/{id}/resources
async fn install_resource(
    Authenticated(state): Authenticated,
    Path(server_id): Path<ServerId>,
    Json(spec): Json<ResourceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state.resources.request_install(server_id, spec).await?;
    Ok((StatusCode::ACCEPTED, Json(resource)))
}

/// PATCH /resources/{id}
async fn update_resource(
    Authenticated(state): Authenticated,
    Path(resource_id): Path<ResourceId>,
    Json(target): Json<ResourceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state.resources.request_update(resource_id, target).await?;
    Ok((StatusCode::ACCEPTED, Json(resource)))
}

/// DELETE /resources/{id}
async fn remove_resource(
    Authenticated(state): Authenticated,
    Path(resource_id): Path<ResourceId>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state.resources.request_remove(resource_id).await?;
    Ok((StatusCode::ACCEPTED, Json(resource)))
}

/// POST /resources/{id}/{operation}
async fn resource_operation(
    Authenticated(state): Authenticated,
    Path((resource_id, operation)): Path<(ResourceId, Operation)>,
) -> Result<impl IntoResponse, ApiError> {
    let resources = &state.resources;
    let resource = match operation {
        Operation::Retry => resources.retry(resource_id).await?,
        Operation::CancelUpdate => resources.cancel_update(resource_id).await?,
        Operation::Disable => resources.disable(resource_id).await?,
        Operation::Enable => resources.enable(resource_id).await?,
        Operation::MakeCliDefault => resources.make_cli_default(resource_id).await?,
        Operation::Install | Operation::Update | Operation::Remove => {
            return Err(ValidationErrors::single(
                "operation",
                format!(
                    "Use POST /servers/{{id}}/resources, PATCH or DELETE on the resource to {}.",
                    operation
                ),
            )
            .into());
        }
    };
    Ok((StatusCode::ACCEPTED, Json(resource)))
}

#[derive(Debug, Deserialize)]
struct NewSite {
    domain: String,
    #[serde(default)]
    repository: Option<Repository>,
    #[serde(default)]
    php_version: Option<String>,
    #[serde(default)]
    node_version: Option<String>,
    #[serde(default)]
    database_id: Option<ResourceId>,
    #[serde(default)]
    deployment_script: String,
    #[serde(default)]
    shared_paths: Option<Vec<SharedPath>>,
    #[serde(default)]
    run_migrations: bool,
    #[serde(default)]
    auto_deploy: bool,
}

/// POST /servers/{id}/sites
///
/// The webhook secret is only returned here.
async fn add_site(
    Authenticated(state): Authenticated,
    Path(server_id): Path<ServerId>,
    Json(request): Json<NewSite>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut site = Site::new(server_id, request.domain.trim().to_ascii_lowercase());
    site.repository = request.repository;
    site.php_version = request.php_version;
    site.node_version = request.node_version;
    site.database_id = request.database_id;
    site.deployment_script = request.deployment_script;
    if let Some(paths) = request.shared_paths {
        site.shared_paths = paths;
    }
    site.run_migrations = request.run_migrations;
    site.auto_deploy = request.auto_deploy;

    let site = state.deployer.add_site(site).await?;
    let secret = site.webhook_secret.clone();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "site": site, "webhook_secret": secret })),
    ))
}

/// POST /sites/{id}/deployments
async fn deploy_site(
    Authenticated(state): Authenticated,
    Path(site_id): Path<SiteId>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let commit: CommitInfo = if body.is_empty() {
        CommitInfo::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let deployment = state.deployer.trigger(site_id, commit).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment.view())))
}

/// GET /deployments/{id}
async fn deployment_status(
    Authenticated(state): Authenticated,
    Path(deployment_id): Path<DeploymentId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.deployer.status(deployment_id).await?))
}
