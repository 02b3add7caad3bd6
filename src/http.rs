//! HTTP surface (spec §6): `/health`, `/status`, `/machines/allocate`,
//! `/machines/status`, `/ping`, `/webhook/lifecycle`.
//!
//! Structurally identical to the teacher's `http_api.rs` -- `service_fn`
//! over a raw `hyper` connection, `json_response`/`read_json_body`
//! helpers, route dispatch via `match (method,
//! segments.as_slice())` -- generalized from sandbox CRUD to the
//! allocation/status/ping/webhook surface spec §6 defines. Auth itself is
//! out of scope (spec §1); `AuthExtractor` is the seam a caller plugs a
//! real identity resolver into, mirroring how the teacher's `enterprise`
//! feature isolates `identity/mod.rs` behind a feature gate rather than
//! baking auth into the HTTP layer.

use crate::allocator::{AllocationOutcome, Allocator};
use crate::cloud::CloudAdapter;
use crate::errors::OrchestratorError;
use crate::lifecycle::LifecycleReactor;
use crate::liveness::LivenessGateway;
use crate::store::StateStore;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Resolved identity for a request (spec §1: auth resolution itself is an
/// external collaborator; this struct is the seam it populates).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub is_admin: bool,
}

/// Pluggable identity resolver. The default permissive extractor trusts an
/// `X-User-Id`/`X-Admin` header pair, suitable for development and for
/// embedding behind a reverse proxy that already authenticated the caller.
#[async_trait]
pub trait AuthExtractor: Send + Sync {
    async fn extract(&self, req: &Request<Incoming>) -> RequestContext;
}

pub struct HeaderAuthExtractor;

#[async_trait]
impl AuthExtractor for HeaderAuthExtractor {
    async fn extract(&self, req: &Request<Incoming>) -> RequestContext {
        let user_id = req
            .headers()
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let is_admin = req
            .headers()
            .get("x-admin")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "true");
        RequestContext { user_id, is_admin }
    }
}

/// Success responses are the raw data object (spec §6's table shows
/// `{instanceId, publicUrl}`, not an enveloped wrapper). Only the
/// error/processing path uses the `{status, message, errorKind}` shape
/// from spec §7.
#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "errorKind")]
    error_kind: Option<String>,
}

impl ErrorBody {
    fn processing() -> Self {
        Self {
            status: "processing",
            message: None,
            error_kind: None,
        }
    }

    fn error(err: &OrchestratorError) -> Self {
        Self {
            status: "error",
            message: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "activeUsers")]
    active_users: u64,
    #[serde(rename = "warmSpares")]
    warm_spares: u64,
    #[serde(rename = "totalInstances")]
    total_instances: i32,
    #[serde(rename = "asgCapacity")]
    asg_capacity: i32,
}

#[derive(Debug, Serialize)]
struct AllocateResponse {
    #[serde(rename = "instanceId")]
    instance_id: String,
    #[serde(rename = "publicUrl")]
    public_url: String,
}

#[derive(Debug, Serialize)]
struct MachineStatusResponse {
    #[serde(rename = "instanceId")]
    instance_id: String,
    #[serde(rename = "publicUrl")]
    public_url: String,
    state: String,
    #[serde(rename = "lastSeen")]
    last_seen: i64,
}

#[derive(Debug, Deserialize)]
struct PingRequest {
    #[serde(rename = "instanceId")]
    instance_id: String,
}

#[derive(Debug, Serialize)]
struct PingResponse {
    ok: bool,
    timestamp: i64,
}

/// Provider lifecycle event envelope (spec §6: already authenticated by
/// the provider's signature by the time it reaches the core).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum LifecycleEvent {
    InstanceLaunch { #[serde(rename = "instanceId")] instance_id: String },
    InstanceTerminate { #[serde(rename = "instanceId")] instance_id: String },
}

/// Shared application state for the HTTP server.
pub struct AppState {
    pub allocator: Arc<Allocator>,
    pub store: Arc<dyn StateStore>,
    pub cloud: Arc<dyn CloudAdapter>,
    pub liveness: Arc<LivenessGateway>,
    pub lifecycle: Arc<LifecycleReactor>,
    pub auth: Arc<dyn AuthExtractor>,
    pub asg_name: String,
    pub started_at: Instant,
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn error_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        OrchestratorError::NotFound(_) | OrchestratorError::BadInstance(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        OrchestratorError::NoCapacity => StatusCode::ACCEPTED,
        OrchestratorError::TransientUpstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

fn error_response(err: OrchestratorError) -> Response<BoxBody> {
    json_response(error_status(&err), &ErrorBody::error(&err))
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| {
            json_response(
                StatusCode::BAD_REQUEST,
                &ErrorBody::error(&OrchestratorError::BadInstance(
                    "failed to read request body".to_string(),
                )),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body_bytes).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            &ErrorBody::error(&OrchestratorError::BadInstance(format!("invalid JSON: {e}"))),
        )
    })
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let ctx = state.auth.extract(&req).await;

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => handle_health(&state),
        (Method::GET, ["status"]) => handle_status(&state, &ctx).await,
        (Method::POST, ["machines", "allocate"]) => handle_allocate(&state, &ctx).await,
        (Method::GET, ["machines", "status"]) => handle_machine_status(&state, &ctx).await,
        (Method::POST, ["ping"]) => handle_ping(req, &state).await,
        (Method::POST, ["webhook", "lifecycle"]) => handle_webhook(req, &state).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorBody::error(&OrchestratorError::NotFound("route".to_string())),
        ),
    };

    Ok(response)
}

fn handle_health(state: &AppState) -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "ok",
            uptime_seconds: state.started_at.elapsed().as_secs(),
        },
    )
}

async fn handle_status(state: &AppState, ctx: &RequestContext) -> Response<BoxBody> {
    if !ctx.is_admin {
        return error_response(OrchestratorError::NotAuthenticated);
    }

    let active_users = match state.store.active_count().await {
        Ok(n) => n,
        Err(e) => return error_response(OrchestratorError::from(e)),
    };
    let warm_spares = match state.store.pool_size().await {
        Ok(n) => n,
        Err(e) => return error_response(OrchestratorError::from(e)),
    };
    let asg = match state.cloud.describe_asg(&state.asg_name).await {
        Ok(asg) => asg,
        Err(e) => return error_response(OrchestratorError::from(e)),
    };

    json_response(
        StatusCode::OK,
        &StatusResponse {
            active_users,
            warm_spares,
            total_instances: asg.instances.len() as i32,
            asg_capacity: asg.desired_capacity,
        },
    )
}

async fn handle_allocate(state: &AppState, ctx: &RequestContext) -> Response<BoxBody> {
    let user_id = match &ctx.user_id {
        Some(u) => u.clone(),
        None => return error_response(OrchestratorError::NotAuthenticated),
    };

    match state.allocator.allocate(&user_id, now_ms()).await {
        Ok(AllocationOutcome::Bound {
            instance_id,
            public_endpoint,
            ..
        }) => json_response(
            StatusCode::OK,
            &AllocateResponse {
                instance_id,
                public_url: public_endpoint,
            },
        ),
        Ok(AllocationOutcome::Processing) => {
            json_response(StatusCode::ACCEPTED, &ErrorBody::processing())
        }
        Err(e) => error_response(e),
    }
}

async fn handle_machine_status(state: &AppState, ctx: &RequestContext) -> Response<BoxBody> {
    let user_id = match &ctx.user_id {
        Some(u) => u.clone(),
        None => return error_response(OrchestratorError::NotAuthenticated),
    };

    match state.store.get_workspace(&user_id).await {
        Ok(Some(ws)) => json_response(
            StatusCode::OK,
            &MachineStatusResponse {
                instance_id: ws.instance_id,
                public_url: ws.public_endpoint,
                state: ws.state.to_string(),
                last_seen: ws.last_seen,
            },
        ),
        Ok(None) => error_response(OrchestratorError::NotFound(format!(
            "no workspace for {user_id}"
        ))),
        Err(e) => error_response(OrchestratorError::from(e)),
    }
}

async fn handle_ping(req: Request<Incoming>, state: &AppState) -> Response<BoxBody> {
    let body: PingRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let now = now_ms();
    match state.liveness.ping(&body.instance_id, now).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &PingResponse {
                ok: true,
                timestamp: now,
            },
        ),
        Err(e) => error_response(e),
    }
}

/// Acknowledges immediately; the reactor dispatch (readiness polling or
/// cleanup) is spawned as a detached task so the provider's retry timer
/// never sees this handler block on the readiness poll (spec §4.6, §4.10).
async fn handle_webhook(req: Request<Incoming>, state: &AppState) -> Response<BoxBody> {
    let event: LifecycleEvent = match read_json_body(req).await {
        Ok(e) => e,
        Err(resp) => return resp,
    };

    let lifecycle = state.lifecycle.clone();
    tokio::spawn(async move {
        match event {
            LifecycleEvent::InstanceLaunch { instance_id } => {
                lifecycle.on_instance_launch(&instance_id).await;
            }
            LifecycleEvent::InstanceTerminate { instance_id } => {
                lifecycle.on_instance_terminate(&instance_id).await;
            }
        }
    });

    json_response(StatusCode::OK, &WebhookAck { status: "accepted" })
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    status: &'static str,
}

/// Runs the HTTP server until the listener errors.
pub async fn run_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %err, "error serving connection");
            }
        });
    }
}
