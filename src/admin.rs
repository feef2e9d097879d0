//! Admin API for provisioning and inspecting team instances
//!
//! Bound to localhost and protected by a bearer token. Except for `/health`
//! and `/version`, every route requires `Authorization: Bearer <token>`.

use crate::identity::{TeamId, TeamIdentity};
use crate::orchestrator::{OrchestratorError, SharedOrchestrator};
use crate::status_cache::StatusCache;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body the admin API reads
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

#[derive(Debug, Deserialize)]
struct PasscodeBody {
    passcode_hash: String,
}

/// Everything an admin request can touch
pub struct AdminState {
    orchestrator: SharedOrchestrator,
    status: Arc<StatusCache>,
    identity: TeamIdentity,
    auth_token: String,
}

impl AdminState {
    pub fn new(
        orchestrator: SharedOrchestrator,
        status: Arc<StatusCache>,
        identity: TeamIdentity,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            status,
            identity,
            auth_token: auth_token.into(),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_admin_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

pub async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            return json_response(
                StatusCode::OK,
                serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                }),
            )
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    if path == "/teams" {
        return match method {
            Method::GET => list_teams(state).await,
            _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        };
    }

    let Some(rest) = path.strip_prefix("/teams/") else {
        return response(StatusCode::NOT_FOUND, "not found");
    };
    let (name, action) = match rest.split_once('/') {
        Some((name, action)) => (name, Some(action)),
        None => (rest, None),
    };
    let Some(team) = TeamId::parse(name) else {
        return json_error(StatusCode::BAD_REQUEST, format!("invalid team name '{}'", name));
    };

    match (method, action) {
        (Method::POST, None) => match read_passcode(req).await {
            Ok(body) => create_team(state, &team, &body.passcode_hash).await,
            Err(resp) => resp,
        },
        (Method::GET, Some("status")) => team_status(state, &team).await,
        (Method::PUT, Some("passcode")) => match read_passcode(req).await {
            Ok(body) => change_passcode(state, &team, &body.passcode_hash).await,
            Err(resp) => resp,
        },
        (Method::DELETE, Some("instance")) => restart_instance(state, &team).await,
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn read_passcode<B>(req: Request<B>) -> Result<PasscodeBody, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Stop reading as soon as the body passes the limit
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
        Err(e) => {
            return Err(json_error(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e)));
        }
    };

    let body: PasscodeBody = serde_json::from_slice(&bytes)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e)))?;
    if body.passcode_hash.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "passcode_hash must not be empty"));
    }
    Ok(body)
}

fn orchestrator_error(e: OrchestratorError) -> Response<Full<Bytes>> {
    let status = match &e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyExists(_) => StatusCode::CONFLICT,
        OrchestratorError::Backend(_) => StatusCode::BAD_GATEWAY,
    };
    json_error(status, e.to_string())
}

async fn list_teams(state: &AdminState) -> Response<Full<Bytes>> {
    match state.orchestrator.list_instances().await {
        Ok(instances) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "count": instances.len(),
                "teams": instances,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Failed to list instances");
            orchestrator_error(e)
        }
    }
}

async fn create_team(state: &AdminState, team: &TeamId, passcode_hash: &str) -> Response<Full<Bytes>> {
    if let Err(e) = state.orchestrator.create_deployment(team, passcode_hash).await {
        warn!(team = %team, error = %e, "Failed to create instance");
        return orchestrator_error(e);
    }
    if let Err(e) = state.orchestrator.create_service(team).await {
        warn!(team = %team, error = %e, "Failed to expose instance, removing it");
        // An unreachable instance would make every retry fail with a conflict
        if let Err(cleanup) = state.orchestrator.delete_deployment(team).await {
            error!(team = %team, error = %cleanup, "Failed to remove half-created instance");
        }
        return orchestrator_error(e);
    }
    state.status.invalidate(team);

    info!(team = %team, "Created team instance");
    json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "team": team.as_str(),
            "cookie_name": state.identity.cookie_name(),
            "credential": state.identity.credential_for(team),
        }),
    )
}

async fn team_status(state: &AdminState, team: &TeamId) -> Response<Full<Bytes>> {
    let body = match state.status.peek(team) {
        Some(entry) => serde_json::json!({
            "team": team.as_str(),
            "status": entry.status,
            "cached": true,
            "age_ms": entry.fetched_at.elapsed().as_millis() as u64,
        }),
        None => serde_json::json!({
            "team": team.as_str(),
            "status": state.status.get_status(team).await,
            "cached": false,
            "age_ms": 0,
        }),
    };
    json_response(StatusCode::OK, body)
}

async fn change_passcode(state: &AdminState, team: &TeamId, passcode_hash: &str) -> Response<Full<Bytes>> {
    match state.orchestrator.change_passcode_hash(team, passcode_hash).await {
        Ok(()) => {
            info!(team = %team, "Changed team passcode");
            json_response(StatusCode::OK, serde_json::json!({ "team": team.as_str() }))
        }
        Err(e) => orchestrator_error(e),
    }
}

async fn restart_instance(state: &AdminState, team: &TeamId) -> Response<Full<Bytes>> {
    match state.orchestrator.delete_instance_pod(team).await {
        Ok(()) => {
            state.status.invalidate(team);
            info!(team = %team, "Restarted team instance");
            response(StatusCode::ACCEPTED, "restarting")
        }
        Err(e) => orchestrator_error(e),
    }
}
