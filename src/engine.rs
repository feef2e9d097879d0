//! Per-request routing decisions
//!
//! Every request that is not for the landing page runs through
//! [`ProxyEngine::handle`]: find the team, check its instance status, then
//! either forward to the instance or send the caller back to the landing
//! page with a hint about what went wrong. The engine keeps no state of its
//! own between requests; everything lives in the two caches.

use crate::activity::ActivityDebouncer;
use crate::config::BalancerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::identity::{TeamId, TeamIdentity};
use crate::orchestrator::SharedOrchestrator;
use crate::status_cache::{InstanceStatus, StatusCache};
use crate::transport::{full_body, ProxyBody, Transport, UpstreamResolver};
use hyper::header::HeaderValue;
use hyper::HeaderMap;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Outcome for a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Hand the request to the team's instance
    Forward(TeamId),
    /// No usable team credential
    RedirectNoCredential,
    /// The instance exists but is not ready
    RedirectRestarting(TeamId),
    /// The team has no instance, or the lookup failed
    RedirectNotFound(TeamId),
}

impl Decision {
    pub fn for_status(team: TeamId, status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Ready => Decision::Forward(team),
            InstanceStatus::Restarting => Decision::RedirectRestarting(team),
            InstanceStatus::Missing => Decision::RedirectNotFound(team),
        }
    }

    /// Redirect target relative to the landing page, `None` for forwards
    pub fn location(&self, landing_path: &str) -> Option<String> {
        match self {
            Decision::Forward(_) => None,
            Decision::RedirectNoCredential => Some(landing_path.to_string()),
            Decision::RedirectRestarting(team) => Some(landing_location(landing_path, "instance-restarting", team)),
            Decision::RedirectNotFound(team) => Some(landing_location(landing_path, "instance-not-found", team)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Forward(_) => "forward",
            Decision::RedirectNoCredential => "no-credential",
            Decision::RedirectRestarting(_) => "restarting",
            Decision::RedirectNotFound(_) => "not-found",
        }
    }
}

fn landing_location(landing_path: &str, msg: &str, team: &TeamId) -> String {
    format!(
        "{}?msg={}&teamname={}",
        landing_path,
        msg,
        urlencoding::encode(team.as_str())
    )
}

/// 302 response pointing at `location`
pub fn redirect(location: &str) -> Response<ProxyBody> {
    let Ok(location_header) = HeaderValue::from_str(location) else {
        warn!(location, "Redirect target is not a valid header value");
        return json_error_response(ProxyErrorCode::InternalError, "Invalid redirect target");
    };

    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location_header)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(format!("Found. Redirecting to {}", location)))
        .expect("valid redirect response")
}

/// Connection facts that travel with a forwarded request
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientContext {
    pub addr: Option<SocketAddr>,
    pub is_tls: bool,
}

pub struct ProxyEngine<B> {
    identity: TeamIdentity,
    status: Arc<StatusCache>,
    activity: Arc<ActivityDebouncer>,
    upstreams: UpstreamResolver,
    transport: Arc<dyn Transport<B>>,
    landing_path: String,
}

impl<B: Send + 'static> ProxyEngine<B> {
    pub fn new(
        identity: TeamIdentity,
        status: Arc<StatusCache>,
        activity: Arc<ActivityDebouncer>,
        upstreams: UpstreamResolver,
        transport: Arc<dyn Transport<B>>,
        landing_path: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            status,
            activity,
            upstreams,
            transport,
            landing_path: landing_path.into(),
        }
    }

    /// Wire the engine, its caches and the orchestrator from configuration
    pub fn from_config(
        config: &BalancerConfig,
        orchestrator: SharedOrchestrator,
        transport: Arc<dyn Transport<B>>,
    ) -> Self {
        let window = config.freshness_window();
        let status = StatusCache::new(Arc::clone(&orchestrator), window)
            .with_coalescing(config.coalesce_lookups);
        let activity = ActivityDebouncer::new(orchestrator, window);

        Self::new(
            TeamIdentity::from_config(config),
            Arc::new(status),
            Arc::new(activity),
            UpstreamResolver::new(&config.upstream),
            transport,
            &config.landing_path,
        )
    }

    pub fn status_cache(&self) -> &Arc<StatusCache> {
        &self.status
    }

    pub fn identity(&self) -> &TeamIdentity {
        &self.identity
    }

    pub fn landing_path(&self) -> &str {
        &self.landing_path
    }

    /// Classify a request by its headers. Reads the status cache once when a
    /// team is present
    pub async fn decide(&self, headers: &HeaderMap) -> Decision {
        let Some(team) = self.identity.extract(headers) else {
            return Decision::RedirectNoCredential;
        };
        let status = self.status.get_status(&team).await;
        Decision::for_status(team, status)
    }

    pub async fn handle(&self, mut req: Request<B>, client: ClientContext) -> Response<ProxyBody> {
        let decision = self.decide(req.headers()).await;
        debug!(
            decision = decision.label(),
            method = %req.method(),
            uri = %req.uri(),
            "Request decision"
        );

        let team = match decision {
            Decision::Forward(team) => team,
            redirect_decision => {
                let location = redirect_decision
                    .location(&self.landing_path)
                    .unwrap_or_else(|| self.landing_path.clone());
                return redirect(&location);
            }
        };

        self.activity.mark_active(&team).await;

        let upstream = match self.upstreams.resolve(&team) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(team = %team, error = %e, "Cannot resolve instance address");
                return e.into_response();
            }
        };

        attach_context(&mut req, &team, client);

        match self.transport.forward(&upstream, req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(team = %team, error = %e, "Forwarding failed");
                e.into_response()
            }
        }
    }
}

/// Add routing headers and the team to a request about to be forwarded.
///
/// X-Forwarded-* headers are overwritten rather than appended; this proxy is
/// the first trusted hop.
fn attach_context<B>(req: &mut Request<B>, team: &TeamId, client: ClientContext) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Some(addr) = client.addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if client.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    req.extensions_mut().insert(team.clone());
}
