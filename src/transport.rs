//! Forwarding requests to a team's instance

use crate::error::{json_error_response, ProxyErrorCode};
use crate::identity::TeamId;
use crate::pool::{ConnectionPool, PoolError};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::http::uri::Authority;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Response body type produced by the balancer
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Where a team's traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub team: TeamId,
    pub authority: Authority,
}

/// Builds upstream addresses from a URL template such as `http://{team}-instance:3000`
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    template: String,
}

impl UpstreamResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn resolve(&self, team: &TeamId) -> Result<Upstream, TransportError> {
        let url = self.template.replace("{team}", team.as_str());
        let uri: Uri = url
            .parse()
            .map_err(|_| TransportError::InvalidUpstream(url.clone()))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or(TransportError::InvalidUpstream(url))?;
        Ok(Upstream {
            team: team.clone(),
            authority,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid upstream address '{0}'")]
    InvalidUpstream(String),
    #[error("failed to reach instance: {0}")]
    Connection(String),
    #[error("instance did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
}

impl TransportError {
    /// Response the client sees for this failure
    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            TransportError::InvalidUpstream(_) => {
                json_error_response(ProxyErrorCode::InvalidUpstream, "Instance address is invalid")
            }
            TransportError::Connection(_) => {
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to instance")
            }
            TransportError::Timeout(timeout) => json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ),
        }
    }
}

/// Streams a request to an upstream and the response back
#[async_trait]
pub trait Transport<B>: Send + Sync
where
    B: Send + 'static,
{
    async fn forward(&self, upstream: &Upstream, req: Request<B>) -> Result<Response<ProxyBody>, TransportError>;
}

/// Transport over pooled HTTP connections, with WebSocket upgrade support
pub struct HttpTransport {
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[async_trait]
impl Transport<Incoming> for HttpTransport {
    async fn forward(
        &self,
        upstream: &Upstream,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let client_upgrade = is_upgrade_request(&req).then(|| hyper::upgrade::on(&mut req));
        if client_upgrade.is_some() {
            self.pool.stats().record_upgrade();
        }

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, &upstream.authority),
        )
        .await;

        let mut response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(team = %upstream.team, upstream = %upstream.authority, error = %e, "Failed to forward request");
                return Err(match e {
                    PoolError::Client(e) => TransportError::Connection(e.to_string()),
                    PoolError::RequestBuild(e) => TransportError::InvalidUpstream(e),
                });
            }
            Err(_) => {
                warn!(
                    team = %upstream.team,
                    upstream = %upstream.authority,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                return Err(TransportError::Timeout(self.request_timeout));
            }
        };

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let team = upstream.team.clone();
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, instance)) => {
                            let mut client = TokioIo::new(client);
                            let mut instance = TokioIo::new(instance);
                            match tokio::io::copy_bidirectional(&mut client, &mut instance).await {
                                Ok((to_instance, to_client)) => {
                                    debug!(team = %team, to_instance, to_client, "Upgraded connection closed");
                                }
                                Err(e) => {
                                    debug!(team = %team, error = %e, "Upgraded connection closed with error");
                                }
                            }
                        }
                        Err(e) => error!(team = %team, error = %e, "Failed to upgrade connection"),
                    }
                });
                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(parts, empty_body()));
            }
            warn!(team = %upstream.team, status = %response.status(), "Instance rejected upgrade request");
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}
