//! Public balancer listener and its request router

use crate::engine::{redirect, ClientContext, ProxyEngine};
use crate::landing::LandingPage;
use crate::transport::ProxyBody;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Splits traffic between the landing page and team instances
pub struct RequestRouter<B> {
    landing: LandingPage,
    engine: ProxyEngine<B>,
}

impl<B: Send + 'static> RequestRouter<B> {
    pub fn new(landing: LandingPage, engine: ProxyEngine<B>) -> Self {
        Self { landing, engine }
    }

    pub fn engine(&self) -> &ProxyEngine<B> {
        &self.engine
    }

    pub async fn route(&self, req: Request<B>, client: ClientContext) -> Response<ProxyBody> {
        let path = req.uri().path();

        if self.landing.matches(path) {
            return self.landing.serve(req.uri()).await;
        }

        if path == self.landing.bare_prefix() {
            return redirect(self.landing.prefix());
        }

        self.engine.handle(req, client).await
    }
}

/// The public-facing balancer server
pub struct BalancerServer {
    bind_addr: SocketAddr,
    router: Arc<RequestRouter<Incoming>>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl BalancerServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<RequestRouter<Incoming>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Balancer listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, router, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, router, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol, "Balancer shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<RequestRouter<Incoming>>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let client = ClientContext {
        addr: Some(addr),
        is_tls,
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.route(req, client).await) }
    });

    // HTTP/1.1 connections keep upgrade support for WebSockets
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::transport::{full_body, Transport, TransportError, Upstream};
    use async_trait::async_trait;
    use hyper::StatusCode;

    struct EchoTransport;

    #[async_trait]
    impl Transport<String> for EchoTransport {
        async fn forward(&self, upstream: &Upstream, _req: Request<String>) -> Result<Response<ProxyBody>, TransportError> {
            Ok(Response::new(full_body(format!("proxied to {}", upstream.team))))
        }
    }

    fn router(orchestrator: Arc<FakeOrchestrator>) -> RequestRouter<String> {
        let config = BalancerConfig::default();
        let engine = ProxyEngine::<String>::from_config(&config, orchestrator, Arc::new(EchoTransport));
        RequestRouter::new(LandingPage::from_config(&config), engine)
    }

    fn request(path: &str, cookie: Option<&str>) -> Request<String> {
        let mut builder = Request::builder().uri(path);
        if let Some(cookie) = cookie {
            builder = builder.header("Cookie", cookie);
        }
        builder.body(String::new()).unwrap()
    }

    #[tokio::test]
    async fn test_landing_page_is_not_proxied() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let router = router(orchestrator.clone());

        let response = router
            .route(request("/balancer/", Some("balancer=t-team42")), ClientContext::default())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(orchestrator.lookups(), 0);
        assert_eq!(orchestrator.updates(), 0);
    }

    #[tokio::test]
    async fn test_bare_landing_path_redirects() {
        let router = router(Arc::new(FakeOrchestrator::ready()));

        let response = router.route(request("/balancer", None), ClientContext::default()).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/balancer/");
    }

    #[tokio::test]
    async fn test_other_paths_go_through_engine() {
        let orchestrator = Arc::new(FakeOrchestrator::ready());
        let router = router(orchestrator.clone());

        let response = router.route(request("/", None), ClientContext::default()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/balancer/");

        let response = router
            .route(request("/balancer-not-landing", Some("balancer=t-team42")), ClientContext::default())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(orchestrator.lookups(), 1);
    }
}
