//! Integration tests for Teamgate
//!
//! A real balancer and admin server run on ephemeral ports in front of a
//! small hyper upstream standing in for a team instance. The orchestrator is
//! an in-memory stand-in so no Docker daemon is needed.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use teamgate::admin::{AdminServer, AdminState};
use teamgate::config::BalancerConfig;
use teamgate::engine::ProxyEngine;
use teamgate::identity::TeamId;
use teamgate::landing::LandingPage;
use teamgate::orchestrator::{
    InstanceReplicas, InstanceSummary, LookupError, Orchestrator, OrchestratorError, SharedOrchestrator,
};
use teamgate::pool::{ConnectionPool, PoolConfig};
use teamgate::proxy::{BalancerServer, RequestRouter};
use teamgate::transport::{HttpTransport, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const ADMIN_TOKEN: &str = "integration-token";

/// In-memory orchestrator: teams map to replica counts, unknown teams are not found
#[derive(Default)]
struct TestOrchestrator {
    instances: Mutex<HashMap<String, InstanceReplicas>>,
    passcodes: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
    updates: AtomicUsize,
}

impl TestOrchestrator {
    fn with_instance(self, team: &str, ready: u32, available: u32) -> Self {
        self.instances
            .lock()
            .unwrap()
            .insert(team.to_string(), InstanceReplicas::new(ready, available));
        self
    }
}

#[async_trait]
impl Orchestrator for TestOrchestrator {
    async fn get_instance(&self, team: &TeamId) -> Result<InstanceReplicas, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.instances
            .lock()
            .unwrap()
            .get(team.as_str())
            .copied()
            .ok_or_else(|| LookupError::NotFound(team.to_string()))
    }

    async fn update_last_request_timestamp(&self, _team: &TeamId) -> Result<(), OrchestratorError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_deployment(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError> {
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(team.as_str()) {
            return Err(OrchestratorError::AlreadyExists(team.to_string()));
        }
        instances.insert(team.to_string(), InstanceReplicas::new(1, 1));
        self.passcodes
            .lock()
            .unwrap()
            .insert(team.to_string(), passcode_hash.to_string());
        Ok(())
    }

    async fn create_service(&self, _team: &TeamId) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn delete_deployment(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        self.instances.lock().unwrap().remove(team.as_str());
        self.passcodes.lock().unwrap().remove(team.as_str());
        Ok(())
    }

    async fn delete_instance_pod(&self, team: &TeamId) -> Result<(), OrchestratorError> {
        match self.instances.lock().unwrap().get_mut(team.as_str()) {
            Some(replicas) => {
                *replicas = InstanceReplicas::new(0, 0);
                Ok(())
            }
            None => Err(OrchestratorError::NotFound(team.to_string())),
        }
    }

    async fn change_passcode_hash(&self, team: &TeamId, passcode_hash: &str) -> Result<(), OrchestratorError> {
        self.passcodes
            .lock()
            .unwrap()
            .insert(team.to_string(), passcode_hash.to_string());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, OrchestratorError> {
        let mut teams: Vec<InstanceSummary> = self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(team, replicas)| InstanceSummary {
                team: team.clone(),
                ready: replicas.ready_replicas > 0,
                created_at: None,
                last_request: None,
            })
            .collect();
        teams.sort_by(|a, b| a.team.cmp(&b.team));
        Ok(teams)
    }
}

/// Upstream that answers every request with its path and forwarding headers
async fn start_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let forwarded_for = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let body = format!("proxied {} from {}", req.uri(), forwarded_for);
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

struct Harness {
    balancer: SocketAddr,
    admin: SocketAddr,
    orchestrator: Arc<TestOrchestrator>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_balancer(orchestrator: TestOrchestrator, upstream: &str) -> Harness {
    let orchestrator = Arc::new(orchestrator);
    let shared: SharedOrchestrator = orchestrator.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = BalancerConfig {
        upstream: upstream.to_string(),
        ..Default::default()
    };

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let transport: Arc<dyn Transport<Incoming>> = Arc::new(HttpTransport::new(pool, Duration::from_secs(5)));
    let engine = ProxyEngine::from_config(&config, Arc::clone(&shared), transport);
    let admin_state = Arc::new(AdminState::new(
        shared,
        Arc::clone(engine.status_cache()),
        engine.identity().clone(),
        ADMIN_TOKEN,
    ));
    let router = Arc::new(RequestRouter::new(LandingPage::from_config(&config), engine));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let balancer = listener.local_addr().unwrap();
    let server = BalancerServer::new(balancer, router, shutdown_rx.clone());
    tokio::spawn(async move { server.run_with_listener(listener).await });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin = listener.local_addr().unwrap();
    let admin_server = AdminServer::new(admin, admin_state, shutdown_rx);
    tokio::spawn(async move { admin_server.run_with_listener(listener).await });

    Harness {
        balancer,
        admin,
        orchestrator,
        _shutdown_tx: shutdown_tx,
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn send(addr: SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn http_get(addr: SocketAddr, path: &str, cookie: Option<&str>) -> String {
    let cookie = cookie.map(|c| format!("Cookie: {}\r\n", c)).unwrap_or_default();
    send(
        addr,
        format!(
            "GET {} HTTP/1.1\r\nHost: ctf.local\r\n{}Connection: close\r\n\r\n",
            path, cookie
        ),
    )
    .await
}

async fn admin_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    send(
        addr,
        format!(
            "{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: Bearer {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            ADMIN_TOKEN,
            body.len(),
            body
        ),
    )
    .await
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[tokio::test]
async fn test_forwards_team_with_ready_instance() {
    let upstream = start_upstream().await;
    let harness = start_balancer(
        TestOrchestrator::default().with_instance("team42", 1, 1),
        &format!("http://{}", upstream),
    )
    .await;

    let response = http_get(harness.balancer, "/rest/products?q=1", Some("balancer=t-team42")).await;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.contains("proxied /rest/products?q=1 from 127.0.0.1"));
}

#[tokio::test]
async fn test_redirects_without_cookie() {
    let upstream = start_upstream().await;
    let harness = start_balancer(TestOrchestrator::default(), &format!("http://{}", upstream)).await;

    let response = http_get(harness.balancer, "/", None).await;

    assert!(response.starts_with("HTTP/1.1 302"), "unexpected response: {}", response);
    assert_eq!(header(&response, "location"), Some("/balancer/"));
    assert_eq!(harness.orchestrator.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_redirects_restarting_instance() {
    let upstream = start_upstream().await;
    let harness = start_balancer(
        TestOrchestrator::default().with_instance("restarting-instance", 0, 0),
        &format!("http://{}", upstream),
    )
    .await;

    let response = http_get(harness.balancer, "/", Some("balancer=t-restarting-instance")).await;

    assert!(response.starts_with("HTTP/1.1 302"));
    assert_eq!(
        header(&response, "location"),
        Some("/balancer/?msg=instance-restarting&teamname=restarting-instance")
    );
}

#[tokio::test]
async fn test_redirects_missing_instance() {
    let upstream = start_upstream().await;
    let harness = start_balancer(TestOrchestrator::default(), &format!("http://{}", upstream)).await;

    let response = http_get(harness.balancer, "/", Some("balancer=t-missing-instance")).await;

    assert!(response.starts_with("HTTP/1.1 302"));
    assert_eq!(
        header(&response, "location"),
        Some("/balancer/?msg=instance-not-found&teamname=missing-instance")
    );
}

#[tokio::test]
async fn test_serves_landing_page() {
    let upstream = start_upstream().await;
    let harness = start_balancer(TestOrchestrator::default(), &format!("http://{}", upstream)).await;

    let response = http_get(harness.balancer, "/balancer/", Some("balancer=t-team42")).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(header(&response, "content-type"), Some("text/html; charset=utf-8"));

    let response = http_get(harness.balancer, "/balancer", None).await;
    assert!(response.starts_with("HTTP/1.1 302"));
    assert_eq!(header(&response, "location"), Some("/balancer/"));

    assert_eq!(harness.orchestrator.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_repeated_requests_hit_orchestrator_once() {
    let upstream = start_upstream().await;
    let harness = start_balancer(
        TestOrchestrator::default().with_instance("busy", 1, 1),
        &format!("http://{}", upstream),
    )
    .await;

    for _ in 0..5 {
        let response = http_get(harness.balancer, "/", Some("balancer=t-busy")).await;
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    assert_eq!(harness.orchestrator.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(harness.orchestrator.updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_instance_returns_bad_gateway() {
    // Bind then drop to get a port nothing listens on
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let harness = start_balancer(
        TestOrchestrator::default().with_instance("team42", 1, 1),
        &format!("http://{}", closed),
    )
    .await;

    let response = http_get(harness.balancer, "/", Some("balancer=t-team42")).await;

    assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {}", response);
    assert_eq!(header(&response, "x-proxy-error"), Some("CONNECTION_FAILED"));
}

#[tokio::test]
async fn test_admin_creates_team_then_balancer_forwards() {
    let upstream = start_upstream().await;
    let harness = start_balancer(TestOrchestrator::default(), &format!("http://{}", upstream)).await;

    let response = send(
        harness.admin,
        "GET /teams HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 401"));

    let response = http_get(harness.balancer, "/", Some("balancer=t-newteam")).await;
    assert_eq!(
        header(&response, "location"),
        Some("/balancer/?msg=instance-not-found&teamname=newteam")
    );

    let response = admin_request(harness.admin, "POST", "/teams/newteam", r#"{"passcode_hash":"h1"}"#).await;
    assert!(response.starts_with("HTTP/1.1 201"), "unexpected response: {}", response);
    assert!(response.contains(r#""credential":"t-newteam""#));

    // Creation invalidates the cached "not found" status
    let response = http_get(harness.balancer, "/", Some("balancer=t-newteam")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);

    let response = admin_request(harness.admin, "GET", "/teams", "").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""team":"newteam""#));
}
