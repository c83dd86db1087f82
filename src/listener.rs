//! Per-service listener and request pipeline
//!
//! Every request runs the same stages in order:
//!
//! 1. ACME HTTP-01 challenge responses (404 for unknown tokens)
//! 2. whitelist / blacklist (403)
//! 3. rate limiting (429 with `Retry-After`)
//! 4. route dispatch to a cluster or a static site (404 when nothing matches)
//!
//! The compiled [`Pipeline`] sits behind an `ArcSwap`, so a reload swaps routes
//! and policies without rebinding the socket. Requests already running keep
//! the pipeline they started with.

use arc_swap::ArcSwap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::acme::{Http01Challenges, ACME_CHALLENGE_PREFIX};
use crate::error::{plain_response, GatewayError};
use crate::iprange::canonical;
use crate::model::ServiceInstance;
use crate::monitor::{AbnormalIpMonitor, ErrorEvent};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::routing::{request_host, RouteAction, RouteTable};
use crate::security::SecurityPolicy;
use crate::store::Snapshot;
use crate::telemetry::GatewayStats;
use crate::upstream::UpstreamPool;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Compiled routes and policies for one service
pub struct Pipeline {
    pub routes: RouteTable,
    pub policy: SecurityPolicy,
    pub limiter: RateLimiter,
    pub request_timeout: Duration,
}

impl Pipeline {
    pub fn build(
        service: &ServiceInstance,
        snapshot: &Snapshot,
        default_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            routes: RouteTable::build(service)?,
            policy: SecurityPolicy::from_entries(&snapshot.security_lists),
            limiter: RateLimiter::new(&snapshot.rate_limits),
            request_timeout: service.request_timeout(default_timeout),
        })
    }
}

/// State shared by every connection of one listener
pub struct ListenerContext {
    pub service_id: String,
    pub pipeline: Arc<ArcSwap<Pipeline>>,
    pub pool: Arc<UpstreamPool>,
    pub challenges: Http01Challenges,
    pub monitor: Arc<AbnormalIpMonitor>,
    pub stats: Arc<GatewayStats>,
    pub is_tls: bool,
}

/// A bound socket waiting to serve
pub struct Listener {
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    ctx: Arc<ListenerContext>,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        ctx: Arc<ListenerContext>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))?;
        Ok(Self {
            listener,
            tls_acceptor,
            ctx,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            service = self.ctx.service_id,
            addr = ?self.local_addr(),
            protocol,
            "Listener accepting connections"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx).await {
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
                        info!(service = self.ctx.service_id, "Listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ListenerContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, hyper::Error>(handle_request(req, ctx, addr).await) }
    });

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

/// Run the pipeline and feed every error response to the monitor
pub async fn handle_request(req: Request<Incoming>, ctx: Arc<ListenerContext>, client_addr: SocketAddr) -> ProxyResponse {
    ctx.stats.record_request();

    let client_ip = canonical(&client_addr.ip());
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = dispatch(req, &ctx, client_ip).await;

    let status = response.status().as_u16();
    if status >= 400 {
        ctx.monitor.record(
            client_ip,
            &ErrorEvent {
                service_id: &ctx.service_id,
                method: &method,
                path: &path,
                status,
            },
        );
    }
    response
}

async fn dispatch(mut req: Request<Incoming>, ctx: &ListenerContext, client_ip: IpAddr) -> ProxyResponse {
    // challenge paths never reach the policy stages
    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        return match ctx.challenges.get(token) {
            Some(key_auth) => {
                debug!(token, "Responding to ACME HTTP-01 challenge");
                challenge_response(key_auth)
            }
            None => plain_response(StatusCode::NOT_FOUND),
        };
    }

    let pipeline = ctx.pipeline.load_full();

    let admission = pipeline.policy.check(&client_ip);
    if !admission.is_allowed() {
        debug!(ip = %client_ip, ?admission, "Request rejected by security policy");
        ctx.stats.record_blocked();
        return plain_response(StatusCode::FORBIDDEN);
    }

    if let RateDecision::Limited { retry_after_secs } =
        pipeline.limiter.check(&client_ip, req.method().as_str(), req.uri().path())
    {
        debug!(ip = %client_ip, path = req.uri().path(), retry_after_secs, "Request rate limited");
        ctx.stats.record_rate_limited();
        let mut response = plain_response(StatusCode::TOO_MANY_REQUESTS);
        response
            .headers_mut()
            .insert(hyper::header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        return response;
    }

    let host = request_host(&req);
    let Some(matched) = pipeline.routes.find(host.as_deref(), req.uri().path()) else {
        debug!(host = ?host, path = req.uri().path(), "No route matched");
        return plain_response(StatusCode::NOT_FOUND);
    };

    let cluster_id = match &matched.route.action {
        RouteAction::Static(site) => return site.serve(&matched.forward_path).await,
        RouteAction::Proxy { cluster_id } => cluster_id,
    };
    let Some(selected) = pipeline
        .routes
        .cluster(cluster_id)
        .and_then(|cluster| cluster.select(&client_ip))
    else {
        warn!(cluster = cluster_id, "No upstream available");
        ctx.stats.record_upstream_failure();
        return plain_response(StatusCode::BAD_GATEWAY);
    };
    let destination = selected.destination();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, this gateway is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if ctx.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    debug!(
        service = ctx.service_id,
        method = %req.method(),
        uri = %req.uri(),
        upstream = %destination.address,
        request_id,
        "Forwarding request"
    );

    let forward_path = matched.forward_path.clone();
    let timeout = pipeline.request_timeout;
    let result = tokio::time::timeout(
        timeout,
        ctx.pool.send(
            req,
            &destination.address,
            &forward_path,
            destination.host_override.as_deref(),
        ),
    )
    .await;

    match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(upstream = %destination.address, error = %e, "Failed to forward request");
            ctx.stats.record_upstream_failure();
            plain_response(StatusCode::BAD_GATEWAY)
        }
        Err(_) => {
            warn!(
                upstream = %destination.address,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            ctx.stats.record_upstream_failure();
            plain_response(StatusCode::GATEWAY_TIMEOUT)
        }
    }
}

fn challenge_response(key_auth: String) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(key_auth)).map_err(|never| match never {}).boxed());
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
