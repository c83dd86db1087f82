//! Admin API
//!
//! JSON over HTTP/1.1 and HTTP/2 on a loopback port. Every route except
//! `/health` and `/version` requires `Authorization: Bearer <token>`.
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | GET, POST | `/services` | list, create |
//! | GET, PUT, DELETE | `/services/{id}` | read, update, delete |
//! | POST | `/services/{id}/start`, `/stop` | persist `enabled` and converge |
//! | POST | `/services/{id}/restart`, `/reload` | |
//! | GET | `/services/{id}/online` | registry membership |
//! | POST | `/services/status` | batch status for a JSON array of ids |
//! | GET, POST | `/certificates` | list, create |
//! | PUT, DELETE | `/certificates/{id}` | |
//! | POST | `/certificates/{id}/apply` | ACME issuance |
//! | GET, POST | `/security-lists`, `/rate-limits` | list, create |
//! | PUT, DELETE | `/security-lists/{id}`, `/rate-limits/{id}` | |
//! | GET | `/abnormal-ips?page=&page_size=` | paged monitor snapshot |
//! | GET | `/abnormal-ips/{ip}` | one address |
//! | POST | `/abnormal-ips/{ip}/promote` | add to the auto blacklist |
//! | GET | `/stats` | telemetry snapshot |
//! | POST | `/stats/enable`, `/stats/disable`, `/stats/reset` | |

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorResponse, GatewayError, GatewayErrorCode};
use crate::gateway::Gateway;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "success": true, "data": data });
    json_response(StatusCode::OK, body.to_string())
}

fn error_json(err: &GatewayError) -> Response<Full<Bytes>> {
    let body = ErrorResponse::from(err);
    json_response(err.code().status_code(), body.to_json())
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, gateway, auth_token).await {
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

async fn serve_admin_connection<S>(stream: S, gateway: Arc<Gateway>, auth_token: Arc<String>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        let token = Arc::clone(&auth_token);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, &gateway, &token).await) }
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
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, GatewayError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let bytes = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| GatewayError::validation(format!("unreadable request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::validation(format!("invalid JSON body: {}", e)))
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn parse_ip(raw: &str) -> Result<IpAddr, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::validation(format!("'{}' is not an IP address", raw)))
}

/// Entity ids in request paths always win over ids in the body
fn with_id<T>(mut entity: T, id: &str, set: impl FnOnce(&mut T, String)) -> T {
    set(&mut entity, id.to_string());
    entity
}

pub async fn handle_admin_request<B>(req: Request<B>, gateway: &Gateway, auth_token: &str) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => {
            return Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"ok")))
                .expect("valid response with StatusCode enum");
        }
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    if !check_auth(&req, auth_token) {
        warn!(%path, "Unauthorized admin API request");
        let body = ErrorResponse::new(GatewayErrorCode::Unauthorized, "missing or invalid bearer token");
        return json_response(StatusCode::UNAUTHORIZED, body.to_json());
    }

    match route(req, gateway, &method, &path).await {
        Ok(response) => response,
        Err(e) => {
            debug!(%method, %path, error = %e, "Admin API request failed");
            error_json(&e)
        }
    }
}

async fn route<B>(req: Request<B>, gw: &Gateway, method: &Method, path: &str) -> Result<Response<Full<Bytes>>, GatewayError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (method, segments.as_slice()) {
        // ==================== Services ====================
        (&Method::GET, ["services"]) => ok_json(&gw.services()),
        (&Method::POST, ["services"]) => ok_json(&gw.create_service(read_json(req).await?).await?),
        (&Method::POST, ["services", "status"]) => {
            let ids: Vec<String> = read_json(req).await?;
            ok_json(&gw.batch_stats(&ids))
        }
        (&Method::GET, ["services", id]) => ok_json(&gw.service(id)?),
        (&Method::PUT, ["services", id]) => {
            let service = with_id(read_json(req).await?, id, |s: &mut crate::model::ServiceInstance, id| s.id = id);
            ok_json(&gw.update_service(service).await?)
        }
        (&Method::DELETE, ["services", id]) => {
            gw.delete_service(id).await?;
            ok_json(&serde_json::json!({ "id": id }))
        }
        (&Method::POST, ["services", id, "start"]) => ok_json(&gw.start_or_stop(id, true).await?),
        (&Method::POST, ["services", id, "stop"]) => ok_json(&gw.start_or_stop(id, false).await?),
        (&Method::POST, ["services", id, "restart"]) => ok_json(&gw.restart(id).await?),
        (&Method::POST, ["services", id, "reload"]) => ok_json(&gw.reload(id).await?),
        (&Method::GET, ["services", id, "online"]) => {
            ok_json(&serde_json::json!({ "id": id, "online": gw.check_online(id) }))
        }

        // ==================== Certificates ====================
        (&Method::GET, ["certificates"]) => ok_json(&gw.certificates()),
        (&Method::POST, ["certificates"]) => ok_json(&gw.create_certificate(read_json(req).await?)?),
        (&Method::PUT, ["certificates", id]) => {
            let cert = with_id(read_json(req).await?, id, |c: &mut crate::model::Certificate, id| c.id = id);
            ok_json(&gw.update_certificate(cert)?)
        }
        (&Method::DELETE, ["certificates", id]) => {
            gw.delete_certificate(id)?;
            ok_json(&serde_json::json!({ "id": id }))
        }
        (&Method::POST, ["certificates", id, "apply"]) => ok_json(&gw.apply_certificate(id).await?),

        // ==================== Security Lists ====================
        (&Method::GET, ["security-lists"]) => ok_json(&gw.security_lists()),
        (&Method::POST, ["security-lists"]) => ok_json(&gw.create_security_entry(read_json(req).await?)?),
        (&Method::PUT, ["security-lists", id]) => {
            let entry = with_id(read_json(req).await?, id, |e: &mut crate::model::SecurityListEntry, id| {
                e.id = id
            });
            ok_json(&gw.update_security_entry(entry)?)
        }
        (&Method::DELETE, ["security-lists", id]) => {
            gw.delete_security_entry(id)?;
            ok_json(&serde_json::json!({ "id": id }))
        }

        // ==================== Rate Limits ====================
        (&Method::GET, ["rate-limits"]) => ok_json(&gw.rate_limits()),
        (&Method::POST, ["rate-limits"]) => ok_json(&gw.create_rate_limit(read_json(req).await?)?),
        (&Method::PUT, ["rate-limits", id]) => {
            let rule = with_id(read_json(req).await?, id, |r: &mut crate::model::RateLimitRule, id| r.id = id);
            ok_json(&gw.update_rate_limit(rule)?)
        }
        (&Method::DELETE, ["rate-limits", id]) => {
            gw.delete_rate_limit(id)?;
            ok_json(&serde_json::json!({ "id": id }))
        }

        // ==================== Abnormal IPs ====================
        (&Method::GET, ["abnormal-ips"]) => {
            let query = req.uri().query();
            let page = query_param(query, "page").and_then(|p| p.parse().ok()).unwrap_or(1);
            let page_size = query_param(query, "page_size").and_then(|p| p.parse().ok()).unwrap_or(50);
            ok_json(&gw.abnormal_ips(page, page_size))
        }
        (&Method::GET, ["abnormal-ips", ip]) => {
            let ip = parse_ip(ip)?;
            let stats = gw
                .abnormal_ip(&ip)
                .ok_or_else(|| GatewayError::not_found(format!("abnormal IP {}", ip)))?;
            ok_json(&stats)
        }
        (&Method::POST, ["abnormal-ips", ip, "promote"]) => ok_json(&gw.promote_to_blacklist(parse_ip(ip)?)?),

        // ==================== Telemetry ====================
        (&Method::GET, ["stats"]) => ok_json(&gw.stats_snapshot()),
        (&Method::POST, ["stats", "enable"]) => {
            gw.stats().enable();
            ok_json(&gw.stats_snapshot())
        }
        (&Method::POST, ["stats", "disable"]) => {
            gw.stats().disable();
            ok_json(&gw.stats_snapshot())
        }
        (&Method::POST, ["stats", "reset"]) => {
            gw.stats().reset();
            ok_json(&gw.stats_snapshot())
        }

        _ => return Err(GatewayError::not_found(format!("route {} {}", method, path))),
    };

    Ok(response)
}
