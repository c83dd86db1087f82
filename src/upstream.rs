//! Pooled HTTP(S) client for upstream requests
//!
//! One pool is shared by every listener. Connections are kept alive per
//! upstream host and reused; `https` upstreams are verified against the
//! webpki root set.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

/// A connection pool for HTTP connections to upstream servers
pub struct UpstreamPool {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    total_requests: AtomicU64,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Forward `req` to `base`, replacing its path with `forward_path`
    ///
    /// The query string of the original request is kept. When `host_override`
    /// is set it becomes the upstream `Host`, otherwise the upstream's own
    /// authority is used.
    pub async fn send(
        &self,
        req: Request<Incoming>,
        base: &Uri,
        forward_path: &str,
        host_override: Option<&str>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let uri = upstream_uri(base, forward_path, req.uri().query())?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri);

        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }

        let host = match host_override {
            Some(host) => HeaderValue::from_str(host)
                .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?,
            None => match base.authority() {
                Some(authority) => HeaderValue::from_str(authority.as_str())
                    .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?,
                None => return Err(UpstreamError::RequestBuild("upstream has no authority".into())),
            },
        };
        builder = builder.header(HOST, host);

        let upstream_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Join the upstream base path, the forwarded path and the query
fn upstream_uri(base: &Uri, forward_path: &str, query: Option<&str>) -> Result<Uri, UpstreamError> {
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| UpstreamError::RequestBuild("upstream has no authority".into()))?;
    let base_path = base.path().trim_end_matches('/');

    let mut uri = format!("{}://{}{}{}", scheme, authority, base_path, forward_path);
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(query);
    }
    uri.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| UpstreamError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_uri_joins_paths() {
        let base: Uri = "http://10.0.0.5:8080".parse().unwrap();
        let uri = upstream_uri(&base, "/users/7", Some("page=2")).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.5:8080/users/7?page=2");
    }

    #[test]
    fn test_upstream_uri_keeps_base_path() {
        let base: Uri = "https://backend.internal/v2/".parse().unwrap();
        let uri = upstream_uri(&base, "/", None).unwrap();
        assert_eq!(uri.to_string(), "https://backend.internal/v2/");
    }

    #[test]
    fn test_pool_config_from_proxy_config() {
        let proxy = ProxyConfig {
            pool_max_idle_per_host: 4,
            pool_idle_timeout_secs: 15,
            request_timeout_secs: 30,
        };
        let pool = PoolConfig::from(&proxy);
        assert_eq!(pool.max_idle_per_host, 4);
        assert_eq!(pool.idle_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_new_pool_starts_empty() {
        let pool = UpstreamPool::new(PoolConfig::default());
        assert_eq!(pool.total_requests(), 0);
    }
}
