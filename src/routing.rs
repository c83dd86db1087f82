//! Route table compilation
//!
//! A service's locations compile into a [`RouteTable`]: one route per
//! location, one cluster per proxying location keyed by the location id.
//! Configured paths have their trailing slash trimmed and are extended with a
//! catch-all, so `/api` serves `/api`, `/api/` and `/api/v1/users`. The matched
//! prefix is removed before the request is forwarded.

use hyper::Uri;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::balancer::{Cluster, Destination};
use crate::error::GatewayError;
use crate::model::{LoadBalanceAlgorithm, LocationKind, ServiceInstance};
use crate::staticfiles::StaticSite;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    /// `*.example.com`, stored as `.example.com`
    Suffix(String),
}

impl HostPattern {
    fn parse(host: &str) -> Self {
        let host = host.trim().to_ascii_lowercase();
        match host.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => HostPattern::Suffix(suffix.to_string()),
            _ => HostPattern::Exact(host),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(expected) => expected == host,
            HostPattern::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    /// Forward through the cluster with this id
    Proxy { cluster_id: String },
    Static(Arc<StaticSite>),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub location_id: String,
    /// Configured path without its trailing slash; empty for `/`
    pub prefix: String,
    hosts: Vec<HostPattern>,
    pub action: RouteAction,
}

impl Route {
    /// Route pattern in `{prefix}/{**catch-all}` form
    pub fn pattern(&self) -> String {
        format!("{}/{{**catch-all}}", self.prefix)
    }

    pub fn has_hosts(&self) -> bool {
        !self.hosts.is_empty()
    }

    fn matches_host(&self, host: Option<&str>) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        match host {
            Some(host) => self.hosts.iter().any(|p| p.matches(host)),
            None => false,
        }
    }

    /// Path left after removing the prefix, or `None` if the path is outside it
    fn strip(&self, path: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return Some(if path.is_empty() { "/".to_string() } else { path.to_string() });
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

/// A matched route with the path to forward or serve
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub forward_path: String,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    clusters: HashMap<String, Arc<Cluster>>,
}

impl RouteTable {
    /// Compile a service's locations
    pub fn build(service: &ServiceInstance) -> Result<Self, GatewayError> {
        let mut routes = Vec::with_capacity(service.locations.len());
        let mut clusters = HashMap::new();

        for location in &service.locations {
            let prefix = location.path.trim().trim_end_matches('/').to_string();
            let hosts = location.hosts.iter().filter(|h| !h.trim().is_empty()).map(|h| HostPattern::parse(h)).collect();

            let action = match &location.kind {
                LocationKind::SingleUpstream {
                    proxy_target,
                    host_override,
                } => {
                    let address = parse_target(&location.id, proxy_target)?;
                    let destination = Destination::new(address, 1, host_override.clone());
                    clusters.insert(
                        location.id.clone(),
                        Arc::new(Cluster::new(&location.id, vec![destination], LoadBalanceAlgorithm::RoundRobin)),
                    );
                    RouteAction::Proxy {
                        cluster_id: location.id.clone(),
                    }
                }
                LocationKind::LoadBalanced {
                    upstreams,
                    algorithm,
                } => {
                    let mut destinations = Vec::new();
                    for upstream in upstreams.iter().filter(|u| !u.address.trim().is_empty()) {
                        let address = parse_target(&location.id, &upstream.address)?;
                        destinations.push(Destination::new(address, upstream.weight, None));
                    }
                    if destinations.is_empty() {
                        return Err(GatewayError::validation(format!(
                            "location '{}': at least one upstream is required",
                            location.id
                        )));
                    }
                    clusters.insert(
                        location.id.clone(),
                        Arc::new(Cluster::new(&location.id, destinations, *algorithm)),
                    );
                    RouteAction::Proxy {
                        cluster_id: location.id.clone(),
                    }
                }
                LocationKind::StaticFiles {
                    root_dir,
                    try_files,
                } => RouteAction::Static(Arc::new(StaticSite::new(
                    PathBuf::from(root_dir),
                    try_files.clone(),
                ))),
            };

            routes.push(Route {
                location_id: location.id.clone(),
                prefix,
                hosts,
                action,
            });
        }

        // longest prefix first, host-specific before host-less on ties
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| b.has_hosts().cmp(&a.has_hosts()))
        });

        debug!(
            service = service.name,
            routes = routes.len(),
            clusters = clusters.len(),
            "Route table built"
        );

        Ok(Self { routes, clusters })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn cluster(&self, id: &str) -> Option<&Arc<Cluster>> {
        self.clusters.get(id)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Best route for `host` (already lowercased, no port) and `path`
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            if !route.matches_host(host) {
                return None;
            }
            route.strip(path).map(|forward_path| RouteMatch {
                route,
                forward_path,
            })
        })
    }
}

fn parse_target(location_id: &str, target: &str) -> Result<Uri, GatewayError> {
    let uri: Uri = target.trim().parse().map_err(|e| {
        GatewayError::validation(format!(
            "location '{}': invalid upstream '{}': {}",
            location_id, target, e
        ))
    })?;
    match (uri.scheme_str(), uri.authority()) {
        (Some("http") | Some("https"), Some(_)) => Ok(uri),
        _ => Err(GatewayError::validation(format!(
            "location '{}': upstream '{}' is not an http(s) URL",
            location_id, target
        ))),
    }
}

/// Host from the `Host` header or URI authority, lowercased and without port
pub fn request_host<B>(req: &hyper::Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal
        rest.split(']').next().unwrap_or(rest)
    } else {
        raw.split(':').next().unwrap_or(&raw)
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Location, UpStream};

    fn lb(path: &str, upstreams: &[(&str, u32)]) -> Location {
        Location::new(
            path,
            LocationKind::LoadBalanced {
                upstreams: upstreams.iter().map(|(a, w)| UpStream::new(a, *w)).collect(),
                algorithm: LoadBalanceAlgorithm::WeightedRoundRobin,
            },
        )
    }

    #[test]
    fn test_compile_clusters_per_location() {
        let single = Location::single("/api/", "http://127.0.0.1:3000");
        let balanced = lb("/app", &[("http://10.0.0.1:80", 3), ("", 1), ("http://10.0.0.2:80", 1)]);
        let single_id = single.id.clone();
        let balanced_id = balanced.id.clone();
        let service = ServiceInstance::new("svc", 8080)
            .with_location(single)
            .with_location(balanced);

        let table = RouteTable::build(&service).unwrap();
        assert_eq!(table.routes().len(), 2);
        assert_eq!(table.cluster_count(), 2);

        let cluster = table.cluster(&single_id).unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.id(), single_id);

        let cluster = table.cluster(&balanced_id).unwrap();
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.algorithm(), LoadBalanceAlgorithm::WeightedRoundRobin);
        let weights: Vec<u32> = cluster.destinations().map(|d| d.weight).collect();
        assert_eq!(weights, vec![3, 1]);

        let route = table.routes().iter().find(|r| r.location_id == single_id).unwrap();
        assert_eq!(route.pattern(), "/api/{**catch-all}");
    }

    #[test]
    fn test_prefix_matching_and_strip() {
        let service = ServiceInstance::new("svc", 8080)
            .with_location(Location::single("/api/", "http://127.0.0.1:3000"));
        let table = RouteTable::build(&service).unwrap();

        assert_eq!(table.find(None, "/api").unwrap().forward_path, "/");
        assert_eq!(table.find(None, "/api/").unwrap().forward_path, "/");
        assert_eq!(table.find(None, "/api/v1/users").unwrap().forward_path, "/v1/users");
        assert!(table.find(None, "/apix").is_none());
        assert!(table.find(None, "/").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let root = Location::single("/", "http://127.0.0.1:3000");
        let api = Location::single("/api", "http://127.0.0.1:4000");
        let api_id = api.id.clone();
        let service = ServiceInstance::new("svc", 8080)
            .with_location(root)
            .with_location(api);
        let table = RouteTable::build(&service).unwrap();

        let found = table.find(None, "/api/x").unwrap();
        assert_eq!(found.route.location_id, api_id);
        assert_eq!(found.forward_path, "/x");

        let found = table.find(None, "/other").unwrap();
        assert_eq!(found.forward_path, "/other");
    }

    #[test]
    fn test_host_filtering() {
        let any = Location::single("/", "http://127.0.0.1:3000");
        let scoped = Location::single("/", "http://127.0.0.1:4000").with_hosts(&["api.example.com"]);
        let wildcard = Location::single("/w", "http://127.0.0.1:5000").with_hosts(&["*.example.org"]);
        let scoped_id = scoped.id.clone();
        let any_id = any.id.clone();
        let wildcard_id = wildcard.id.clone();
        let service = ServiceInstance::new("svc", 8080)
            .with_location(any)
            .with_location(scoped)
            .with_location(wildcard);
        let table = RouteTable::build(&service).unwrap();

        assert_eq!(table.find(Some("api.example.com"), "/x").unwrap().route.location_id, scoped_id);
        assert_eq!(table.find(Some("other.example.com"), "/x").unwrap().route.location_id, any_id);
        assert_eq!(table.find(None, "/x").unwrap().route.location_id, any_id);

        assert_eq!(table.find(Some("a.b.example.org"), "/w/1").unwrap().route.location_id, wildcard_id);
        // the apex does not match a wildcard
        assert_eq!(table.find(Some("example.org"), "/w/1").unwrap().route.location_id, any_id);
    }

    #[test]
    fn test_static_route() {
        let location = Location::new(
            "/assets",
            LocationKind::StaticFiles {
                root_dir: "/srv/www".to_string(),
                try_files: vec!["index.html".to_string()],
            },
        );
        let service = ServiceInstance::new("svc", 8080).with_location(location);
        let table = RouteTable::build(&service).unwrap();
        assert_eq!(table.cluster_count(), 0);

        let found = table.find(None, "/assets/app.js").unwrap();
        assert_eq!(found.forward_path, "/app.js");
        match &found.route.action {
            RouteAction::Static(site) => assert_eq!(site.root(), std::path::Path::new("/srv/www")),
            other => panic!("expected static route, got {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_bad_target() {
        let service = ServiceInstance::new("svc", 8080)
            .with_location(Location::single("/", "ftp://127.0.0.1"));
        assert!(matches!(
            RouteTable::build(&service),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_request_host() {
        let req = hyper::Request::builder()
            .uri("/")
            .header("Host", "API.Example.com:8443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("api.example.com"));

        let req = hyper::Request::builder()
            .uri("/")
            .header("Host", "[::1]:8080")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("::1"));

        let req = hyper::Request::builder().uri("/").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }
}
