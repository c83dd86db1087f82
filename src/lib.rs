//! Portgate - a self-hosted API gateway
//!
//! This library provides a multi-service reverse proxy that:
//! - Runs one listener per configured service, each with its own routes
//! - Routes by path prefix and host to single upstreams, load-balanced
//!   clusters or static file roots
//! - Serves TLS with per-domain certificates selected by SNI
//! - Issues and renews certificates via ACME HTTP-01
//! - Enforces whitelists, blacklists and rate limits before dispatch
//! - Tracks abnormal client IPs and can promote them to a blacklist
//! - Persists everything in SQLite and is managed through a JSON admin API

pub mod acme;
pub mod api;
pub mod balancer;
pub mod bundle;
pub mod certs;
pub mod config;
pub mod error;
pub mod gateway;
pub mod iprange;
pub mod listener;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod ratelimit;
pub mod routing;
pub mod security;
pub mod staticfiles;
pub mod store;
pub mod telemetry;
pub mod upstream;
