//! Caller identity resolution.
//!
//! The identity partitions buckets per caller. Each source prefixes its
//! value (`user:`, `key:`, `fwd:`, `ip:`) so that equal strings coming from
//! different sources never share a bucket.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Header carrying the client chain when running behind a proxy.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Principal established by an upstream authentication layer.
///
/// Authentication middleware inserts this into the request extensions; the
/// resolver only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPrincipal(pub String);

/// Where an identity may come from, in configured priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// The authenticated principal
    Principal,
    /// The API key header
    ApiKey,
    /// The first hop of `X-Forwarded-For`
    ForwardedFor,
    /// The peer address of the connection
    RemoteAddr,
}

impl IdentitySource {
    fn prefix(&self) -> &'static str {
        match self {
            IdentitySource::Principal => "user",
            IdentitySource::ApiKey => "key",
            IdentitySource::ForwardedFor => "fwd",
            IdentitySource::RemoteAddr => "ip",
        }
    }
}

/// The parts of a request that can identify its caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub principal: Option<String>,
    pub api_key: Option<String>,
    pub forwarded_for: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    /// Extract the identifying parts of an HTTP request.
    pub fn from_parts(parts: &Parts, api_key_header: &HeaderName) -> Self {
        Self::from_headers(&parts.headers, &parts.extensions, api_key_header)
    }

    /// Extract the identifying parts from request headers and extensions.
    pub fn from_headers(
        headers: &HeaderMap,
        extensions: &Extensions,
        api_key_header: &HeaderName,
    ) -> Self {
        let forwarded_for = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(|hop| hop.trim().to_string());

        Self {
            principal: extensions
                .get::<AuthenticatedPrincipal>()
                .map(|p| p.0.clone()),
            api_key: headers
                .get(api_key_header)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            forwarded_for,
            remote_addr: extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip()),
        }
    }

    fn value(&self, source: IdentitySource) -> Option<String> {
        let raw = match source {
            IdentitySource::Principal => self.principal.clone(),
            IdentitySource::ApiKey => self.api_key.clone(),
            IdentitySource::ForwardedFor => self.forwarded_for.clone(),
            IdentitySource::RemoteAddr => self.remote_addr.map(|ip| ip.to_string()),
        }?;

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Derives the stable per-caller identity used to partition buckets.
pub trait IdentityResolver: Send + Sync {
    /// Identify the caller, or fail if the request carries nothing usable.
    fn identify(&self, ctx: &RequestContext) -> Result<String>;
}

/// Tries each configured source in order and uses the first one present.
#[derive(Debug, Clone)]
pub struct ChainedIdentityResolver {
    sources: Vec<IdentitySource>,
}

impl ChainedIdentityResolver {
    pub fn new(sources: Vec<IdentitySource>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[IdentitySource] {
        &self.sources
    }
}

impl Default for ChainedIdentityResolver {
    fn default() -> Self {
        Self::new(vec![
            IdentitySource::Principal,
            IdentitySource::ApiKey,
            IdentitySource::RemoteAddr,
        ])
    }
}

impl IdentityResolver for ChainedIdentityResolver {
    fn identify(&self, ctx: &RequestContext) -> Result<String> {
        self.sources
            .iter()
            .find_map(|source| {
                ctx.value(*source)
                    .map(|value| format!("{}:{}", source.prefix(), value))
            })
            .ok_or(TollgateError::Unidentified)
    }
}
