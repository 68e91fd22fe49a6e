//! HTTP client construction for remote backends.
//!
//! Resolves proxy settings and builds reqwest clients carrying auth headers.

use std::{collections::HashMap, time::Duration};

use super::config::{BackendConfig, ProxyConfig};
use crate::error::{GatewayError, GatewayResult};

/// Resolve proxy configuration for a backend.
/// Priority: backend.proxy > global proxy > None
pub(crate) fn resolve_proxy_config<'a>(
    backend: &'a BackendConfig,
    global_proxy: Option<&'a ProxyConfig>,
) -> Option<&'a ProxyConfig> {
    backend.proxy.as_ref().or(global_proxy)
}

/// Apply proxy configuration to a ClientBuilder without building it, so auth
/// headers can still be added afterwards.
pub(super) fn apply_proxy_to_builder(
    mut builder: reqwest::ClientBuilder,
    proxy_cfg: &ProxyConfig,
) -> GatewayResult<reqwest::ClientBuilder> {
    if let Some(ref http_proxy) = proxy_cfg.http {
        let proxy = reqwest::Proxy::http(http_proxy)
            .map_err(|e| GatewayError::Config(format!("Invalid HTTP proxy: {}", e)))?;
        builder = builder.proxy(configure_proxy(proxy, proxy_cfg));
    }

    if let Some(ref https_proxy) = proxy_cfg.https {
        let proxy = reqwest::Proxy::https(https_proxy)
            .map_err(|e| GatewayError::Config(format!("Invalid HTTPS proxy: {}", e)))?;
        builder = builder.proxy(configure_proxy(proxy, proxy_cfg));
    }

    Ok(builder)
}

fn configure_proxy(mut proxy: reqwest::Proxy, proxy_cfg: &ProxyConfig) -> reqwest::Proxy {
    if let Some(ref no_proxy) = proxy_cfg.no_proxy {
        proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
    }

    if let (Some(username), Some(password)) = (&proxy_cfg.username, &proxy_cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }

    proxy
}

pub(super) fn build_request_headers(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> GatewayResult<reqwest::header::HeaderMap> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| GatewayError::Config(format!("Invalid header name: {}", e)))?,
            value
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid header value: {}", e)))?,
        );
    }

    Ok(headers)
}

/// Build HTTP client with default headers.
pub(super) fn build_http_client(
    proxy_config: Option<&ProxyConfig>,
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> GatewayResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if let Some(proxy_cfg) = proxy_config {
        builder = apply_proxy_to_builder(builder, proxy_cfg)?;
    }

    let req_headers = build_request_headers(token, custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Config(format!("Cannot build HTTP client: {}", e)))
}
