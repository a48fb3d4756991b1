//! HTTP proxy resolution for http_sse servers.

use super::config::{ProxyConfig, TransportConfig};
use crate::error::{BridgeError, BridgeResult};

/// Resolve the proxy for a server.
///
/// Priority: per-server override > global proxy > direct connection.
pub(crate) fn resolve_proxy_config<'a>(
    transport: &'a TransportConfig,
    global_proxy: Option<&'a ProxyConfig>,
) -> Option<&'a ProxyConfig> {
    match transport {
        TransportConfig::HttpSse {
            proxy: Some(proxy), ..
        } => Some(proxy),
        TransportConfig::HttpSse { proxy: None, .. } => global_proxy,
        TransportConfig::Stdio { .. } => None,
    }
}

/// Apply proxy settings to a client builder without building it.
pub(crate) fn apply_proxy_to_builder(
    mut builder: reqwest::ClientBuilder,
    proxy_cfg: &ProxyConfig,
) -> BridgeResult<reqwest::ClientBuilder> {
    if let Some(ref http_proxy) = proxy_cfg.http {
        let proxy = reqwest::Proxy::http(http_proxy)
            .map_err(|e| BridgeError::Config(format!("Invalid HTTP proxy: {}", e)))?;
        builder = builder.proxy(decorate(proxy, proxy_cfg));
    }

    if let Some(ref https_proxy) = proxy_cfg.https {
        let proxy = reqwest::Proxy::https(https_proxy)
            .map_err(|e| BridgeError::Config(format!("Invalid HTTPS proxy: {}", e)))?;
        builder = builder.proxy(decorate(proxy, proxy_cfg));
    }

    Ok(builder)
}

fn decorate(mut proxy: reqwest::Proxy, cfg: &ProxyConfig) -> reqwest::Proxy {
    if let Some(ref no_proxy) = cfg.no_proxy {
        proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
    }
    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }
    proxy
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn proxy(url: &str) -> ProxyConfig {
        ProxyConfig {
            http: Some(url.to_string()),
            https: None,
            no_proxy: Some("localhost".to_string()),
            username: None,
            password: None,
        }
    }

    fn http_transport(proxy: Option<ProxyConfig>) -> TransportConfig {
        TransportConfig::HttpSse {
            url: "http://localhost:3000/mcp".to_string(),
            headers: HashMap::new(),
            proxy,
        }
    }

    #[test]
    fn test_resolve_proxy_prefers_server_override() {
        let global = proxy("http://global:8080");
        let transport = http_transport(Some(proxy("http://server:8080")));

        let resolved = resolve_proxy_config(&transport, Some(&global)).unwrap();
        assert_eq!(resolved.http.as_deref(), Some("http://server:8080"));
    }

    #[test]
    fn test_resolve_proxy_falls_back_to_global() {
        let global = proxy("http://global:8080");
        let transport = http_transport(None);

        let resolved = resolve_proxy_config(&transport, Some(&global)).unwrap();
        assert_eq!(resolved.http.as_deref(), Some("http://global:8080"));
        assert!(resolve_proxy_config(&transport, None).is_none());
    }

    #[test]
    fn test_stdio_never_proxied() {
        let global = proxy("http://global:8080");
        let transport = TransportConfig::Stdio {
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(resolve_proxy_config(&transport, Some(&global)).is_none());
    }

    #[test]
    fn test_apply_invalid_proxy() {
        let cfg = proxy("http://[invalid");
        let result = apply_proxy_to_builder(reqwest::Client::builder(), &cfg);
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
