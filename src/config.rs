//! Client-wide configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{NtlmEngine, Realm, SpnegoEngine};
use crate::filter::{IoExceptionFilter, ResponseFilter};

#[derive(Debug, Clone)]
/// Proxy endpoint plus optional credentials.
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
    pub principal: Option<String>,
    pub password: Option<String>,
    pub ntlm_domain: Option<String>,
    /// Host suffixes that bypass this proxy.
    pub non_proxy_hosts: Vec<String>,
}

impl ProxyServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            principal: None,
            password: None,
            ntlm_domain: None,
            non_proxy_hosts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        principal: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.principal = Some(principal.into());
        self.password = Some(password.into());
        self
    }

    /// Returns true when requests for `target_host`
    /// should go direct instead of through this proxy.
    pub fn avoid_proxy(&self, target_host: &str) -> bool {
        self.non_proxy_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                target_host.ends_with(suffix)
            } else {
                target_host.eq_ignore_ascii_case(pattern)
            }
        })
    }
}

/// Client-wide defaults; most of these can be
/// overridden per request on [`crate::request::LogicalRequest`].
#[derive(Clone)]
pub struct ClientConfig {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    /// Keep the original method on a 302 instead of rewriting to GET.
    pub strict_302_handling: bool,
    pub remove_query_params_on_redirect: bool,
    pub compression_enabled: bool,
    pub keep_alive: bool,
    pub user_agent: Option<String>,
    pub request_timeout: Option<Duration>,
    pub idle_connection_timeout: Option<Duration>,
    /// Upper bound on channels open across all hosts.
    pub max_connections: Option<usize>,
    pub max_connections_per_host: Option<usize>,
    /// Upper bound on idle channels kept in the pool; channels
    /// offered back beyond it are closed instead.
    pub max_idle_connections: Option<usize>,
    /// Encode client cookies per RFC 6265 instead of the legacy
    /// `$Version` style.
    pub rfc6265_cookie_encoding: bool,
    pub realm: Option<Realm>,
    pub proxy: Option<ProxyServer>,
    pub response_filters: Vec<Arc<dyn ResponseFilter>>,
    pub io_exception_filters: Vec<Arc<dyn IoExceptionFilter>>,
    pub ntlm_engine: Option<Arc<dyn NtlmEngine>>,
    pub spnego_engine: Option<Arc<dyn SpnegoEngine>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            follow_redirects: false,
            max_redirects: 5,
            strict_302_handling: false,
            remove_query_params_on_redirect: false,
            compression_enabled: false,
            keep_alive: true,
            user_agent: None,
            request_timeout: Some(Duration::from_secs(60)),
            idle_connection_timeout: Some(Duration::from_secs(60)),
            max_connections: None,
            max_connections_per_host: None,
            max_idle_connections: None,
            rfc6265_cookie_encoding: false,
            realm: None,
            proxy: None,
            response_filters: Vec::new(),
            io_exception_filters: Vec::new(),
            ntlm_engine: None,
            spnego_engine: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("strict_302_handling", &self.strict_302_handling)
            .field(
                "remove_query_params_on_redirect",
                &self.remove_query_params_on_redirect,
            )
            .field("compression_enabled", &self.compression_enabled)
            .field("keep_alive", &self.keep_alive)
            .field("user_agent", &self.user_agent)
            .field("request_timeout", &self.request_timeout)
            .field("idle_connection_timeout", &self.idle_connection_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_connections_per_host", &self.max_connections_per_host)
            .field("max_idle_connections", &self.max_idle_connections)
            .field("rfc6265_cookie_encoding", &self.rfc6265_cookie_encoding)
            .field("realm", &self.realm)
            .field("proxy", &self.proxy)
            .field("response_filters", &self.response_filters.len())
            .field("io_exception_filters", &self.io_exception_filters.len())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    #[must_use]
    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    #[must_use]
    pub fn with_strict_302_handling(mut self, strict: bool) -> Self {
        self.strict_302_handling = strict;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_max_connections_per_host(mut self, max: Option<usize>) -> Self {
        self.max_connections_per_host = max;
        self
    }

    #[must_use]
    pub fn with_max_idle_connections(mut self, max: Option<usize>) -> Self {
        self.max_idle_connections = max;
        self
    }

    #[must_use]
    pub fn with_realm(mut self, realm: Realm) -> Self {
        self.realm = Some(realm);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyServer) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn with_response_filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.response_filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_io_exception_filter(mut self, filter: Arc<dyn IoExceptionFilter>) -> Self {
        self.io_exception_filters.push(filter);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_bypass_suffix_patterns() {
        let proxy = ProxyServer {
            non_proxy_hosts: vec!["*.internal.example".to_owned(), "localhost".to_owned()],
            ..ProxyServer::new("proxy.example", 8080)
        };
        assert!(proxy.avoid_proxy("db.internal.example"));
        assert!(proxy.avoid_proxy("localhost"));
        assert!(proxy.avoid_proxy("LOCALHOST"));
        assert!(!proxy.avoid_proxy("example.com"));
    }
}
