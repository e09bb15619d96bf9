use std::time::Duration;

use crate::error::ClientError;

/// HTTP method, with the primary/custom split from spec §3 and §6: GET,
/// POST, PUT, HEAD are always accepted; DELETE, OPTIONS, PATCH are accepted
/// without extra opt-in; anything else needs `allow_nonstandard_methods`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Delete,
    Options,
    Patch,
    Custom(String),
}

impl Method {
    fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Custom(s) => s.as_str(),
        }
    }

    fn is_standard(&self) -> bool {
        !matches!(self, Method::Custom(_))
    }

    /// GET never carries a body; POST/PUT/PATCH require one unless the
    /// caller opted into nonstandard bodies (spec §3, §6 "body").
    fn body_policy(&self) -> BodyPolicy {
        match self {
            Method::Get => BodyPolicy::Forbidden,
            Method::Post | Method::Put | Method::Patch => BodyPolicy::Required,
            Method::Head | Method::Delete | Method::Options | Method::Custom(_) => {
                BodyPolicy::Optional
            }
        }
    }
}

enum BodyPolicy {
    Forbidden,
    Required,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Basic,
    Digest,
}

/// Per-host resolve override, the `resolve_list`/`connect_to_list` entries
/// of spec §6.
#[derive(Debug, Clone)]
pub struct ResolveOverride {
    pub host: String,
    pub port: u16,
    pub addr: String,
}

pub type HeaderCallback = std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type StreamingCallback = std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type PrepareCurlCallback = std::sync::Arc<dyn Fn(&mut curl::easy::Easy2<crate::transfer::TransferHandler>) + Send + Sync>;

/// Opaque request configuration (spec §3 "Request"). Built exclusively
/// through `RequestBuilder`, which is where every constraint in the option
/// table is enforced.
#[derive(Clone)]
pub struct Request {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub user_agent: String,
    pub network_interface: Option<String>,
    pub decompress_response: bool,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_auth_mode: Option<AuthMode>,
    pub validate_cert: bool,
    pub ca_certs: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub allow_ipv6: bool,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub resolve_list: Vec<ResolveOverride>,
    pub connect_to_list: Vec<ResolveOverride>,
    pub dns_servers: Option<String>,
    pub dns_cache_timeout: Duration,
    pub dns_use_global_cache: bool,
    pub streaming_callback: Option<StreamingCallback>,
    pub max_body_length: Option<u64>,
    pub header_callback: Option<HeaderCallback>,
    pub prepare_curl_callback: Option<PrepareCurlCallback>,
    pub allow_nonstandard_methods: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(|b| b.len()))
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    pub fn method_str(&self) -> &str {
        self.method.as_str()
    }
}

/// Default user agent, matching `httpclient.py`'s `_DEFAULTS`.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; pycurl)";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_REDIRECTS: u32 = 5;
const DEFAULT_DNS_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RequestBuilder {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    follow_redirects: bool,
    max_redirects: u32,
    user_agent: String,
    network_interface: Option<String>,
    decompress_response: bool,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
    proxy_username: Option<String>,
    proxy_password: Option<String>,
    proxy_auth_mode: Option<AuthMode>,
    validate_cert: bool,
    ca_certs: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
    allow_ipv6: bool,
    auth_username: Option<String>,
    auth_password: Option<String>,
    auth_mode: Option<AuthMode>,
    resolve_list: Vec<ResolveOverride>,
    connect_to_list: Vec<ResolveOverride>,
    dns_servers: Option<String>,
    dns_cache_timeout: Duration,
    dns_use_global_cache: bool,
    streaming_callback: Option<StreamingCallback>,
    max_body_length: Option<u64>,
    header_callback: Option<HeaderCallback>,
    prepare_curl_callback: Option<PrepareCurlCallback>,
    ssl_options_set: bool,
    allow_nonstandard_methods: bool,
}

impl RequestBuilder {
    pub fn new(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            network_interface: None,
            decompress_response: true,
            proxy_host: None,
            proxy_port: None,
            proxy_username: None,
            proxy_password: None,
            proxy_auth_mode: None,
            validate_cert: true,
            ca_certs: None,
            client_cert: None,
            client_key: None,
            allow_ipv6: true,
            auth_username: None,
            auth_password: None,
            auth_mode: None,
            resolve_list: Vec::new(),
            connect_to_list: Vec::new(),
            dns_servers: None,
            dns_cache_timeout: DEFAULT_DNS_CACHE_TIMEOUT,
            dns_use_global_cache: true,
            streaming_callback: None,
            max_body_length: None,
            header_callback: None,
            prepare_curl_callback: None,
            ssl_options_set: false,
            allow_nonstandard_methods: false,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn allow_nonstandard_methods(mut self, allow: bool) -> Self {
        self.allow_nonstandard_methods = allow;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn network_interface(mut self, iface: impl Into<String>) -> Self {
        self.network_interface = Some(iface.into());
        self
    }

    pub fn decompress_response(mut self, decompress: bool) -> Self {
        self.decompress_response = decompress;
        self
    }

    pub fn proxy(
        mut self,
        host: impl Into<String>,
        port: u16,
        auth_mode: Option<AuthMode>,
    ) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self.proxy_auth_mode = auth_mode;
        self
    }

    pub fn proxy_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }

    pub fn validate_cert(mut self, validate: bool) -> Self {
        self.validate_cert = validate;
        self
    }

    pub fn ca_certs(mut self, path: impl Into<String>) -> Self {
        self.ca_certs = Some(path.into());
        self
    }

    pub fn client_cert(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    pub fn allow_ipv6(mut self, allow: bool) -> Self {
        self.allow_ipv6 = allow;
        self
    }

    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>, mode: AuthMode) -> Self {
        self.auth_username = Some(username.into());
        self.auth_password = Some(password.into());
        self.auth_mode = Some(mode);
        self
    }

    pub fn resolve(mut self, host: impl Into<String>, port: u16, addr: impl Into<String>) -> Self {
        self.resolve_list.push(ResolveOverride {
            host: host.into(),
            port,
            addr: addr.into(),
        });
        self
    }

    pub fn connect_to(mut self, host: impl Into<String>, port: u16, addr: impl Into<String>) -> Self {
        self.connect_to_list.push(ResolveOverride {
            host: host.into(),
            port,
            addr: addr.into(),
        });
        self
    }

    pub fn dns_servers(mut self, servers: impl Into<String>) -> Self {
        self.dns_servers = Some(servers.into());
        self
    }

    pub fn dns_cache_timeout(mut self, timeout: Duration) -> Self {
        self.dns_cache_timeout = timeout;
        self
    }

    pub fn dns_use_global_cache(mut self, use_global: bool) -> Self {
        self.dns_use_global_cache = use_global;
        self
    }

    pub fn streaming_callback(mut self, cb: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.streaming_callback = Some(std::sync::Arc::new(cb));
        self
    }

    pub fn max_body_length(mut self, max: u64) -> Self {
        self.max_body_length = Some(max);
        self
    }

    pub fn header_callback(mut self, cb: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.header_callback = Some(std::sync::Arc::new(cb));
        self
    }

    pub fn prepare_curl_callback(
        mut self,
        cb: impl Fn(&mut curl::easy::Easy2<crate::transfer::TransferHandler>) + Send + Sync + 'static,
    ) -> Self {
        self.prepare_curl_callback = Some(std::sync::Arc::new(cb));
        self
    }

    /// `ssl_options` is reserved (spec §6); calling this at all makes
    /// `build()` fail with `UnsupportedOption`, matching "must be null
    /// (else unsupported-option)".
    pub fn ssl_options(mut self, _opaque: ()) -> Self {
        self.ssl_options_set = true;
        self
    }

    pub fn build(self) -> Result<Request, ClientError> {
        if self.ssl_options_set {
            return Err(ClientError::UnsupportedOption("ssl_options"));
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ClientError::InvalidMethod(format!(
                "unsupported URL scheme in {:?}",
                self.url
            )));
        }

        if !self.method.is_standard() && !self.allow_nonstandard_methods {
            return Err(ClientError::InvalidMethod(format!(
                "{} requires allow_nonstandard_methods",
                self.method.as_str()
            )));
        }

        match self.method.body_policy() {
            BodyPolicy::Forbidden if self.body.is_some() => {
                return Err(ClientError::InvalidBodyForMethod {
                    method: self.method.as_str().to_string(),
                    reason: "GET requests must not carry a body",
                });
            }
            BodyPolicy::Required if self.body.is_none() && !self.allow_nonstandard_methods => {
                return Err(ClientError::InvalidBodyForMethod {
                    method: self.method.as_str().to_string(),
                    reason: "method requires a body",
                });
            }
            _ => {}
        }

        let mut headers = self.headers;
        // `Expect:`/`Pragma:` default to empty so curl doesn't inject its own
        // (spec §6, "headers").
        for forced in ["Expect", "Pragma"] {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(forced)) {
                headers.push((forced.to_string(), String::new()));
            }
        }

        Ok(Request {
            url: self.url,
            method: self.method,
            headers,
            body: self.body,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            user_agent: self.user_agent,
            network_interface: self.network_interface,
            decompress_response: self.decompress_response,
            proxy_host: self.proxy_host,
            proxy_port: self.proxy_port,
            proxy_username: self.proxy_username,
            proxy_password: self.proxy_password,
            proxy_auth_mode: self.proxy_auth_mode,
            validate_cert: self.validate_cert,
            ca_certs: self.ca_certs,
            client_cert: self.client_cert,
            client_key: self.client_key,
            allow_ipv6: self.allow_ipv6,
            auth_username: self.auth_username,
            auth_password: self.auth_password,
            auth_mode: self.auth_mode,
            resolve_list: self.resolve_list,
            connect_to_list: self.connect_to_list,
            dns_servers: self.dns_servers,
            dns_cache_timeout: self.dns_cache_timeout,
            dns_use_global_cache: self.dns_use_global_cache,
            streaming_callback: self.streaming_callback,
            max_body_length: self.max_body_length,
            header_callback: self.header_callback,
            prepare_curl_callback: self.prepare_curl_callback,
            allow_nonstandard_methods: self.allow_nonstandard_methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_body_is_rejected() {
        let err = Request::builder("http://example.com")
            .method(Method::Get)
            .body(b"x".to_vec())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidBodyForMethod { .. }));
    }

    #[test]
    fn post_without_body_is_rejected_unless_opted_in() {
        let err = Request::builder("http://example.com")
            .method(Method::Post)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidBodyForMethod { .. }));

        let ok = Request::builder("http://example.com")
            .method(Method::Post)
            .allow_nonstandard_methods(true)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn nonstandard_method_requires_opt_in() {
        let err = Request::builder("http://example.com")
            .method(Method::Custom("TRACE".to_string()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidMethod(_)));

        let ok = Request::builder("http://example.com")
            .method(Method::Custom("TRACE".to_string()))
            .allow_nonstandard_methods(true)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn ssl_options_is_always_unsupported() {
        let err = Request::builder("http://example.com")
            .ssl_options(())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedOption("ssl_options")));
    }

    #[test]
    fn expect_and_pragma_default_to_empty() {
        let req = Request::builder("http://example.com").build().unwrap();
        assert_eq!(req.header_value("Expect"), Some(""));
        assert_eq!(req.header_value("Pragma"), Some(""));
    }
}

impl Request {
    #[cfg(test)]
    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
