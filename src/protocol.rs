//! HTTP protocol: request definitions, global configuration and the network boundary.
//!
//! A [`Request`] step only describes an exchange. The [`ProtocolExecutor`] resolves its
//! templates against the running user's session, merges the global [`HttpProtocol`]
//! configuration with the step's own settings (the step wins) and performs the
//! exchange through a [`Transport`]. The executor never touches the session and never
//! retries; checks and retries are scenario concerns.
use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    check::Check,
    error::{ConfigurationError, TransportError, UserError},
    session::Session,
    template::Template,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Inserts or replaces a header, comparing names case-insensitively.
pub fn merge_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

/// The network boundary of the engine.
///
/// Implementations perform exactly one exchange per call. Latency is measured by the
/// [`ProtocolExecutor`] around this call, and timeouts are enforced there too.
///
/// # Example
/// ```rust
/// use horda::{
///     error::TransportError,
///     protocol::{HttpRequest, HttpResponse, Transport},
/// };
///
/// struct AlwaysOk;
///
/// impl Transport for AlwaysOk {
///     async fn send(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
///         Ok(HttpResponse { status: 200, headers: vec![], body: String::new() })
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// A named, reusable set of headers shared by several requests.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderSet {
    pub name: String,
    pub headers: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new<I, K, V>(name: impl Into<String>, headers: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Arc::new(Self {
            name: name.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(Template),
    Json(Template),
    Form(Vec<(String, Template)>),
}

/// A request step.
#[derive(Debug, Clone)]
pub struct Request {
    name: String,
    method: Method,
    path: Template,
    header_set: Option<Arc<HeaderSet>>,
    headers: Vec<(String, Template)>,
    body: Body,
    checks: Vec<Check>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(name: impl Into<String>, method: Method, path: impl Into<Template>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            header_set: None,
            headers: Vec::new(),
            body: Body::Empty,
            checks: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(name: impl Into<String>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Get, path)
    }

    pub fn post(name: impl Into<String>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Post, path)
    }

    pub fn put(name: impl Into<String>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Put, path)
    }

    pub fn delete(name: impl Into<String>, path: impl Into<Template>) -> Self {
        Self::new(name, Method::Delete, path)
    }

    pub fn headers(mut self, set: Arc<HeaderSet>) -> Self {
        self.header_set = Some(set);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Template>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn form_param(mut self, name: impl Into<String>, value: impl Into<Template>) -> Self {
        let param = (name.into(), value.into());
        match &mut self.body {
            Body::Form(params) => params.push(param),
            _ => self.body = Body::Form(vec![param]),
        }
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn checks(mut self, checks: impl IntoIterator<Item = Check>) -> Self {
        self.checks.extend(checks);
        self
    }

    /// Overrides the protocol's request timeout for this step.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &Template {
        &self.path
    }

    pub fn check_list(&self) -> &[Check] {
        &self.checks
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn templates(&self) -> Vec<&Template> {
        let mut templates = vec![&self.path];
        templates.extend(self.headers.iter().map(|(_, t)| t));
        match &self.body {
            Body::Empty => {}
            Body::Text(t) | Body::Json(t) => templates.push(t),
            Body::Form(params) => templates.extend(params.iter().map(|(_, t)| t)),
        }
        templates
    }
}

/// Opt-in discovery of HTML sub-resources (scripts, images, stylesheets).
///
/// A discovered URL is fetched when it matches one of the `allow` patterns (or
/// `allow` is empty) and none of the `deny` patterns.
#[derive(Debug, Clone)]
pub struct ResourceInference {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    scanner: Regex,
}

impl ResourceInference {
    pub fn new<S: AsRef<str>>(allow: &[S], deny: &[S]) -> Result<Self, ConfigurationError> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| compile_regex(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
            scanner: compile_regex(
                r#"<(?:script|img|link)\b[^>]*?\b(?:src|href)\s*=\s*["']([^"'#]+)["']"#,
            )?,
        })
    }

    pub fn accepts(&self, url: &str) -> bool {
        (self.allow.is_empty() || self.allow.iter().any(|r| r.is_match(url)))
            && !self.deny.iter().any(|r| r.is_match(url))
    }

    /// Absolute URLs of the accepted resources referenced by `body`, without duplicates.
    pub fn discover(&self, page_url: &str, body: &str) -> Vec<String> {
        let Ok(base) = url::Url::parse(page_url) else {
            return Vec::new();
        };
        let mut found: Vec<String> = Vec::new();
        for capture in self.scanner.captures_iter(body) {
            let Some(raw) = capture.get(1) else { continue };
            let Ok(resolved) = base.join(raw.as_str()) else {
                continue;
            };
            let resolved = resolved.to_string();
            if self.accepts(&resolved) && !found.contains(&resolved) {
                found.push(resolved);
            }
        }
        found
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, ConfigurationError> {
    Regex::new(pattern).map_err(|e| ConfigurationError::Regex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Global protocol configuration, shared by every request of a simulation.
#[derive(Debug, Clone, TypedBuilder)]
pub struct HttpProtocol {
    /// Prefix for relative request paths.
    #[builder(default, setter(into, strip_option))]
    pub base_url: Option<String>,
    /// Headers sent with every request unless a step overrides them.
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default, setter(into, strip_option))]
    pub user_agent: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub accept: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub accept_encoding: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub accept_language: Option<String>,
    #[builder(default = Duration::from_secs(60))]
    pub request_timeout: Duration,
    /// Maximum number of exchanges in flight across all virtual users.
    // 120 per cpu.
    #[builder(default = num_cpus::get() * 120)]
    pub max_connections: usize,
    /// How long a request waits for a free connection before failing.
    #[builder(default = Duration::from_secs(60))]
    pub acquire_timeout: Duration,
    #[builder(default)]
    pub accept_invalid_certs: bool,
    #[builder(default, setter(strip_option))]
    pub infer_resources: Option<ResourceInference>,
}

impl Default for HttpProtocol {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HttpProtocol {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_connections == 0 {
            return Err(ConfigurationError::Protocol(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if let Some(base) = &self.base_url {
            url::Url::parse(base).map_err(|e| {
                ConfigurationError::Protocol(format!("invalid base url `{base}`: {e}"))
            })?;
        }
        Ok(())
    }

    /// The protocol-level headers, in the order they are applied.
    pub fn default_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let named = [
            ("Accept", &self.accept),
            ("Accept-Encoding", &self.accept_encoding),
            ("Accept-Language", &self.accept_language),
            ("User-Agent", &self.user_agent),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                merge_header(&mut headers, name, value.clone());
            }
        }
        for (name, value) in &self.headers {
            merge_header(&mut headers, name, value.clone());
        }
        headers
    }

    fn url_for(&self, path: &str) -> Result<String, UserError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            )),
            None => Err(UserError::Request(format!(
                "relative path `{path}` requires a base url"
            ))),
        }
    }
}

/// Result of one exchange with the system under test.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub result: Result<HttpResponse, UserError>,
    pub latency: Duration,
}

pub struct ProtocolExecutor<T> {
    protocol: HttpProtocol,
    default_headers: Vec<(String, String)>,
    transport: T,
    pool: Arc<Semaphore>,
}

impl<T: Transport> ProtocolExecutor<T> {
    pub fn new(protocol: HttpProtocol, transport: T) -> Result<Self, ConfigurationError> {
        protocol.validate()?;
        Ok(Self {
            default_headers: protocol.default_headers(),
            pool: Arc::new(Semaphore::new(protocol.max_connections)),
            protocol,
            transport,
        })
    }

    pub fn protocol(&self) -> &HttpProtocol {
        &self.protocol
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Resolves `request` against `session` into a concrete outbound request.
    pub fn prepare<R: Rng>(
        &self,
        request: &Request,
        session: &Session,
        rng: &mut R,
    ) -> Result<HttpRequest, UserError> {
        let path = request.path.resolve(session, rng)?;
        let url = self.protocol.url_for(&path)?;

        let mut headers = self.default_headers.clone();
        if let Some(set) = &request.header_set {
            for (name, value) in &set.headers {
                merge_header(&mut headers, name, value.clone());
            }
        }
        for (name, value) in &request.headers {
            merge_header(&mut headers, name, value.resolve(session, rng)?);
        }

        let (body, content_type) = match &request.body {
            Body::Empty => (None, None),
            Body::Text(t) => (Some(t.resolve(session, rng)?), None),
            Body::Json(t) => (Some(t.resolve(session, rng)?), Some("application/json")),
            Body::Form(params) => {
                let mut form = url::form_urlencoded::Serializer::new(String::new());
                for (name, value) in params {
                    form.append_pair(name, &value.resolve(session, rng)?);
                }
                (
                    Some(form.finish()),
                    Some("application/x-www-form-urlencoded"),
                )
            }
        };
        if let Some(content_type) = content_type {
            if find_header(&headers, "Content-Type").is_none() {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        Ok(HttpRequest {
            method: request.method,
            url,
            headers,
            body,
        })
    }

    /// Timeout applying to `request`: its own override or the protocol default.
    pub fn timeout_for(&self, request: &Request) -> Duration {
        request.timeout.unwrap_or(self.protocol.request_timeout)
    }

    /// Performs one exchange, waiting for a pooled connection first.
    pub async fn send(&self, request: HttpRequest, timeout: Duration) -> Exchange {
        let waiting = Instant::now();
        let acquire = tokio::time::timeout(
            self.protocol.acquire_timeout,
            self.pool.clone().acquire_owned(),
        )
        .await;
        let _permit = match acquire {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Exchange {
                    result: Err(UserError::Request("connection pool is closed".to_string())),
                    latency: waiting.elapsed(),
                };
            }
            Err(_) => {
                return Exchange {
                    result: Err(UserError::Request(format!(
                        "no connection available within {:?}",
                        self.protocol.acquire_timeout
                    ))),
                    latency: waiting.elapsed(),
                };
            }
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(UserError::from(e)),
            Err(_) => Err(UserError::StepTimeout(timeout)),
        };
        Exchange {
            result,
            latency: start.elapsed(),
        }
    }

    /// Fetches the sub-resources of an HTML page when resource inference is enabled.
    ///
    /// Returns one `(url, exchange)` pair per fetched resource.
    pub async fn fetch_resources(
        &self,
        page_url: &str,
        page: &HttpResponse,
        timeout: Duration,
    ) -> Vec<(String, Exchange)> {
        let Some(inference) = &self.protocol.infer_resources else {
            return Vec::new();
        };
        let is_html = page
            .header("Content-Type")
            .is_some_and(|ct| ct.contains("text/html"));
        if !is_html {
            return Vec::new();
        }

        let urls = inference.discover(page_url, &page.body);
        tracing::debug!("Fetching {} resources of {page_url}", urls.len());
        let fetches = urls.into_iter().map(|url| async move {
            let request = HttpRequest {
                method: Method::Get,
                url: url.clone(),
                headers: self.default_headers.clone(),
                body: None,
            };
            (url, self.send(request, timeout).await)
        });
        futures::future::join_all(fetches).await
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use super::*;

    /// [`Transport`] backed by a shared `reqwest` client.
    ///
    /// The client is built once per simulation; cloning it is cheap and shares the
    /// underlying connection pool.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(protocol: &HttpProtocol) -> Result<Self, ConfigurationError> {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(protocol.max_connections)
                .danger_accept_invalid_certs(protocol.accept_invalid_certs)
                .build()
                .map_err(|e| ConfigurationError::Protocol(e.to_string()))?;
            Ok(Self { client })
        }

        pub fn from_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl Transport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response.text().await.map_err(classify)?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }

    fn classify(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_builder() {
            TransportError::InvalidRequest(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    struct Echo;

    impl Transport for Echo {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                headers: vec![],
                body: request.url,
            })
        }
    }

    struct Stalled;

    impl Transport for Stalled {
        async fn send(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(TransportError::Timeout)
        }
    }

    fn protocol() -> HttpProtocol {
        HttpProtocol::builder()
            .base_url("http://localhost:8080")
            .accept("application/json")
            .user_agent("horda load test")
            .headers(vec![("X-Trace".to_string(), "on".to_string())])
            .build()
    }

    #[test]
    fn step_headers_win_over_protocol_headers() {
        let executor = ProtocolExecutor::new(protocol(), Echo).unwrap();
        let set = HeaderSet::new("headers_0", [("accept", "text/html"), ("Sec-Fetch-Mode", "navigate")]);
        let request = Request::get("get greeting", "/greet/${name}")
            .headers(set)
            .header("x-trace", "${name}");
        let session = Session::new(1, "s").set("name", "ana");

        let http = executor
            .prepare(&request, &session, &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(http.url, "http://localhost:8080/greet/ana");
        assert_eq!(http.header("Accept"), Some("text/html"));
        assert_eq!(http.header("User-Agent"), Some("horda load test"));
        assert_eq!(http.header("X-Trace"), Some("ana"));
        assert_eq!(http.header("sec-fetch-mode"), Some("navigate"));
        assert_eq!(
            http.headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case("accept")).count(),
            1
        );
    }

    #[test]
    fn form_params_are_url_encoded() {
        let executor = ProtocolExecutor::new(protocol(), Echo).unwrap();
        let request = Request::post("request_3", "/computers/381")
            .form_param("name", "ACE & co")
            .form_param("introduced", "")
            .form_param("company", "1");

        let http = executor
            .prepare(&request, &Session::new(1, "s"), &mut StdRng::seed_from_u64(1))
            .unwrap();

        assert_eq!(http.body.as_deref(), Some("name=ACE+%26+co&introduced=&company=1"));
        assert_eq!(
            http.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn absolute_urls_bypass_the_base_url() {
        let executor = ProtocolExecutor::new(HttpProtocol::default(), Echo).unwrap();
        let rng = &mut StdRng::seed_from_u64(1);
        let session = Session::new(1, "s");

        let absolute = Request::get("abs", "https://example.org/x");
        assert_eq!(
            executor.prepare(&absolute, &session, rng).unwrap().url,
            "https://example.org/x"
        );

        let relative = Request::get("rel", "/x");
        assert_eq!(
            executor.prepare(&relative, &session, rng).unwrap_err().kind(),
            "RequestError"
        );
    }

    #[test]
    fn invalid_protocols_are_rejected() {
        let zero = HttpProtocol::builder().max_connections(0).build();
        assert!(ProtocolExecutor::new(zero, Echo).is_err());

        let bad_url = HttpProtocol::builder().base_url("not a url").build();
        assert!(ProtocolExecutor::new(bad_url, Echo).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_exchanges_time_out() {
        let executor = ProtocolExecutor::new(protocol(), Stalled).unwrap();
        let request = HttpRequest {
            method: Method::Get,
            url: "http://localhost:8080/slow".to_string(),
            headers: vec![],
            body: None,
        };
        let exchange = executor.send(request, Duration::from_secs(2)).await;
        assert_eq!(
            exchange.result.unwrap_err(),
            UserError::StepTimeout(Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_fails_after_acquire_timeout() {
        let protocol = HttpProtocol::builder()
            .base_url("http://localhost:8080")
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(100))
            .build();
        let executor = Arc::new(ProtocolExecutor::new(protocol, Stalled).unwrap());
        let request = HttpRequest {
            method: Method::Get,
            url: "http://localhost:8080/slow".to_string(),
            headers: vec![],
            body: None,
        };

        let holder = {
            let executor = executor.clone();
            let request = request.clone();
            tokio::spawn(async move { executor.send(request, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        let exchange = executor.send(request, Duration::from_secs(10)).await;
        let err = exchange.result.unwrap_err();
        assert_eq!(err.kind(), "RequestError");
        assert!(err.to_string().contains("no connection available"));
        holder.abort();
    }

    #[test]
    fn resource_inference_filters() {
        let inference = ResourceInference::new(&[] as &[&str], &[r".*\.css", r".*\.png"]).unwrap();
        let body = r#"<html><script src="/app.js"></script><link href="style.css">
            <img src='https://cdn.example.org/logo.png'><img src="/app.js"></html>"#;
        let found = inference.discover("https://computer-database.example.org/computers", body);
        assert_eq!(
            found,
            vec!["https://computer-database.example.org/app.js".to_string()]
        );
    }
}
