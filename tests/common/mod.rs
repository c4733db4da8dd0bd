//! In-memory system under test shared by the integration tests.
#![allow(dead_code)]
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use horda::{
    error::TransportError,
    protocol::{HttpProtocol, HttpRequest, HttpResponse, Transport},
};
use parking_lot::Mutex;

pub const BASE: &str = "http://sut";

/// Routes:
/// - `/greet/{name}`: 200 with `{"id": "{name}"}`
/// - `/echo/{anything}`: 200
/// - `/status/{code}`: `code`
/// - `/flaky/{key}`: 500 on the first hit of each key, 200 afterwards
/// - `/page`: an HTML page referencing `/echo/app.css`, `/missing.js` and `logo.png`
/// - `/slow`: 200 after 300ms
/// - `/work`: 200 after 1s
/// - `/hang`: never answers in practice
/// - anything else: 404
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    hits: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn hits(&self) -> Vec<String> {
        self.state.hits.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .hits
            .lock()
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }

    /// Highest number of exchanges observed at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.url.trim_start_matches(BASE).to_string();
        let seen = {
            let mut hits = self.state.hits.lock();
            let seen = hits.iter().filter(|p| **p == path).count();
            hits.push(path.clone());
            seen
        };
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.state.in_flight);

        let mut body = String::new();
        let mut headers = vec![];
        let status = if path.starts_with("/flaky/") {
            if seen == 0 { 500 } else { 200 }
        } else if path == "/page" {
            headers.push(("Content-Type".to_string(), "text/html; charset=utf-8".to_string()));
            body = concat!(
                r#"<html><head><link rel="stylesheet" href="/echo/app.css">"#,
                r#"<script src="/missing.js"></script></head>"#,
                r#"<body><img src="logo.png"><img src="/echo/app.css"></body></html>"#,
            )
            .to_string();
            200
        } else if let Some(name) = path.strip_prefix("/greet/") {
            body = format!("{{\"id\": \"{name}\"}}");
            200
        } else if path.starts_with("/echo/") {
            200
        } else if let Some(code) = path.strip_prefix("/status/") {
            code.parse()
                .map_err(|_| TransportError::InvalidRequest(path.clone()))?
        } else {
            match path.as_str() {
                "/slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    200
                }
                "/work" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    200
                }
                "/hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    200
                }
                _ => 404,
            }
        };
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

pub fn protocol() -> HttpProtocol {
    HttpProtocol::builder().base_url(BASE).build()
}
