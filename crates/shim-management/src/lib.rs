//! A tiny local HTTP endpoint each shim exposes on an abstract unix
//! socket: self metrics in Prometheus text format, the sandbox's agent
//! URL, and a pprof proxy used by the fleet-level monitor to reach a
//! single shim's profiling endpoints without its own listener.

use std::convert::Infallible;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr as StdSocketAddr, UnixListener as StdUnixListener};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::UnixListener;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bind abstract socket {0:?}: {1}")]
    Bind(String, std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default timeout for the pprof proxy's upstream request.
pub const PPROF_PROXY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ManagementEndpoint {
    registry: Registry,
    agent_url: String,
    pprof_upstream: Option<String>,
}

impl ManagementEndpoint {
    pub fn new(registry: Registry, agent_url: impl Into<String>, pprof_upstream: Option<String>) -> Self {
        Self {
            registry,
            agent_url: agent_url.into(),
            pprof_upstream,
        }
    }

    /// Binds an abstract unix socket named `name` (no leading NUL needed;
    /// that's implicit in "abstract"), so the socket disappears as soon
    /// as the shim process exits rather than leaving a stale path file.
    pub fn bind_abstract(name: &str) -> Result<UnixListener> {
        let addr = StdSocketAddr::from_abstract_name(name.as_bytes())
            .map_err(|err| Error::Bind(name.to_string(), err))?;
        let std_listener = StdUnixListener::bind_addr(&addr).map_err(|err| Error::Bind(name.to_string(), err))?;
        std_listener.set_nonblocking(true)?;
        Ok(UnixListener::from_std(std_listener)?)
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let this = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { this.handle(req).await }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%err, "management connection ended with error");
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let response = match path.as_str() {
            "/metrics" => self.metrics(),
            "/agent-url" => text_response(StatusCode::OK, self.agent_url.clone()),
            p if p.starts_with("/debug/pprof/") => self.pprof_proxy(req).await,
            _ => text_response(StatusCode::NOT_FOUND, "not found".to_string()),
        };
        Ok(response)
    }

    fn metrics(&self) -> Response<Full<Bytes>> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buf) {
            tracing::warn!(%err, "failed to encode metrics");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error".to_string());
        }
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(buf)))
            .unwrap()
    }

    /// Forwards `/debug/pprof/*` to the configured upstream (normally
    /// localhost:PORT inside the same netns) and rewrites any `href`
    /// query-string links in the body so they keep pointing back through
    /// this proxy rather than at the upstream's own bare address.
    async fn pprof_proxy(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(upstream) = &self.pprof_upstream else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "pprof not configured".to_string());
        };
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("{upstream}{path_and_query}");

        let client = reqwest::Client::builder()
            .timeout(PPROF_PROXY_TIMEOUT)
            .build()
            .expect("reqwest client");

        match client.get(&url).send().await {
            Ok(resp) => {
                let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                match resp.text().await {
                    Ok(body) => {
                        let rewritten = rewrite_hrefs(&body);
                        Response::builder()
                            .status(status)
                            .header("content-type", "text/html; charset=utf-8")
                            .body(Full::new(Bytes::from(rewritten)))
                            .unwrap()
                    }
                    Err(err) => text_response(StatusCode::BAD_GATEWAY, format!("upstream body: {err}")),
                }
            }
            Err(err) => text_response(StatusCode::BAD_GATEWAY, format!("upstream request failed: {err}")),
        }
    }
}

/// Rewrites `href="PROF?Q"`-shaped links to prefix the query string, so
/// following a link from the monitor's merged pprof index still resolves
/// through the monitor rather than landing on a bare shim path.
fn rewrite_hrefs(body: &str) -> String {
    body.replace("href=\"", "href=\"/debug/pprof/")
        .replace("/debug/pprof//debug/pprof/", "/debug/pprof/")
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_hrefs_prefixes_plain_links() {
        let body = r#"<a href="heap?debug=1">heap</a>"#;
        let rewritten = rewrite_hrefs(body);
        assert_eq!(rewritten, r#"<a href="/debug/pprof/heap?debug=1">heap</a>"#);
    }

    #[tokio::test]
    async fn metrics_endpoint_encodes_registered_counters() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("kata_shim_test_total", "test").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let endpoint = ManagementEndpoint::new(registry, "vsock://3:1024", None);
        let response = endpoint.metrics();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
