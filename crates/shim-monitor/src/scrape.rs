//! Scrapes each known shim's `/metrics` over its abstract unix socket,
//! relabels every sample with the owning sandbox's identity, renames the
//! shim runtime's own self-metrics onto a `kata_shim_` prefix, and
//! concatenates the result into one merged Prometheus text response.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::SocketAddr as StdSocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::client::conn::http1 as client_http1;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use prometheus_parse::Scrape;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::cache::SandboxCache;

pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(3);

/// Self-metric prefixes the shim's own runtime emits that get relabelled
/// onto this project's `kata_shim_` namespace so they read consistently
/// next to the container-facing metrics.
const RENAMED_PREFIXES: &[&str] = &["go_", "process_"];

pub struct ScrapeOutcome {
    pub text: String,
    pub scraped: usize,
    pub failed: usize,
}

pub async fn scrape_all(cache: &Arc<Mutex<SandboxCache>>) -> ScrapeOutcome {
    let entries = cache.lock().await.entries();
    let mut text = String::new();
    let mut scraped = 0;
    let mut failed = 0;

    for (sandbox_id, entry) in entries {
        let cri = entry.cri.clone();
        match scrape_one(entry.socket.to_string_lossy().as_ref()).await {
            Ok(body) => {
                scraped += 1;
                text.push_str(&relabel(&body, &sandbox_id, cri.as_ref()));
            }
            Err(err) => {
                failed += 1;
                tracing::debug!(sandbox_id, %err, "scrape failed");
            }
        }
    }

    ScrapeOutcome { text, scraped, failed }
}

async fn scrape_one(socket_name: &str) -> anyhow::Result<String> {
    fetch_over_abstract_socket(socket_name, "/metrics").await
}

/// Used by the monitor's own pprof route: forwards a single sandbox's
/// request to its shim's management endpoint over the same abstract
/// unix socket used for scraping.
pub async fn proxy_pprof(socket_name: &str, path_and_query: &str) -> anyhow::Result<String> {
    fetch_over_abstract_socket(socket_name, path_and_query).await
}

async fn fetch_over_abstract_socket(socket_name: &str, path_and_query: &str) -> anyhow::Result<String> {
    let addr = StdSocketAddr::from_abstract_name(socket_name.as_bytes())?;
    let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    std_stream.set_nonblocking(true)?;
    let stream = UnixStream::from_std(std_stream)?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = client_http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .uri(path_and_query.parse::<Uri>()?)
        .header("host", "localhost")
        .body(http_body_util::Empty::<Bytes>::new())?;

    let resp = tokio::time::timeout(SCRAPE_TIMEOUT, sender.send_request(req)).await??;
    let body = http_body_util::BodyExt::collect(resp.into_body()).await?.to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn relabel(body: &str, sandbox_id: &str, cri: Option<&crate::cache::CriMetadata>) -> String {
    let lines = body.lines().map(|l| l.to_string());
    let parsed = match Scrape::parse(lines) {
        Ok(p) => p,
        Err(err) => {
            tracing::debug!(sandbox_id, %err, "failed to parse scraped metrics");
            return String::new();
        }
    };

    let mut out = String::new();
    for sample in parsed.samples {
        let mut name = sample.metric.clone();
        for prefix in RENAMED_PREFIXES {
            if let Some(rest) = name.strip_prefix(prefix) {
                name = format!("kata_shim_{rest}");
                break;
            }
        }

        let mut labels: Vec<String> = sample
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        labels.push(format!("sandbox_id=\"{sandbox_id}\""));
        if let Some(cri) = cri {
            labels.push(format!("cri_uid=\"{}\"", cri.uid));
            labels.push(format!("cri_name=\"{}\"", cri.name));
            labels.push(format!("cri_namespace=\"{}\"", cri.namespace));
        }

        let value = match sample.value {
            prometheus_parse::Value::Counter(v) => v,
            prometheus_parse::Value::Gauge(v) => v,
            prometheus_parse::Value::Untyped(v) => v,
            prometheus_parse::Value::Histogram(_) | prometheus_parse::Value::Summary(_) => continue,
        };

        out.push_str(&format!("{name}{{{}}} {value}\n", labels.join(",")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CriMetadata;

    #[test]
    fn relabel_adds_sandbox_and_cri_labels_and_renames_prefix() {
        let body = "go_goroutines 5\nkata_shim_requests_total 3\n";
        let cri = CriMetadata {
            uid: "u1".into(),
            name: "pod-1".into(),
            namespace: "default".into(),
        };
        let out = relabel(body, "sbx1", Some(&cri));
        assert!(out.contains("kata_shim_goroutines{"));
        assert!(out.contains("sandbox_id=\"sbx1\""));
        assert!(out.contains("cri_name=\"pod-1\""));
    }

    #[test]
    fn relabel_without_cri_metadata_still_adds_sandbox_id() {
        let body = "kata_shim_requests_total 1\n";
        let out = relabel(body, "sbx2", None);
        assert!(out.contains("sandbox_id=\"sbx2\""));
        assert!(!out.contains("cri_name"));
    }
}
