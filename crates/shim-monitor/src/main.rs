mod cache;
mod cli;
mod cri;
mod metrics;
mod scrape;
mod watcher;

use std::convert::Infallible;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::Encoder;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use cache::SandboxCache;
use cli::Cli;
use metrics::MonitorMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cache = Arc::new(Mutex::new(SandboxCache::new()));
    let metrics = Arc::new(MonitorMetrics::new()?);

    let mut changes = watcher::spawn(cli.watch_dir.clone());
    {
        let cache = cache.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let mut cache = cache.lock().await;
                match change {
                    watcher::SocketChange::Appeared { sandbox_id, path } => {
                        cache.observe_socket(&sandbox_id, path);
                    }
                    watcher::SocketChange::Disappeared { sandbox_id } => {
                        cache.forget_socket(&sandbox_id);
                    }
                }
            }
        });
    }

    cri::CriRefresher::new(cli.cri_endpoint.clone(), cli.runtime_tag.clone()).spawn(cache.clone());

    tracing::info!(listen = %cli.listen_address, watch_dir = %cli.watch_dir.display(), "shim-monitor starting");

    let listener = TcpListener::bind(&cli.listen_address).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, cache.clone(), metrics.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%err, "monitor connection ended with error");
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    cache: Arc<Mutex<SandboxCache>>,
    metrics: Arc<MonitorMetrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => {
            let timer = metrics.scrape_duration.start_timer();
            let outcome = scrape::scrape_all(&cache).await;
            timer.observe_duration();
            metrics.running_shims.set(outcome.scraped as i64);
            if outcome.failed > 0 {
                metrics.scrape_failures_total.inc_by(outcome.failed as u64);
            }

            let mut buf = Vec::new();
            let families = prometheus::gather();
            let _ = prometheus::TextEncoder::new().encode(&families, &mut buf);
            let mut body = outcome.text;
            body.push_str(&String::from_utf8_lossy(&buf));

            Ok(text_response(StatusCode::OK, body))
        }
        p if p.starts_with("/debug/pprof/") => {
            let query = req.uri().query().unwrap_or("");
            let sandbox_id = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("sandbox="))
                .map(str::to_string);
            let Some(sandbox_id) = sandbox_id else {
                return Ok(text_response(StatusCode::BAD_REQUEST, "missing ?sandbox= query param".into()));
            };

            let socket = {
                let cache = cache.lock().await;
                cache.get(&sandbox_id).map(|e| e.socket.clone())
            };
            let Some(socket) = socket else {
                return Ok(text_response(StatusCode::NOT_FOUND, format!("unknown sandbox {sandbox_id}")));
            };

            match scrape::proxy_pprof(&socket.to_string_lossy(), p).await {
                Ok(body) => Ok(text_response(StatusCode::OK, body)),
                Err(err) => Ok(text_response(StatusCode::BAD_GATEWAY, format!("proxy failed: {err}"))),
            }
        }
        other => Ok(text_response(StatusCode::NOT_FOUND, format!("no such path: {other}"))),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
