use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "shim-monitor", about = "Fleet-level aggregator for per-sandbox shim metrics")]
pub struct Cli {
    /// Directory where shim sockets (`kata-shim-<sandbox-id>`) are created.
    #[arg(long, env = "KATA_MONITOR_WATCH_DIR", default_value = "/run/vc")]
    pub watch_dir: PathBuf,

    /// Base URL of the CRI runtime's debug endpoint.
    #[arg(long, env = "KATA_MONITOR_CRI_ENDPOINT", default_value = "http://localhost:8989")]
    pub cri_endpoint: String,

    /// Address this aggregator listens on.
    #[arg(long, env = "KATA_MONITOR_LISTEN_ADDRESS", default_value = "0.0.0.0:8090")]
    pub listen_address: String,

    /// Only include pod sandboxes whose CRI runtime-class annotation
    /// matches this tag. Unset means include everything.
    #[arg(long, env = "KATA_MONITOR_RUNTIME_TAG")]
    pub runtime_tag: Option<String>,

    /// Emit debug-level logs regardless of RUST_LOG.
    #[arg(long)]
    pub debug: bool,
}
