//! This aggregator's own self-metrics: how long scrapes take, how many
//! shims are known, and how many scrapes have failed outright.

use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};

pub struct MonitorMetrics {
    pub scrape_duration: Histogram,
    pub scrape_failures_total: IntCounter,
    pub running_shims: IntGauge,
}

impl MonitorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            scrape_duration: register_histogram!(
                "kata_monitor_scrape_duration_seconds",
                "Time spent scraping every known shim in one pass"
            )?,
            scrape_failures_total: register_int_counter!(
                "kata_monitor_scrape_failures_total",
                "Count of individual shim scrapes that failed"
            )?,
            running_shims: register_int_gauge!(
                "kata_monitor_running_shims",
                "Number of shim sockets currently tracked"
            )?,
        })
    }
}
