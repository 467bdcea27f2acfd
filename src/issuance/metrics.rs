use std::{sync::OnceLock, time::Duration};

use log::warn;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static SHARED: OnceLock<Option<VenafiMetrics>> = OnceLock::new();

/// Per-call counters and latency for the Venafi connector.
///
/// Handles are cheap clones over the same collectors.
#[derive(Clone)]
pub struct VenafiMetrics {
    requests: CounterVec,
    latency: HistogramVec,
}

impl VenafiMetrics {
    /// Creates the collectors and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Fails when the names are already registered there.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let requests = CounterVec::new(
            Opts::new(
                "venafi_client_requests_total",
                "Venafi API calls by call and result",
            ),
            &["api_call", "result"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "venafi_client_request_duration_seconds",
                "Latency of Venafi API calls",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["api_call"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self { requests, latency })
    }

    /// Metrics on the process-wide default registry; `None` if registration failed.
    pub fn shared() -> Option<Self> {
        SHARED
            .get_or_init(|| match Self::new(prometheus::default_registry()) {
                Ok(metrics) => Some(metrics),
                Err(err) => {
                    warn!("[venafi] client metrics disabled: {err}");
                    None
                }
            })
            .clone()
    }

    pub fn observe(&self, api_call: &str, result: &str, elapsed: Duration) {
        self.requests.with_label_values(&[api_call, result]).inc();
        self.latency
            .with_label_values(&[api_call])
            .observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, api_call: &str, result: &str) -> f64 {
        self.requests.with_label_values(&[api_call, result]).get()
    }

    pub fn latency_samples(&self, api_call: &str) -> u64 {
        self.latency.with_label_values(&[api_call]).get_sample_count()
    }
}
