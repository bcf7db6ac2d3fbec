//! Process-wide metrics registry.
//!
//! Counters, a fixed-bucket response-time histogram and a per-method
//! summary, rendered on demand as Prometheus exposition text. All mutation
//! goes through one mutex; rendering is a pure function of the snapshot.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Histogram bucket bounds in seconds. `+Inf` is implicit.
pub const HISTOGRAM_BOUNDS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

#[derive(Default)]
struct HistogramSeries {
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

#[derive(Default)]
struct SummarySeries {
    count: u64,
    sum: f64,
}

#[derive(Default)]
struct Registry {
    request_total: u64,
    dropped_frames_total: u64,
    response_histograms: BTreeMap<String, HistogramSeries>,
    response_summaries: BTreeMap<String, SummarySeries>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// Count one control-REST request.
pub fn increment_request() {
    REGISTRY.lock().request_total += 1;
}

/// Count audio frames dropped on port overflow.
pub fn add_dropped_frames(count: u64) {
    if count > 0 {
        REGISTRY.lock().dropped_frames_total += count;
    }
}

/// Record a response time into the per-method histogram.
pub fn observe_response_time(method: &str, seconds: f64) {
    let mut registry = REGISTRY.lock();
    let series = registry
        .response_histograms
        .entry(method.to_string())
        .or_default();
    if series.buckets.is_empty() {
        series.buckets = vec![0; HISTOGRAM_BOUNDS.len() + 1];
    }
    series.count += 1;
    series.sum += seconds;
    for (i, bound) in HISTOGRAM_BOUNDS.iter().enumerate() {
        if seconds <= *bound {
            series.buckets[i] += 1;
        }
    }
    let last = series.buckets.len() - 1;
    series.buckets[last] += 1;
}

/// Record a response time into the per-method summary.
pub fn observe_response_summary(method: &str, seconds: f64) {
    let mut registry = REGISTRY.lock();
    let series = registry
        .response_summaries
        .entry(method.to_string())
        .or_default();
    series.count += 1;
    series.sum += seconds;
}

/// Reset everything. Test support.
pub fn reset() {
    *REGISTRY.lock() = Registry::default();
}

/// Render the registry as Prometheus exposition text.
pub fn render_prometheus() -> String {
    let registry = REGISTRY.lock();
    let mut out = String::new();

    out.push_str("# HELP client_requests_total Total number of client requests\n");
    out.push_str("# TYPE client_requests_total counter\n");
    out.push_str(&format!("client_requests_total {}\n", registry.request_total));

    out.push_str("# HELP audio_dropped_frames_total Frames dropped on port overflow\n");
    out.push_str("# TYPE audio_dropped_frames_total counter\n");
    out.push_str(&format!(
        "audio_dropped_frames_total {}\n",
        registry.dropped_frames_total
    ));

    out.push_str("# HELP client_response_summary Time elapsed for response\n");
    out.push_str("# TYPE client_response_summary summary\n");
    for (method, series) in &registry.response_summaries {
        out.push_str(&format!(
            "client_response_summary_count{{method=\"{method}\"}} {}\n",
            series.count
        ));
        out.push_str(&format!(
            "client_response_summary_sum{{method=\"{method}\"}} {:.6}\n",
            series.sum
        ));
    }

    out.push_str("# HELP response_time_seconds Response time in seconds\n");
    out.push_str("# TYPE response_time_seconds histogram\n");
    for (method, series) in &registry.response_histograms {
        for (i, bound) in HISTOGRAM_BOUNDS.iter().enumerate() {
            out.push_str(&format!(
                "response_time_seconds_bucket{{method=\"{method}\",le=\"{bound}\"}} {}\n",
                series.buckets[i]
            ));
        }
        out.push_str(&format!(
            "response_time_seconds_bucket{{method=\"{method}\",le=\"+Inf\"}} {}\n",
            series.buckets[series.buckets.len() - 1]
        ));
        out.push_str(&format!(
            "response_time_seconds_count{{method=\"{method}\"}} {}\n",
            series.count
        ));
        out.push_str(&format!(
            "response_time_seconds_sum{{method=\"{method}\"}} {:.6}\n",
            series.sum
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: the registry is process-global and the test harness
    // runs tests in parallel.
    #[test]
    fn render_reflects_observations() {
        reset();
        increment_request();
        increment_request();
        observe_response_time("transcribe", 0.3);
        observe_response_summary("generate", 1.2);
        add_dropped_frames(3);

        let text = render_prometheus();
        assert!(text.contains("client_requests_total 2"));
        assert!(text.contains("audio_dropped_frames_total 3"));
        assert!(text.contains("response_time_seconds_bucket{method=\"transcribe\",le=\"0.5\"} 1"));
        assert!(text.contains("response_time_seconds_bucket{method=\"transcribe\",le=\"0.25\"} 0"));
        assert!(text.contains("response_time_seconds_bucket{method=\"transcribe\",le=\"+Inf\"} 1"));
        assert!(text.contains("client_response_summary_count{method=\"generate\"} 1"));

        // Buckets are cumulative.
        observe_response_time("m", 0.004);
        observe_response_time("m", 0.09);
        let text = render_prometheus();
        assert!(text.contains("response_time_seconds_bucket{method=\"m\",le=\"0.005\"} 1"));
        assert!(text.contains("response_time_seconds_bucket{method=\"m\",le=\"0.1\"} 2"));
        assert!(text.contains("response_time_seconds_count{method=\"m\"} 2"));
        reset();
    }
}
