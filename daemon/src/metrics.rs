use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for Prometheus-compatible output. Unit counters are
/// keyed by tool id.
pub struct MetricsCollector {
    unit_executions: DashMap<String, AtomicU64>,
    unit_successes: DashMap<String, AtomicU64>,
    unit_failures: DashMap<String, AtomicU64>,
    unit_durations: DashMap<String, Vec<u64>>, // Store last 100 durations for percentiles
    jobs_started: AtomicU64,
    jobs_finished: AtomicU64,
    active_jobs: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            unit_executions: DashMap::new(),
            unit_successes: DashMap::new(),
            unit_failures: DashMap::new(),
            unit_durations: DashMap::new(),
            jobs_started: AtomicU64::new(0),
            jobs_finished: AtomicU64::new(0),
            active_jobs: AtomicU64::new(0),
        }
    }

    pub fn record_execution(&self, tool_id: &str) {
        self.unit_executions
            .entry(tool_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, tool_id: &str, duration_ms: u64) {
        self.unit_successes
            .entry(tool_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        // Keep the last 100 durations for percentile calculation
        let mut entry = self
            .unit_durations
            .entry(tool_id.to_string())
            .or_insert_with(Vec::new);
        entry.push(duration_ms);
        let len = entry.len();
        if len > 100 {
            entry.drain(0..len - 100);
        }
    }

    pub fn record_failure(&self, tool_id: &str) {
        self.unit_failures
            .entry(tool_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        self.jobs_finished.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP scanhive_jobs_started_total Total number of scan jobs started\n");
        output.push_str("# TYPE scanhive_jobs_started_total counter\n");
        output.push_str(&format!(
            "scanhive_jobs_started_total {}\n\n",
            self.jobs_started.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP scanhive_jobs_finished_total Total number of scan jobs that reached a terminal state\n");
        output.push_str("# TYPE scanhive_jobs_finished_total counter\n");
        output.push_str(&format!(
            "scanhive_jobs_finished_total {}\n\n",
            self.jobs_finished.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP scanhive_active_jobs Currently running scan jobs\n");
        output.push_str("# TYPE scanhive_active_jobs gauge\n");
        output.push_str(&format!(
            "scanhive_active_jobs {}\n\n",
            self.active_jobs.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP scanhive_unit_executions_total Total number of tool executions\n");
        output.push_str("# TYPE scanhive_unit_executions_total counter\n");
        for entry in self.unit_executions.iter() {
            output.push_str(&format!(
                "scanhive_unit_executions_total{{tool=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP scanhive_unit_successes_total Total number of successful tool executions\n");
        output.push_str("# TYPE scanhive_unit_successes_total counter\n");
        for entry in self.unit_successes.iter() {
            output.push_str(&format!(
                "scanhive_unit_successes_total{{tool=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP scanhive_unit_failures_total Total number of failed tool executions\n");
        output.push_str("# TYPE scanhive_unit_failures_total counter\n");
        for entry in self.unit_failures.iter() {
            output.push_str(&format!(
                "scanhive_unit_failures_total{{tool=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP scanhive_unit_duration_ms Tool execution duration percentiles\n");
        output.push_str("# TYPE scanhive_unit_duration_ms gauge\n");
        for entry in self.unit_durations.iter() {
            let mut durations = entry.value().clone();
            if !durations.is_empty() {
                durations.sort_unstable();
                let p50 = percentile(&durations, 50.0);
                let p95 = percentile(&durations, 95.0);
                let p99 = percentile(&durations, 99.0);

                output.push_str(&format!(
                    "scanhive_unit_duration_ms{{tool=\"{}\",quantile=\"0.5\"}} {}\n",
                    entry.key(),
                    p50
                ));
                output.push_str(&format!(
                    "scanhive_unit_duration_ms{{tool=\"{}\",quantile=\"0.95\"}} {}\n",
                    entry.key(),
                    p95
                ));
                output.push_str(&format!(
                    "scanhive_unit_duration_ms{{tool=\"{}\",quantile=\"0.99\"}} {}\n",
                    entry.key(),
                    p99
                ));
            }
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_export() {
        let metrics = MetricsCollector::new();
        metrics.job_started();
        metrics.record_execution("nmap_top_ports");
        metrics.record_success("nmap_top_ports", 1200);
        metrics.record_execution("whatweb");
        metrics.record_failure("whatweb");
        metrics.job_finished();

        let out = metrics.export();
        assert!(out.contains("scanhive_jobs_started_total 1"));
        assert!(out.contains("scanhive_jobs_finished_total 1"));
        assert!(out.contains("scanhive_active_jobs 0"));
        assert!(out.contains("scanhive_unit_executions_total{tool=\"nmap_top_ports\"} 1"));
        assert!(out.contains("scanhive_unit_failures_total{tool=\"whatweb\"} 1"));
        assert!(out.contains("scanhive_unit_duration_ms{tool=\"nmap_top_ports\",quantile=\"0.5\"} 1200"));
    }

    #[test]
    fn percentile_handles_small_samples() {
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[42], 99.0), 42);
        let data: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&data, 50.0), 51);
        assert_eq!(percentile(&data, 99.0), 99);
    }

    #[test]
    fn durations_are_bounded() {
        let metrics = MetricsCollector::new();
        for i in 0..250 {
            metrics.record_success("t", i);
        }
        let len = metrics.unit_durations.get("t").unwrap().len();
        assert_eq!(len, 100);
    }
}
