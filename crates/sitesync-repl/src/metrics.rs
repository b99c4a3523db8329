//! Prometheus-compatible replication metrics.
//!
//! Snapshots of the queue, pool and worker counters of each site, plus per-replicator run totals,
//! rendered in Prometheus text exposition format.

use crate::pool::PoolStats;
use crate::queue::QueueStats;
use crate::status::{ReplicationStatus, Status};
use crate::worker::WorkerStatsSnapshot;
use std::collections::BTreeMap;

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "sitesync_repl_tasks_queued_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: &'static str,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a counter.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter",
            labels,
            value,
        }
    }

    /// Create a gauge.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge",
            labels,
            value,
        }
    }

    /// Format as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));

        if self.labels.is_empty() {
            output.push_str(&format!("{} {}\n", self.name, self.format_value()));
        } else {
            let label_str = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!(
                "{}{{{}}} {}\n",
                self.name,
                label_str,
                self.format_value()
            ));
        }
        output
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

/// Snapshot of one site's queue and workers.
#[derive(Debug, Clone, Default)]
pub struct SiteMetrics {
    /// Site id.
    pub site_id: String,
    /// Queue counters.
    pub queue: QueueStats,
    /// Tasks pending or locked.
    pub queue_size: usize,
    /// Tasks locked by a worker.
    pub active_tasks: usize,
    /// Live workers.
    pub pool_size: usize,
    /// Pool lifetime counters.
    pub pool: PoolStats,
    /// Worker counters.
    pub workers: WorkerStatsSnapshot,
}

impl SiteMetrics {
    /// Empty snapshot for a site.
    pub fn new(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            ..Self::default()
        }
    }

    /// Produce the list of Prometheus metrics.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let labels = vec![("site_id".to_string(), self.site_id.clone())];
        let counters = [
            ("sitesync_repl_tasks_queued_total", "Tasks accepted by the site queue", self.queue.queued),
            ("sitesync_repl_tasks_taken_total", "Tasks locked by workers", self.queue.taken),
            ("sitesync_repl_tasks_succeeded_total", "Tasks completed successfully", self.queue.succeeded),
            ("sitesync_repl_tasks_failed_total", "Tasks failed for good", self.queue.failed),
            ("sitesync_repl_tasks_requeued_total", "Tasks requeued after a retryable failure", self.queue.requeued),
            ("sitesync_repl_tasks_unlocked_total", "Tasks put back without an attempt", self.queue.unlocked),
            ("sitesync_repl_tasks_rejected_total", "Offers rejected by a full queue", self.queue.rejected),
            ("sitesync_repl_tasks_unsupported_total", "Tasks skipped as unsupported", self.workers.unsupported_skipped),
            ("sitesync_repl_site_unresolved_total", "Tasks skipped because the site could not be resolved", self.workers.unresolved_site),
            ("sitesync_repl_workers_started_total", "Workers started", self.pool.workers_started),
            ("sitesync_repl_workers_stopped_total", "Workers stopped", self.pool.workers_stopped),
        ];

        let mut metrics: Vec<Metric> = counters
            .iter()
            .map(|(name, help, value)| Metric::counter(name, help, labels.clone(), *value as f64))
            .collect();
        metrics.push(Metric::gauge(
            "sitesync_repl_queue_size",
            "Tasks pending or locked",
            labels.clone(),
            self.queue_size as f64,
        ));
        metrics.push(Metric::gauge(
            "sitesync_repl_queue_active",
            "Tasks locked by a worker",
            labels.clone(),
            self.active_tasks as f64,
        ));
        metrics.push(Metric::gauge(
            "sitesync_repl_pool_size",
            "Live workers",
            labels,
            self.pool_size as f64,
        ));
        metrics
    }

    /// Fraction of released tasks that failed for good, or 0.0 if none were released.
    pub fn failure_rate(&self) -> f64 {
        let released = self.queue.succeeded + self.queue.failed;
        if released == 0 {
            return 0.0;
        }
        self.queue.failed as f64 / released as f64
    }
}

/// Totals of one replicator's last run.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorMetrics {
    /// Replicator name.
    pub name: String,
    /// Items pushed.
    pub push_count: u64,
    /// Items pulled.
    pub pull_count: u64,
    /// Items that failed either way.
    pub fail_count: u64,
    /// Bytes moved either way.
    pub bytes: u64,
    /// Run length in seconds.
    pub duration_secs: i64,
    /// Whether the run succeeded.
    pub succeeded: bool,
}

impl ReplicatorMetrics {
    /// Build from a finished run.
    pub fn from_status(status: &ReplicationStatus) -> Self {
        Self {
            name: status.replicator_name.clone(),
            push_count: status.push_count,
            pull_count: status.pull_count,
            fail_count: status.push_fail_count + status.pull_fail_count,
            bytes: status.push_bytes + status.pull_bytes,
            duration_secs: status.duration_secs.unwrap_or_default(),
            succeeded: status.status == Status::Success,
        }
    }

    /// Produce the list of Prometheus metrics.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let labels = vec![("replicator".to_string(), self.name.clone())];
        vec![
            Metric::gauge("sitesync_repl_run_pushed", "Items pushed by the last run", labels.clone(), self.push_count as f64),
            Metric::gauge("sitesync_repl_run_pulled", "Items pulled by the last run", labels.clone(), self.pull_count as f64),
            Metric::gauge("sitesync_repl_run_failed", "Items failed by the last run", labels.clone(), self.fail_count as f64),
            Metric::gauge("sitesync_repl_run_bytes", "Bytes moved by the last run", labels.clone(), self.bytes as f64),
            Metric::gauge("sitesync_repl_run_duration_seconds", "Length of the last run", labels.clone(), self.duration_secs as f64),
            Metric::gauge(
                "sitesync_repl_run_succeeded",
                "Whether the last run succeeded (1) or not (0)",
                labels,
                if self.succeeded { 1.0 } else { 0.0 },
            ),
        ]
    }
}

/// Collects site and replicator snapshots.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    sites: BTreeMap<String, SiteMetrics>,
    replicators: BTreeMap<String, ReplicatorMetrics>,
}

impl MetricsAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update or insert the snapshot of a site.
    pub fn update_site(&mut self, metrics: SiteMetrics) {
        self.sites.insert(metrics.site_id.clone(), metrics);
    }

    /// Update or insert the last run of a replicator.
    pub fn update_replicator(&mut self, metrics: ReplicatorMetrics) {
        self.replicators.insert(metrics.name.clone(), metrics);
    }

    /// Forget a site.
    pub fn remove_site(&mut self, site_id: &str) {
        self.sites.remove(site_id);
    }

    /// Snapshot of a site.
    pub fn site(&self, site_id: &str) -> Option<&SiteMetrics> {
        self.sites.get(site_id)
    }

    /// Everything in Prometheus text exposition format, sites first.
    pub fn format_all(&self) -> String {
        self.sites
            .values()
            .flat_map(SiteMetrics::to_metrics)
            .chain(self.replicators.values().flat_map(ReplicatorMetrics::to_metrics))
            .map(|m| m.format())
            .collect()
    }

    /// Tasks completed across all sites.
    pub fn total_succeeded(&self) -> u64 {
        self.sites.values().map(|m| m.queue.succeeded).sum()
    }

    /// Number of sites tracked.
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }
}
