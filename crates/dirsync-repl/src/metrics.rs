//! Prometheus text exposition of replication counters.

use crate::quorum::LinkStatus;
use crate::status::ReplicaStatus;

/// A single Prometheus sample with its HELP/TYPE header.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g. "dirsync_repl_entries_added_total").
    pub name: String,
    /// Help text.
    pub help: String,
    /// "counter" or "gauge".
    pub metric_type: String,
    /// Label pairs.
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
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a gauge.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// Render as text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&self.format_sample());
        output
    }

    fn format_sample(&self) -> String {
        if self.labels.is_empty() {
            return format!("{} {}\n", self.name, self.format_value());
        }
        let label_str = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}} {}\n", self.name, label_str, self.format_value())
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

fn link_value(status: LinkStatus) -> f64 {
    match status {
        LinkStatus::Dead => 0.0,
        LinkStatus::Dirty => 1.0,
        LinkStatus::Refreshing => 2.0,
        LinkStatus::Ready => 3.0,
        LinkStatus::Processing => 4.0,
    }
}

/// Every metric for one replica, derived from its status report.
pub fn from_status(status: &ReplicaStatus) -> Vec<Metric> {
    let sid = ("sid".to_string(), format!("{:03x}", status.sid));
    let base = vec![sid.clone()];
    let mut out = vec![
        Metric::gauge(
            "dirsync_repl_has_quorum",
            "Whether the backend has quorum (1) or not (0)",
            vec![sid.clone(), ("backend".to_string(), status.backend.clone())],
            if status.has_quorum { 1.0 } else { 0.0 },
        ),
        Metric::counter(
            "dirsync_repl_position_publishes_total",
            "Commits that advanced the shared position",
            base.clone(),
            status.publishes as f64,
        ),
    ];
    for link in &status.links {
        out.push(Metric::gauge(
            "dirsync_repl_link_status",
            "Link readiness (0 dead, 1 dirty, 2 refreshing, 3 ready, 4 processing)",
            vec![sid.clone(), ("rid".to_string(), format!("{:03}", link.rid))],
            link_value(link.status),
        ));
    }
    for a in &status.agreements {
        let labels = vec![sid.clone(), ("rid".to_string(), format!("{:03}", a.rid))];
        let c = &a.counters;
        for (name, help, value) in [
            ("dirsync_repl_rounds_total", "Completed refresh rounds", c.rounds),
            ("dirsync_repl_entries_added_total", "Entries added", c.adds),
            ("dirsync_repl_entries_modified_total", "Entries modified", c.modifies),
            ("dirsync_repl_entries_deleted_total", "Entries deleted", c.deletes),
            ("dirsync_repl_entries_reconciled_total", "Entries removed by reconciliation", c.reconciled),
            ("dirsync_repl_conflicts_total", "Changes skipped on a local conflict", c.conflicts),
            ("dirsync_repl_retries_total", "Retries scheduled", c.retries),
        ] {
            out.push(Metric::counter(name, help, labels.clone(), value as f64));
        }
    }
    if let Some(p) = &status.provider {
        for (name, help, value) in [
            ("dirsync_repl_provider_writes_total", "Writes committed through the provider", p.local_writes + p.replicated_writes),
            ("dirsync_repl_provider_delivered_total", "Changes delivered to persistent searches", p.delivered),
            ("dirsync_repl_provider_echo_suppressed_total", "Changes not sent back to their origin", p.echo_suppressed),
            ("dirsync_repl_provider_slow_sessions_total", "Sessions dropped for falling behind", p.slow_sessions),
        ] {
            out.push(Metric::counter(name, help, base.clone(), value as f64));
        }
        out.push(Metric::gauge(
            "dirsync_repl_provider_sessions",
            "Live persistent searches",
            base,
            p.live_sessions as f64,
        ));
    }
    out
}

/// Render metrics, writing each HELP/TYPE header once per name.
pub fn format_prometheus(metrics: &[Metric]) -> String {
    let mut output = String::new();
    let mut last: Option<&str> = None;
    for m in metrics {
        if last == Some(m.name.as_str()) {
            output.push_str(&m.format_sample());
        } else {
            output.push_str(&m.format());
        }
        last = Some(m.name.as_str());
    }
    output
}
