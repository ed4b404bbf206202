//! Counters, gauges, and a wait-time histogram exported in a text format,
//! per §4.5 and the exposition rules in §6.

use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::Mutex;

use crate::circuit_breaker::CircuitState;
use crate::message::{ErrorCategory, Priority};

/// Upper bounds (seconds) of the fixed histogram buckets for
/// `queue_wait_seconds`. The last bucket is implicitly `+Inf`.
const WAIT_BUCKETS_SECONDS: [f64; 8] = [0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: [u64; WAIT_BUCKETS_SECONDS.len() + 1],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value_seconds: f64) {
        self.sum += value_seconds;
        self.count += 1;
        for (i, bound) in WAIT_BUCKETS_SECONDS.iter().enumerate() {
            if value_seconds <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        *self.bucket_counts.last_mut().unwrap() += 1;
    }
}

/// Thread-safe counters/gauges/histogram for the broker's required
/// series. Increment methods never fail — metrics are best-effort and
/// must never block or error out business operations.
#[derive(Default)]
pub struct MetricsCollector {
    enqueued_total: Mutex<HashMap<(String, Priority), u64>>,
    dequeued_total: Mutex<HashMap<String, u64>>,
    acked_total: Mutex<HashMap<String, u64>>,
    nacked_total: Mutex<HashMap<(String, ErrorCategory), u64>>,
    retried_total: Mutex<HashMap<String, u64>>,
    dlq_total: Mutex<HashMap<(String, ErrorCategory), u64>>,
    depth: Mutex<HashMap<(String, &'static str), i64>>,
    wait_seconds: Mutex<HashMap<String, Histogram>>,
    circuit_state: Mutex<HashMap<String, CircuitState>>,
    circuit_transitions_total: Mutex<HashMap<(String, &'static str, &'static str), u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, platform: &str, priority: Priority) {
        *self
            .enqueued_total
            .lock()
            .entry((platform.to_string(), priority))
            .or_insert(0) += 1;
    }

    pub fn record_dequeued(&self, platform: &str) {
        *self.dequeued_total.lock().entry(platform.to_string()).or_insert(0) += 1;
    }

    pub fn record_acked(&self, platform: &str) {
        *self.acked_total.lock().entry(platform.to_string()).or_insert(0) += 1;
    }

    pub fn record_nacked(&self, platform: &str, category: ErrorCategory) {
        *self
            .nacked_total
            .lock()
            .entry((platform.to_string(), category))
            .or_insert(0) += 1;
    }

    pub fn record_retried(&self, platform: &str) {
        *self.retried_total.lock().entry(platform.to_string()).or_insert(0) += 1;
    }

    pub fn record_dlq(&self, platform: &str, category: ErrorCategory) {
        *self
            .dlq_total
            .lock()
            .entry((platform.to_string(), category))
            .or_insert(0) += 1;
    }

    pub fn set_depth(&self, platform: &str, status: &'static str, value: i64) {
        self.depth
            .lock()
            .insert((platform.to_string(), status), value);
    }

    pub fn observe_wait_seconds(&self, platform: &str, value_seconds: f64) {
        self.wait_seconds
            .lock()
            .entry(platform.to_string())
            .or_default()
            .observe(value_seconds);
    }

    pub fn set_circuit_state(&self, platform: &str, state: CircuitState) {
        self.circuit_state.lock().insert(platform.to_string(), state);
    }

    pub fn record_circuit_transition(&self, platform: &str, from: &'static str, to: &'static str) {
        *self
            .circuit_transitions_total
            .lock()
            .entry((platform.to_string(), from, to))
            .or_insert(0) += 1;
    }

    /// Renders every series in the text exposition format from §6: a
    /// `# HELP` and `# TYPE` line precede each metric, followed by one
    /// `metric_name{labels} value` line per label combination.
    pub fn render(&self) -> String {
        let mut out = String::new();

        self.render_counter(
            &mut out,
            "queue_enqueued_total",
            "Total messages enqueued",
            self.enqueued_total.lock().iter().map(|((platform, priority), v)| {
                (
                    vec![
                        ("platform".to_string(), platform.clone()),
                        ("priority".to_string(), priority_label(*priority).to_string()),
                    ],
                    *v,
                )
            }),
        );

        self.render_counter(
            &mut out,
            "queue_dequeued_total",
            "Total messages dequeued",
            self.dequeued_total.lock().iter().map(|(platform, v)| {
                (vec![("platform".to_string(), platform.clone())], *v)
            }),
        );

        self.render_counter(
            &mut out,
            "queue_acked_total",
            "Total messages acknowledged",
            self.acked_total.lock().iter().map(|(platform, v)| {
                (vec![("platform".to_string(), platform.clone())], *v)
            }),
        );

        self.render_counter(
            &mut out,
            "queue_nacked_total",
            "Total negative acknowledgements",
            self.nacked_total.lock().iter().map(|((platform, category), v)| {
                (
                    vec![
                        ("platform".to_string(), platform.clone()),
                        ("category".to_string(), category.as_str().to_string()),
                    ],
                    *v,
                )
            }),
        );

        self.render_counter(
            &mut out,
            "queue_retried_total",
            "Total messages returned to pending for retry",
            self.retried_total.lock().iter().map(|(platform, v)| {
                (vec![("platform".to_string(), platform.clone())], *v)
            }),
        );

        self.render_counter(
            &mut out,
            "queue_dlq_total",
            "Total messages moved to the dead-letter queue",
            self.dlq_total.lock().iter().map(|((platform, category), v)| {
                (
                    vec![
                        ("platform".to_string(), platform.clone()),
                        ("category".to_string(), category.as_str().to_string()),
                    ],
                    *v,
                )
            }),
        );

        self.render_gauge(
            &mut out,
            "queue_depth",
            "Current number of messages by platform and status",
            self.depth.lock().iter().map(|((platform, status), v)| {
                (
                    vec![
                        ("platform".to_string(), platform.clone()),
                        ("status".to_string(), status.to_string()),
                    ],
                    *v as f64,
                )
            }),
        );

        self.render_histogram(&mut out);

        self.render_gauge(
            &mut out,
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            self.circuit_state.lock().iter().map(|(platform, state)| {
                (
                    vec![("platform".to_string(), platform.clone())],
                    state.as_gauge_value() as f64,
                )
            }),
        );

        self.render_counter(
            &mut out,
            "circuit_breaker_transitions_total",
            "Total circuit breaker state transitions",
            self.circuit_transitions_total
                .lock()
                .iter()
                .map(|((platform, from, to), v)| {
                    (
                        vec![
                            ("platform".to_string(), platform.clone()),
                            ("from".to_string(), from.to_string()),
                            ("to".to_string(), to.to_string()),
                        ],
                        *v,
                    )
                }),
        );

        out
    }

    fn render_counter(
        &self,
        out: &mut String,
        name: &str,
        help: &str,
        series: impl Iterator<Item = (Vec<(String, String)>, u64)>,
    ) {
        let mut lines = Vec::new();
        for (labels, value) in series {
            lines.push(format!("{}{} {}\n", name, render_labels(&labels), value));
        }
        if lines.is_empty() {
            return;
        }
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        for line in lines {
            out.push_str(&line);
        }
    }

    fn render_gauge(
        &self,
        out: &mut String,
        name: &str,
        help: &str,
        series: impl Iterator<Item = (Vec<(String, String)>, f64)>,
    ) {
        let mut lines = Vec::new();
        for (labels, value) in series {
            lines.push(format!("{}{} {}\n", name, render_labels(&labels), value));
        }
        if lines.is_empty() {
            return;
        }
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        for line in lines {
            out.push_str(&line);
        }
    }

    fn render_histogram(&self, out: &mut String) {
        let wait = self.wait_seconds.lock();
        if wait.is_empty() {
            return;
        }
        out.push_str("# HELP queue_wait_seconds Time from enqueue to first dequeue\n");
        out.push_str("# TYPE queue_wait_seconds histogram\n");
        for (platform, hist) in wait.iter() {
            for (i, bound) in WAIT_BUCKETS_SECONDS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "queue_wait_seconds_bucket{{platform=\"{platform}\",le=\"{bound}\"}} {}",
                    hist.bucket_counts[i]
                );
            }
            let _ = writeln!(
                out,
                "queue_wait_seconds_bucket{{platform=\"{platform}\",le=\"+Inf\"}} {}",
                hist.bucket_counts.last().unwrap()
            );
            let _ = writeln!(out, "queue_wait_seconds_sum{{platform=\"{platform}\"}} {}", hist.sum);
            let _ = writeln!(out, "queue_wait_seconds_count{{platform=\"{platform}\"}} {}", hist.count);
        }
    }
}

impl std::fmt::Display for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn render_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{{{}}}", parts.join(","))
}
