//! Prometheus metrics for banwatch.
//!
//! - `banwatch_lines_processed_total{jail}` - Lines passed to a filter
//! - `banwatch_line_duration_seconds{jail}` - Per-line processing latency
//! - `banwatch_failures_total{jail}` - Failures handed to the fail manager
//! - `banwatch_ignored_total{jail,source}` - Identities spared by the ignore list
//! - `banwatch_tickets_total{jail}` - Tickets popped for banning
//! - `banwatch_errors_total{jail,kind}` - Per-line and per-file errors
//! - `banwatch_time_anomalies_total{jail,kind}` - Timezone/latency warnings

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters
// ========================================================================

pub static LINES_PROCESSED: OnceLock<IntCounterVec> = OnceLock::new();

pub static FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

/// Ignored identities by ignore source.
pub static IGNORED: OnceLock<IntCounterVec> = OnceLock::new();

pub static TICKETS: OnceLock<IntCounterVec> = OnceLock::new();

/// Errors by `error_code()` label.
pub static ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

pub static TIME_ANOMALIES: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

pub static LINE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Called once at daemon startup. Recording before `init()` is a no-op.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::warn!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    register!(LINES_PROCESSED, IntCounterVec::new(Opts::new("banwatch_lines_processed_total", "Log lines processed"), &["jail"]));
    register!(FAILURES, IntCounterVec::new(Opts::new("banwatch_failures_total", "Failures detected"), &["jail"]));
    register!(IGNORED, IntCounterVec::new(Opts::new("banwatch_ignored_total", "Identities ignored by source"), &["jail", "source"]));
    register!(TICKETS, IntCounterVec::new(Opts::new("banwatch_tickets_total", "Tickets issued for banning"), &["jail"]));
    register!(ERRORS, IntCounterVec::new(Opts::new("banwatch_errors_total", "Line and source errors by kind"), &["jail", "kind"]));
    register!(TIME_ANOMALIES, IntCounterVec::new(Opts::new("banwatch_time_anomalies_total", "Timezone and latency warnings"), &["jail", "kind"]));
    register!(LINE_DURATION, HistogramVec::new(
        HistogramOpts::new("banwatch_line_duration_seconds", "Line processing latency")
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.5, 5.0]),
        &["jail"]));
}

/// Encode the registry in Prometheus text format. With `jail`, only the
/// series labelled with that jail are kept.
pub fn gather_metrics(jail: Option<&str>) -> String {
    let mut families = registry().gather();
    if let Some(jail) = jail {
        for family in &mut families {
            let kept: Vec<_> = family
                .get_metric()
                .iter()
                .filter(|m| {
                    m.get_label()
                        .iter()
                        .any(|l| l.get_name() == "jail" && l.get_value() == jail)
                })
                .cloned()
                .collect();
            family.set_metric(kept.into());
        }
        families.retain(|f| !f.get_metric().is_empty());
    }

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&families, &mut buffer) {
        Ok(()) => String::from_utf8_lossy(&buffer).into_owned(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            String::new()
        }
    }
}

// ============================================================================
// Recording helpers
// ============================================================================

fn inc(metric: &OnceLock<IntCounterVec>, labels: &[&str]) {
    if let Some(c) = metric.get() {
        c.with_label_values(labels).inc();
    }
}

/// Record one processed line and how long it took.
#[inline]
pub fn record_line(jail: &str, duration_secs: f64) {
    inc(&LINES_PROCESSED, &[jail]);
    if let Some(h) = LINE_DURATION.get() {
        h.with_label_values(&[jail]).observe(duration_secs);
    }
}

#[inline]
pub fn record_failure(jail: &str) {
    inc(&FAILURES, &[jail]);
}

#[inline]
pub fn record_ignored(jail: &str, source: &str) {
    inc(&IGNORED, &[jail, source]);
}

#[inline]
pub fn record_ticket(jail: &str) {
    inc(&TICKETS, &[jail]);
}

#[inline]
pub fn record_error(jail: &str, kind: &str) {
    inc(&ERRORS, &[jail, kind]);
}

#[inline]
pub fn record_time_anomaly(jail: &str, kind: &str) {
    inc(&TIME_ANOMALIES, &[jail, kind]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        init();

        record_line("sshd", 0.0001);
        record_failure("sshd");
        record_ignored("sshd", "ip");
        record_error("sshd", "decode_error");

        let output = gather_metrics(None);
        assert!(output.contains("banwatch_lines_processed_total"));
        assert!(output.contains("banwatch_ignored_total"));
        assert!(output.contains("source=\"ip\""));
    }

    #[test]
    fn test_metrics_for_one_jail() {
        init();

        record_failure("metrics-a");
        record_failure("metrics-b");
        record_time_anomaly("metrics-b", "timezone");

        let output = gather_metrics(Some("metrics-a"));
        assert!(output.contains("jail=\"metrics-a\""));
        assert!(!output.contains("metrics-b"));
        // families without a series for the jail are left out
        assert!(!output.contains("banwatch_time_anomalies_total"));
    }
}
