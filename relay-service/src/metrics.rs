//! Prometheus counters for the relay, behind the core's [`VerifyMetrics`]
//! trait. Each instance owns its registry so tests never share global state.

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use relay_core::application::{EventKind, VerifyMetrics};
use relay_core::foundation::{RelayError, Result};

pub struct RelayMetrics {
    registry: Registry,
    verify_starts: IntCounterVec,
    verify_errors: IntCounterVec,
    verify_warnings: IntCounterVec,
    verify_ok: IntCounterVec,
    verify_okish: IntCounterVec,
    slurp_errors: IntCounterVec,
    active_hosts: IntGauge,
    queued_events: IntGaugeVec,
}

fn metrics_err(err: impl std::fmt::Display) -> RelayError {
    RelayError::Config(format!("metrics: {err}"))
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let verify_starts =
            IntCounterVec::new(Opts::new("verify_starts_total", "Verifications begun"), &["kind"]).map_err(metrics_err)?;
        let verify_errors = IntCounterVec::new(
            Opts::new("verify_errors_total", "Verifications failed, by reason"),
            &["kind", "host", "reason"],
        )
        .map_err(metrics_err)?;
        let verify_warnings = IntCounterVec::new(
            Opts::new("verify_warnings_total", "Non-fatal verification conditions"),
            &["kind", "host", "reason"],
        )
        .map_err(metrics_err)?;
        let verify_ok =
            IntCounterVec::new(Opts::new("verify_ok_total", "Fully verified events"), &["kind", "host"])
                .map_err(metrics_err)?;
        let verify_okish = IntCounterVec::new(
            Opts::new("verify_okish_total", "Accepted events with reduced assurance"),
            &["kind", "host", "status"],
        )
        .map_err(metrics_err)?;
        let slurp_errors = IntCounterVec::new(
            Opts::new("slurp_errors_total", "Events dropped by the slurper, by reason"),
            &["host", "reason"],
        )
        .map_err(metrics_err)?;
        let active_hosts =
            IntGauge::new("active_hosts", "Hosts with a live subscription").map_err(metrics_err)?;
        let queued_events =
            IntGaugeVec::new(Opts::new("queued_events", "Events waiting per host"), &["host"]).map_err(metrics_err)?;

        registry.register(Box::new(verify_starts.clone())).map_err(metrics_err)?;
        registry.register(Box::new(verify_errors.clone())).map_err(metrics_err)?;
        registry.register(Box::new(verify_warnings.clone())).map_err(metrics_err)?;
        registry.register(Box::new(verify_ok.clone())).map_err(metrics_err)?;
        registry.register(Box::new(verify_okish.clone())).map_err(metrics_err)?;
        registry.register(Box::new(slurp_errors.clone())).map_err(metrics_err)?;
        registry.register(Box::new(active_hosts.clone())).map_err(metrics_err)?;
        registry.register(Box::new(queued_events.clone())).map_err(metrics_err)?;

        Ok(Self {
            registry,
            verify_starts,
            verify_errors,
            verify_warnings,
            verify_ok,
            verify_okish,
            slurp_errors,
            active_hosts,
            queued_events,
        })
    }

    pub fn inc_slurp_error(&self, host: &str, reason: &str) {
        self.slurp_errors.with_label_values(&[host, reason]).inc();
    }

    pub fn set_active_hosts(&self, count: i64) {
        self.active_hosts.set(count);
    }

    pub fn inc_queued(&self, host: &str) {
        self.queued_events.with_label_values(&[host]).inc();
    }

    pub fn dec_queued(&self, host: &str) {
        self.queued_events.with_label_values(&[host]).dec();
    }

    /// Counter value, for tests and introspection.
    pub fn error_count(&self, kind: EventKind, host: &str, reason: &str) -> u64 {
        self.verify_errors.with_label_values(&[kind.as_str(), host, reason]).get()
    }

    pub fn ok_count(&self, kind: EventKind, host: &str) -> u64 {
        self.verify_ok.with_label_values(&[kind.as_str(), host]).get()
    }

    pub fn okish_count(&self, kind: EventKind, host: &str, status: &str) -> u64 {
        self.verify_okish.with_label_values(&[kind.as_str(), host, status]).get()
    }

    pub fn warning_count(&self, kind: EventKind, host: &str, reason: &str) -> u64 {
        self.verify_warnings.with_label_values(&[kind.as_str(), host, reason]).get()
    }

    /// Text exposition format for whatever HTTP surface the embedding
    /// daemon provides.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer).map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(metrics_err)
    }
}

impl VerifyMetrics for RelayMetrics {
    fn verify_start(&self, kind: EventKind) {
        self.verify_starts.with_label_values(&[kind.as_str()]).inc();
    }

    fn verify_error(&self, kind: EventKind, hostname: &str, reason: &'static str) {
        self.verify_errors.with_label_values(&[kind.as_str(), hostname, reason]).inc();
    }

    fn verify_warning(&self, kind: EventKind, hostname: &str, reason: &'static str) {
        self.verify_warnings.with_label_values(&[kind.as_str(), hostname, reason]).inc();
    }

    fn verify_ok(&self, kind: EventKind, hostname: &str) {
        self.verify_ok.with_label_values(&[kind.as_str(), hostname]).inc();
    }

    fn verify_okish(&self, kind: EventKind, hostname: &str, status: &'static str) {
        self.verify_okish.with_label_values(&[kind.as_str(), hostname, status]).inc();
    }
}
