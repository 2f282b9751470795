//! Diagnostic channel for conflict reports and malformed-state warnings.
//!
//! Nothing in the detection path aborts the host program. Reports go to a
//! [`DiagnosticSink`]; the default [`TracingSink`] forwards them to `tracing`,
//! and [`CollectingSink`] additionally keeps them for inspection.

use parking_lot::Mutex;

use crate::detector::RaceReport;

/// Receiver of region diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// A conflict was detected.
    fn race(&self, report: &RaceReport);

    /// Something went wrong that suppressed or degraded detection.
    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Emits every diagnostic as a `tracing` warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn race(&self, report: &RaceReport) {
        tracing::warn!(
            buffer = %report.buffer,
            name = report.name.as_deref().unwrap_or("<unnamed>"),
            index = report.index,
            workers = ?report.workers,
            site = %report.site,
            "race condition detected"
        );
    }
}

/// Records diagnostics in memory and forwards them to `tracing`.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<RaceReport>>,
    warnings: Mutex<Vec<String>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far.
    pub fn reports(&self) -> Vec<RaceReport> {
        self.reports.lock().clone()
    }

    /// Warnings received so far.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

impl DiagnosticSink for CollectingSink {
    fn race(&self, report: &RaceReport) {
        TracingSink.race(report);
        self.reports.lock().push(report.clone());
    }

    fn warning(&self, message: &str) {
        TracingSink.warning(message);
        self.warnings.lock().push(message.to_owned());
    }
}
