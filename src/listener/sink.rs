//! Report sinks
//!
//! Each reporting cycle produces a verbose report for the local log and,
//! on the push cadence, a condensed one for external notification.

use async_trait::async_trait;

#[async_trait]
pub trait ReportSink: Send + Sync {
    fn log_report(&self, report: &str);

    async fn push_report(&self, report: String);
}

/// Writes both report forms to the process log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    fn log_report(&self, report: &str) {
        log::info!("{}", report);
    }

    async fn push_report(&self, report: String) {
        log::info!("📣 Push report:\n{}", report);
    }
}
