//! Prometheus metrics shared by all converter jobs.

use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Window write duration buckets in seconds.
const WRITE_DURATION_BUCKETS: [f64; 7] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Rawdata message size buckets in bytes.
const MESSAGE_SIZE_BUCKETS: [f64; 6] = [256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0];

/// Outcome label for processed rawdata messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOutcome {
    /// Converted
    Success,
    /// Converted with partial failures
    Fail,
    /// Dropped by the skip list
    Skip,
    /// Dropped by the converter's convertibility check
    Unconvertible,
}

impl MessageOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            MessageOutcome::Success => "success",
            MessageOutcome::Fail => "fail",
            MessageOutcome::Skip => "skip",
            MessageOutcome::Unconvertible => "unconvertible",
        }
    }
}

/// Converter metrics backed by a Prometheus registry.
pub struct ConverterMetrics {
    registry: Registry,
    messages: IntCounterVec,
    message_size_bytes: Histogram,
    windows_flushed: IntCounter,
    empty_windows: IntCounter,
    records_written: IntCounter,
    write_duration: Histogram,
    fatal_pauses: IntCounter,
    decrypt_passthrough: IntCounter,
    active_jobs: IntGauge,
}

impl ConverterMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let messages = IntCounterVec::new(
            Opts::new(
                "converter_rawdata_messages_total",
                "Rawdata messages processed by outcome",
            ),
            &["result"],
        )?;
        let message_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "converter_rawdata_message_size_bytes",
                "Size of consumed rawdata messages",
            )
            .buckets(MESSAGE_SIZE_BUCKETS.to_vec()),
        )?;
        let windows_flushed = IntCounter::new(
            "converter_windows_flushed_total",
            "Windows closed, including empty and dryrun windows",
        )?;
        let empty_windows =
            IntCounter::new("converter_empty_windows_total", "Windows closed without records")?;
        let records_written = IntCounter::new(
            "converter_records_written_total",
            "Records durably written to target datasets",
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "converter_window_write_duration_seconds",
                "Duration of window writes",
            )
            .buckets(WRITE_DURATION_BUCKETS.to_vec()),
        )?;
        let fatal_pauses = IntCounter::new(
            "converter_fatal_pauses_total",
            "Jobs paused by a pipeline-fatal error",
        )?;
        let decrypt_passthrough = IntCounter::new(
            "converter_decrypt_passthrough_total",
            "Messages passed through an inactive decryptor after a decryption error",
        )?;
        let active_jobs = IntGauge::new("converter_active_jobs", "Jobs that are not stopped")?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(message_size_bytes.clone()))?;
        registry.register(Box::new(windows_flushed.clone()))?;
        registry.register(Box::new(empty_windows.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;
        registry.register(Box::new(fatal_pauses.clone()))?;
        registry.register(Box::new(decrypt_passthrough.clone()))?;
        registry.register(Box::new(active_jobs.clone()))?;

        Ok(Self {
            registry,
            messages,
            message_size_bytes,
            windows_flushed,
            empty_windows,
            records_written,
            write_duration,
            fatal_pauses,
            decrypt_passthrough,
            active_jobs,
        })
    }

    // === RECORDING ===

    /// Record one processed message.
    pub fn record_message(&self, outcome: MessageOutcome, size_bytes: usize) {
        self.messages.with_label_values(&[outcome.as_label()]).inc();
        self.message_size_bytes.observe(size_bytes as f64);
    }

    /// Record a closed window. `written` is `None` for empty or dryrun windows.
    pub fn record_window(&self, rows: usize, written: Option<Duration>) {
        self.windows_flushed.inc();
        if rows == 0 {
            self.empty_windows.inc();
        }
        if let Some(duration) = written {
            self.records_written.inc_by(rows as u64);
            self.write_duration.observe(duration.as_secs_f64());
        }
    }

    pub fn record_fatal_pause(&self) {
        self.fatal_pauses.inc();
    }

    pub fn record_decrypt_passthrough(&self) {
        self.decrypt_passthrough.inc();
    }

    pub fn set_active_jobs(&self, count: usize) {
        self.active_jobs.set(count as i64);
    }

    // === GETTERS ===

    pub fn messages(&self, outcome: MessageOutcome) -> u64 {
        self.messages.with_label_values(&[outcome.as_label()]).get()
    }

    pub fn windows_flushed(&self) -> u64 {
        self.windows_flushed.get()
    }

    pub fn empty_windows(&self) -> u64 {
        self.empty_windows.get()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.get()
    }

    pub fn fatal_pauses(&self) -> u64 {
        self.fatal_pauses.get()
    }

    pub fn decrypt_passthrough(&self) -> u64 {
        self.decrypt_passthrough.get()
    }

    pub fn active_jobs(&self) -> i64 {
        self.active_jobs.get()
    }

    /// Export all metrics in Prometheus text format.
    pub fn export_prometheus_text(&self) -> Result<String> {
        let mut buffer = Vec::with_capacity(4096);
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_messages() {
        let metrics = ConverterMetrics::new().unwrap();
        metrics.record_message(MessageOutcome::Success, 100);
        metrics.record_message(MessageOutcome::Success, 100);
        metrics.record_message(MessageOutcome::Skip, 10);

        assert_eq!(metrics.messages(MessageOutcome::Success), 2);
        assert_eq!(metrics.messages(MessageOutcome::Skip), 1);
        assert_eq!(metrics.messages(MessageOutcome::Fail), 0);
    }

    #[test]
    fn test_record_windows() {
        let metrics = ConverterMetrics::new().unwrap();
        metrics.record_window(3, Some(Duration::from_millis(50)));
        metrics.record_window(0, None);
        metrics.record_window(2, None);

        assert_eq!(metrics.windows_flushed(), 3);
        assert_eq!(metrics.empty_windows(), 1);
        assert_eq!(metrics.records_written(), 3);
    }

    #[test]
    fn test_prometheus_text_export() {
        let metrics = ConverterMetrics::new().unwrap();
        metrics.record_message(MessageOutcome::Unconvertible, 5);
        metrics.record_window(4, Some(Duration::from_millis(250)));
        metrics.record_fatal_pause();
        metrics.set_active_jobs(2);

        let output = metrics.export_prometheus_text().unwrap();
        assert!(output.contains("# TYPE converter_rawdata_messages_total counter"));
        assert!(output.contains("converter_rawdata_messages_total{result=\"unconvertible\"} 1"));
        assert!(output.contains("converter_records_written_total 4"));
        assert!(output.contains("converter_fatal_pauses_total 1"));
        assert!(output.contains("# TYPE converter_active_jobs gauge"));
        assert!(output.contains("converter_active_jobs 2"));
        assert!(output.contains("converter_window_write_duration_seconds_count 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = ConverterMetrics::with_registry(registry.clone()).unwrap();
        assert!(ConverterMetrics::with_registry(registry).is_err());
    }
}
