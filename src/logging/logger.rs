// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handles, the shared ring, and the draining consumer

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_queue::ArrayQueue;

use super::{Facility, Severity};

/// A single formatted-on-drain log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub facility: Facility,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            severity,
            facility,
            message: message.to_string(),
        }
    }

    /// Render as a single output line: `<secs>.<millis> LEVEL [Facility] message`
    pub fn format_line(&self) -> String {
        let since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        format!(
            "{}.{:03} {} [{}] {}",
            since_epoch.as_secs(),
            since_epoch.subsec_millis(),
            self.severity,
            self.facility,
            self.message
        )
    }
}

/// The shared ring all loggers write into. Writers never block: entries are
/// dropped (and counted) when the ring is full.
struct LogRing {
    queue: ArrayQueue<LogEntry>,
    dropped: AtomicU64,
    min_level: AtomicU8,
}

/// Lightweight cloneable handle for writing log entries.
pub struct Logger {
    ring: Arc<LogRing>,
}

impl Logger {
    #[inline]
    fn enabled(&self, severity: Severity) -> bool {
        severity.as_u8() <= self.ring.min_level.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.enabled(severity) {
            return;
        }
        let entry = LogEntry::new(severity, facility, message);
        if self.ring.queue.push(entry).is_err() {
            self.ring.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Owns the shared ring; hands out `Logger` handles and the consumer.
pub struct LogRegistry {
    ring: Arc<LogRing>,
}

impl LogRegistry {
    /// Create a registry with the given ring capacity and minimum level.
    pub fn new(capacity: usize, min_level: Severity) -> Self {
        Self {
            ring: Arc::new(LogRing {
                queue: ArrayQueue::new(capacity),
                dropped: AtomicU64::new(0),
                min_level: AtomicU8::new(min_level.as_u8()),
            }),
        }
    }

    pub fn logger(&self) -> Logger {
        Logger {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Change the minimum severity; takes effect for subsequent writes.
    pub fn set_level(&self, min_level: Severity) {
        self.ring.min_level.store(min_level.as_u8(), Ordering::Relaxed);
    }

    /// Number of entries dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    /// Build a consumer draining this registry's ring into `sink`.
    pub fn consumer(&self, sink: Box<dyn LogSink>) -> LogConsumer {
        LogConsumer {
            ring: Arc::clone(&self.ring),
            sink,
        }
    }
}

impl Default for LogRegistry {
    fn default() -> Self {
        Self::new(4096, Severity::Info)
    }
}

/// Destination for formatted log lines.
pub trait LogSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Writes lines to stderr (daemon default).
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Collects lines in memory; used by tests.
#[derive(Default, Clone)]
pub struct VecSink {
    pub lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink for VecSink {
    fn write_line(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Drains the ring to a sink on a short interval.
pub struct LogConsumer {
    ring: Arc<LogRing>,
    sink: Box<dyn LogSink>,
}

impl LogConsumer {
    /// Drain everything currently in the ring. Returns the number of entries
    /// written.
    pub fn drain(&mut self) -> usize {
        let mut written = 0;
        while let Some(entry) = self.ring.queue.pop() {
            self.sink.write_line(&entry.format_line());
            written += 1;
        }
        written
    }

    /// Run forever, draining periodically.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tick.tick().await;
            self.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_writes_and_consumer_drains() {
        let registry = LogRegistry::new(16, Severity::Debug);
        let logger = registry.logger();

        logger.info(Facility::Test, "hello");
        logger.error(Facility::Test, "boom");

        let sink = VecSink::default();
        let lines = sink.lines.clone();
        let mut consumer = registry.consumer(Box::new(sink));
        assert_eq!(consumer.drain(), 2);

        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("INFO [Test] hello"));
        assert!(lines[1].contains("ERROR [Test] boom"));
    }

    #[test]
    fn test_min_level_filters() {
        let registry = LogRegistry::new(16, Severity::Notice);
        let logger = registry.logger();

        logger.debug(Facility::Test, "not recorded");
        logger.info(Facility::Test, "not recorded either");
        logger.notice(Facility::Test, "recorded");

        let sink = VecSink::default();
        let mut consumer = registry.consumer(Box::new(sink));
        assert_eq!(consumer.drain(), 1);
    }

    #[test]
    fn test_full_ring_drops_and_counts() {
        let registry = LogRegistry::new(2, Severity::Debug);
        let logger = registry.logger();

        for i in 0..5 {
            logger.info(Facility::Test, &format!("entry {i}"));
        }
        assert_eq!(registry.dropped(), 3);
    }

    #[test]
    fn test_set_level_applies_to_later_writes() {
        let registry = LogRegistry::new(16, Severity::Error);
        let logger = registry.logger();

        logger.info(Facility::Test, "dropped");
        registry.set_level(Severity::Debug);
        logger.info(Facility::Test, "kept");

        let sink = VecSink::default();
        let lines = sink.lines.clone();
        let mut consumer = registry.consumer(Box::new(sink));
        consumer.drain();
        assert_eq!(lines.lock().unwrap().len(), 1);
    }
}
