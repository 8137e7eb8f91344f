//! Persisted system log: a rolling `system_log.json` document of
//! `{date, time, level, message}` entries, windowed to the last
//! [`MAX_LOG_DAYS`] calendar days using the same proleptic day-count
//! arithmetic as the scheduler, not a bare day-of-year trim that loses
//! entries across a year boundary.
//!
//! [`LogSinkLayer`] plugs into `tracing_subscriber::registry()` so that
//! ordinary `tracing::info!`/`warn!`/`error!` call sites, already used
//! throughout the kernel, are mirrored into this document without every
//! call site needing to know about it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::clock::{parse_date_to_absolute_day, Clock};

const LOG_FILE: &str = "system_log.json";
const MAX_LOG_DAYS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub date: String,
    pub time: String,
    pub level: String,
    pub message: String,
}

pub struct LogSink {
    data_dir: PathBuf,
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<LogEntry>>,
}

impl LogSink {
    pub fn new(data_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.into(),
            clock,
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Loads whatever is on disk into memory. Call once during boot, before
    /// the logging layer starts receiving events.
    pub async fn load(&self) {
        let bytes = match tokio::fs::read(self.path()).await {
            Ok(b) => b,
            Err(_) => return,
        };
        match serde_json::from_slice::<Vec<LogEntry>>(&bytes) {
            Ok(entries) => *self.entries.lock().expect("log entries poisoned") = entries,
            Err(e) => tracing::error!("system log corrupt, starting from empty: {e}"),
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("log entries poisoned").clone()
    }

    /// Appends one entry, trims anything older than [`MAX_LOG_DAYS`], and
    /// schedules the result to be written back to disk.
    pub fn record(self: &Arc<Self>, level: &str, message: impl Into<String>) {
        let local = self.clock.local_time();
        let entry = LogEntry {
            date: local.date_str(),
            time: format!("{:02}:{:02}:{:02}", local.hour, local.minute, local.second),
            level: level.to_string(),
            message: message.into(),
        };
        let today_absolute = local.absolute_day();

        let snapshot = {
            let mut entries = self.entries.lock().expect("log entries poisoned");
            entries.push(entry);
            entries.retain(|e| match parse_date_to_absolute_day(&e.date) {
                Some(day) => today_absolute - day < MAX_LOG_DAYS,
                None => false,
            });
            entries.clone()
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.persist(&snapshot).await {
                tracing::error!("failed to persist system log: {e}");
            }
        });
    }

    async fn persist(&self, entries: &[LogEntry]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.path()).await
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.data_dir.join(format!("{LOG_FILE}.tmp"))
    }
}

/// A `tracing_subscriber` layer that mirrors INFO-and-more-severe events
/// into a [`LogSink`]. DEBUG/TRACE events are left to whatever console
/// subscriber is also installed — the persisted log is for operational
/// history, not tracing-level diagnostics.
pub struct LogSinkLayer {
    sink: Arc<LogSink>,
}

impl LogSinkLayer {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for LogSinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink.record(event.metadata().level().as_str(), visitor.message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use tracing_subscriber::prelude::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "irrigation_logsink_test_{tag}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn record_appends_to_in_memory_snapshot() {
        let dir = temp_dir("append");
        let clock = FakeClock::new(1_718_431_200);
        let sink = LogSink::new(&dir, clock);
        sink.record("INFO", "zone 0 started");
        sink.record("ERROR", "gpio write failed");
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].message, "zone 0 started");
        assert_eq!(snapshot[1].level, "ERROR");
    }

    #[test]
    fn record_trims_entries_older_than_the_retention_window() {
        let dir = temp_dir("trim");
        let clock = FakeClock::new(0);
        let sink = LogSink::new(&dir, clock.clone());

        clock.set(1_718_000_000); // some day D
        sink.record("INFO", "old entry");

        clock.advance(60 * 60 * 24 * 11); // 11 days later, past MAX_LOG_DAYS
        sink.record("INFO", "new entry");

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "new entry");
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_load_round_trips_through_disk() {
        let dir = temp_dir("roundtrip");
        let clock = FakeClock::new(1_718_431_200);
        let sink = LogSink::new(&dir, clock.clone());
        sink.record("INFO", "boot complete");

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        let reloaded = LogSink::new(&dir, clock);
        reloaded.load().await;
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "boot complete");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn layer_forwards_info_and_skips_debug() {
        let dir = temp_dir("layer");
        let clock = FakeClock::new(1_718_431_200);
        let sink = LogSink::new(&dir, clock);
        let layer = LogSinkLayer::new(Arc::clone(&sink));
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("zone 1 stopped");
            tracing::debug!("polling active zone table");
        });

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "zone 1 stopped");
    }
}
