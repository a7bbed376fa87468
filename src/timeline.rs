//! Chrome Tracing collector for job visualization.
//!
//! Job spans are recorded into thread-local buffers with no cross-thread
//! contention and gathered into a global list when each worker exits. The
//! export is a JSON array loadable in chrome://tracing or ui.perfetto.dev.
//! Recording is enabled per system with `Config::timeline`.

use serde::Serialize;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A single "complete" (`ph: X`) event in Chrome Tracing format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub ph: &'static str,
    /// Start, in microseconds since the Unix epoch.
    pub ts: u64,
    /// Duration in microseconds.
    pub dur: u64,
    pub pid: u32,
    /// Worker index that started the job.
    pub tid: usize,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

pub fn record_event(name: &'static str, tid: usize, start: Instant, duration: Duration) {
    let ts = start.saturating_duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US;

    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            ph: "X",
            ts,
            dur: duration.as_micros() as u64,
            pid: std::process::id(),
            tid,
        });
    });
}

/// Moves this thread's events into the global list. Every worker calls this
/// on its way out.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if local.is_empty() {
            return;
        }
        let mut global = ALL_BUFFERS.lock().unwrap_or_else(|e| e.into_inner());
        global.push(std::mem::take(&mut *local));
    });
}

/// Removes and returns every collected event.
pub fn take_events() -> Vec<TraceEvent> {
    let mut global = ALL_BUFFERS.lock().unwrap_or_else(|e| e.into_inner());
    global.drain(..).flatten().collect()
}

/// Writes every collected event as a Chrome Tracing JSON array and clears the
/// collection.
pub fn export_to_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let events = take_events();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &events)?;
    writer.flush()
}

/// Records a span from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    tid: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, tid: usize) -> Self {
        // Pin the global origin before the first span can end.
        let _ = *GLOBAL_START;
        Self {
            name,
            tid,
            start: Instant::now(),
        }
    }

    /// Ends the span without recording it.
    pub fn discard(self) {
        std::mem::forget(self);
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.tid, self.start, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_records_into_local_buffer() {
        {
            let _guard = TraceGuard::new("timeline_unit_test", 7);
        }
        let local: Vec<_> = TRACE_BUFFER.with(|buf| buf.borrow().clone());
        let event = local
            .iter()
            .find(|e| e.name == "timeline_unit_test")
            .expect("span was not recorded");
        assert_eq!(event.tid, 7);
        assert_eq!(event.ph, "X");
        assert!(event.ts >= *EPOCH_START_US);
    }

    #[test]
    fn test_discarded_guard_records_nothing() {
        TraceGuard::new("timeline_discarded_span", 1).discard();
        let recorded = TRACE_BUFFER.with(|buf| {
            buf.borrow()
                .iter()
                .any(|e| e.name == "timeline_discarded_span")
        });
        assert!(!recorded);
    }

    #[test]
    fn test_event_serializes_in_chrome_format() {
        let event = TraceEvent {
            name: "physics",
            ph: "X",
            ts: 10,
            dur: 5,
            pid: 1,
            tid: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"name":"physics","ph":"X","ts":10,"dur":5,"pid":1,"tid":2}"#
        );
    }
}
