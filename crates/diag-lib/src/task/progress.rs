//! Progress reporting for running tasks
//!
//! The runner reports every task start and finish here. Events always go to
//! the log; a [`ProgressSink`] can additionally render them for humans.

use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Something that happened to a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        label: String,
        host: Option<String>,
    },
    Finished {
        label: String,
        host: Option<String>,
        error: Option<String>,
        done: usize,
        total: usize,
    },
}

/// Renders progress events
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    done: usize,
    failed: usize,
}

/// Shared progress state guarded by a mutex
#[derive(Default)]
pub struct Progress {
    sink: Option<Arc<dyn ProgressSink>>,
    counters: Mutex<Counters>,
}

impl Progress {
    /// Log-only progress
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink: Some(sink),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn started(&self, label: &str, host: Option<&str>) {
        let event = ProgressEvent::Started {
            label: label.to_string(),
            host: host.map(str::to_string),
        };
        // the sink is called under the lock so lines never interleave
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        counters.total += 1;
        debug!(task = %label, host = host.unwrap_or("-"), "Task started");
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }

    pub fn finished(&self, label: &str, host: Option<&str>, error: Option<String>) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        counters.done += 1;
        match &error {
            Some(e) => {
                counters.failed += 1;
                warn!(task = %label, host = host.unwrap_or("-"), error = %e, "Task failed");
            }
            None => info!(task = %label, host = host.unwrap_or("-"), "Task finished"),
        }
        let event = ProgressEvent::Finished {
            label: label.to_string(),
            host: host.map(str::to_string),
            error,
            done: counters.done,
            total: counters.total,
        };
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }

    /// (finished, failed) task counts so far
    pub fn counts(&self) -> (usize, usize) {
        self.counters
            .lock()
            .map(|c| (c.done, c.failed))
            .unwrap_or((0, 0))
    }
}
