//! A tracing layer that forwards events to a log queue.
//!
//! The worker installs a [`LogForwarder`] as the thread-local subscriber of its
//! run thread (and of the recorder thread it spawns) when a log queue is attached,
//! so a controller receives every event of that run as a [`LogEntry`].

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Represents a single log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.target,
            self.message
        )
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// Layer sending events at or above `level` to a channel.
pub struct LogForwarder {
    tx: mpsc::UnboundedSender<LogEntry>,
    level: Level,
}

impl LogForwarder {
    pub fn new(tx: mpsc::UnboundedSender<LogEntry>, level: Level) -> Self {
        Self { tx, level }
    }
}

impl<S: Subscriber> Layer<S> for LogForwarder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // more verbose levels compare greater
        if *metadata.level() > self.level {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        // a dropped receiver only means nobody is listening any more
        let _ = self.tx.send(LogEntry {
            timestamp: Local::now(),
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Dispatcher whose only output is the given queue.
pub fn forwarding_dispatch(tx: mpsc::UnboundedSender<LogEntry>, level: Level) -> Dispatch {
    Dispatch::new(tracing_subscriber::registry().with(LogForwarder::new(tx, level)))
}
