use crate::protocol::{LogEntry, LogLevel};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

// Override with XCD_LOG_BUFFER_CAPACITY=20000
const DEFAULT_LOG_CAPACITY: usize = 10_000;

// Per-message cap keeps GetLogs responses well under the frame limit.
const MAX_LOG_MESSAGE_SIZE: usize = 4096;

/// Thread-safe ring buffer backing the daemon's GetLogs surface.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    sequence_counter: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let capacity = std::env::var("XCD_LOG_BUFFER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an entry, evicting the oldest once past capacity. The sequence
    /// number is assigned here, atomically, so it stays monotonic across
    /// threads.
    pub fn push(&self, mut entry: LogEntry) {
        entry.sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    /// Last N entries in chronological order. Takes the blocking lock; the
    /// critical section is one clone pass so writers stall only briefly.
    pub fn get_last(&self, count: usize) -> Vec<LogEntry> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take_count = count.min(entries.len());
        entries
            .iter()
            .rev()
            .take(take_count)
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        match self.entries.try_lock() {
            Ok(entries) => entries.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracing layer that copies every event into a [`LogBuffer`], so logs stay
/// queryable over IPC even when the daemon runs detached with no terminal.
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn convert_level(level: &tracing::Level) -> LogLevel {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }

    fn format_message(event: &Event<'_>) -> String {
        struct MessageVisitor {
            message: String,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{value:?}");
                    if self.message.starts_with('"') && self.message.ends_with('"') {
                        self.message = self.message[1..self.message.len() - 1].to_string();
                    }
                }
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = value.to_string();
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            event.metadata().target().to_string()
        } else {
            visitor.message
        };

        truncate_message(message)
    }
}

/// Cap a message at [`MAX_LOG_MESSAGE_SIZE`] bytes, backing the cut off to
/// the nearest char boundary so multibyte text never splits mid-character.
fn truncate_message(message: String) -> String {
    if message.len() <= MAX_LOG_MESSAGE_SIZE {
        return message;
    }
    let mut cut = MAX_LOG_MESSAGE_SIZE;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}... [TRUNCATED - original size: {} chars]",
        &message[..cut],
        message.len()
    )
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let log_entry = LogEntry {
            sequence: 0, // assigned by LogBuffer::push
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            level: Self::convert_level(metadata.level()),
            target: metadata.target().to_string(),
            message: Self::format_message(event),
            file: metadata.file().map(|s| s.to_string()),
            line: metadata.line(),
        };

        self.buffer.push(log_entry);
    }
}
