//! C1 — level-filtered text sink to console and a rolling log file.
//!
//! Built on `tracing`: a custom [`tracing_subscriber::Layer`] classifies
//! events by level, writes warn-and-above to stderr and the rest to stdout,
//! and duplicates every record to an appended `cardinal_log.txt`. This is
//! the one process-wide global the rest of the engine depends on (per the
//! "Globals" design note); everything else takes an explicit context.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// The six severity levels, ordered least to most severe.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    /// Parses a level from text, case-insensitively, defaulting to `Info`
    /// on unrecognized input (spec §4.1).
    pub fn parse(s: &str) -> LogLevel {
        match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "fatal" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    fn from_tracing(level: &Level) -> LogLevel {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

const LOG_FILE_NAME: &str = "cardinal_log.txt";

/// Collects a tracing event's message and `fatal` marker field.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    is_fatal: bool,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else if field.name() == "fatal" {
            let _ = write!(self.message, "");
            self.is_fatal = format!("{:?}", value) == "true";
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

struct LogFile {
    file: Mutex<File>,
}

impl LogFile {
    fn open(path: &std::path::Path, min_level: LogLevel) -> std::io::Result<LogFile> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            file,
            "==== Log Start (min level = {}) ====",
            min_level.label()
        )?;
        Ok(LogFile {
            file: Mutex::new(file),
        })
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{}", line);
        }
    }

    fn close(&self) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "==== Log End ====");
        }
    }
}

/// The console + rolling-file sink. Installed once via [`install`].
pub struct CardinalLogLayer {
    min_level: LogLevel,
    file: LogFile,
}

impl CardinalLogLayer {
    fn new(min_level: LogLevel, log_path: &std::path::Path) -> std::io::Result<CardinalLogLayer> {
        Ok(CardinalLogLayer {
            min_level,
            file: LogFile::open(log_path, min_level)?,
        })
    }
}

impl Drop for CardinalLogLayer {
    fn drop(&mut self) {
        self.file.close();
    }
}

impl<S: Subscriber> Layer<S> for CardinalLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from_tracing(event.metadata().level());
        if level < self.min_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let effective_level = if visitor.is_fatal {
            LogLevel::Fatal
        } else {
            level
        };

        let now = time::OffsetDateTime::now_utc();
        let site = format!(
            "{}:{}",
            event.metadata().file().unwrap_or("?"),
            event.metadata().line().unwrap_or(0)
        );
        let line = format!(
            "[{now}] [{level}] {site}: {message}",
            now = now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            level = effective_level.label(),
            site = site,
            message = visitor.message,
        );

        if effective_level >= LogLevel::Warn {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
        self.file.write_line(&line);

        if effective_level == LogLevel::Fatal && cfg!(debug_assertions) {
            std::process::abort();
        }
    }
}

/// Installs the Cardinal log layer as the global default `tracing`
/// subscriber. Call once at process startup, before constructing a
/// renderer.
pub fn install(min_level: LogLevel, log_path: &std::path::Path) -> std::io::Result<()> {
    use tracing_subscriber::prelude::*;

    let layer = CardinalLogLayer::new(min_level, log_path)?;
    let registry = tracing_subscriber::registry().with(layer);
    // `set_global_default` fails only if a subscriber is already installed;
    // that's a programmer error (double init), not a runtime condition.
    tracing::subscriber::set_global_default(registry)
        .expect("tracing subscriber already installed");
    Ok(())
}

/// Default log file path, relative to the process's current directory.
pub fn default_log_path() -> std::path::PathBuf {
    std::path::PathBuf::from(LOG_FILE_NAME)
}

/// Emits a fatal-level record and aborts in debug builds (spec §4.1).
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        tracing::error!(fatal = true, $($arg)*);
    };
}
