// External crates
use chrono::Local;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use syslog::{Facility, Formatter3164, LoggerBackend};
use thiserror::Error;
use tracing::instrument;

/// Errors raised while setting up the log sinks.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The configured facility name is not in the lookup table.
    #[error("unknown syslog facility '{0}', expected a name such as LOG_LOCAL6")]
    UnknownFacility(String),
}

/// Syslog severity levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// System is unusable.
    Emergency,
    /// Action must be taken immediately.
    Alert,
    /// Critical conditions.
    Critical,
    /// Error conditions.
    Error,
    /// Warning conditions.
    Warning,
    /// Normal but significant condition.
    Notice,
    /// Informational.
    Info,
    /// Debug-level messages.
    Debug,
}

impl Severity {
    /// Numeric syslog priority (0 = EMERG .. 7 = DEBUG).
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Emergency => "EMERG",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRIT",
            Severity::Error => "ERR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// Destination for finished log lines.
///
/// Implementations are best-effort: a failed write is swallowed and never
/// reaches the caller.
pub trait LogSink: Send + Sync {
    /// Write one pre-rendered line at `severity`.
    fn log(&self, severity: Severity, line: &str);
}

type SyslogWriter = syslog::Logger<LoggerBackend, Formatter3164>;
type ConsoleWriter = Box<dyn Write + Send>;

/// The process log sink: the local syslog daemon plus, optionally, stderr.
///
/// The two destinations are written independently; a failure on one does not
/// affect the other.
pub struct Logger {
    syslog: Option<Mutex<SyslogWriter>>,
    console: Option<Mutex<ConsoleWriter>>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("syslog", &self.syslog.is_some())
            .field("console", &self.console.is_some())
            .finish()
    }
}

impl Logger {
    /// Connect to the local syslog socket as `ident` under `facility`, and
    /// mirror to stderr when `log_to_stderr` is set.
    ///
    /// An unreachable syslog daemon is not fatal, the logger then writes to
    /// the console only.
    #[instrument(
        name = "logger::open",
        target = "logger::logger",
        level = "debug",
        skip(facility)
    )]
    pub fn open(ident: &str, facility: Facility, log_to_stderr: bool) -> Self {
        let formatter = Formatter3164 {
            facility,
            hostname: None,
            process: ident.to_string(),
            pid: std::process::id(),
        };

        let syslog = match syslog::unix(formatter) {
            Ok(writer) => Some(Mutex::new(writer)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Syslog socket unavailable, logging to the console only"
                );
                None
            }
        };

        // Without syslog the console is the only place left to write to.
        let console: Option<ConsoleWriter> = if log_to_stderr || syslog.is_none() {
            Some(Box::new(std::io::stderr()))
        } else {
            None
        };

        Self {
            syslog,
            console: console.map(Mutex::new),
        }
    }

    /// A logger that writes only to `writer`, in the console line format.
    pub fn console_only<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            syslog: None,
            console: Some(Mutex::new(Box::new(writer))),
        }
    }

    /// Whether lines reach a syslog daemon.
    #[must_use]
    pub fn has_syslog(&self) -> bool {
        self.syslog.is_some()
    }

    fn write_syslog(&self, severity: Severity, line: &str) {
        let Some(syslog) = &self.syslog else {
            return;
        };
        let mut writer = syslog.lock().unwrap_or_else(PoisonError::into_inner);
        let written = match severity {
            Severity::Emergency => writer.emerg(line),
            Severity::Alert => writer.alert(line),
            Severity::Critical => writer.crit(line),
            Severity::Error => writer.err(line),
            Severity::Warning => writer.warning(line),
            Severity::Notice => writer.notice(line),
            Severity::Info => writer.info(line),
            Severity::Debug => writer.debug(line),
        };
        if let Err(e) = written {
            tracing::trace!(error = %e, "Dropped syslog line");
        }
    }

    fn write_console(&self, line: &str) {
        let Some(console) = &self.console else {
            return;
        };
        let rendered = console_line(Local::now(), line);
        let mut writer = console.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer
            .write_all(rendered.as_bytes())
            .and_then(|()| writer.flush())
        {
            tracing::trace!(error = %e, "Dropped console line");
        }
    }
}

impl LogSink for Logger {
    fn log(&self, severity: Severity, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        self.write_syslog(severity, line);
        self.write_console(line);
    }
}

/// Render one console line: local timestamp with microseconds, then the message.
pub fn console_line<Tz>(now: chrono::DateTime<Tz>, line: &str) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("{} {line}\n", now.format("%Y-%m-%d %H:%M:%S%.6f"))
}

/// Sink that keeps every line in memory. Handy for tests and benchmarks.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<(Severity, String)>>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line logged so far.
    #[must_use]
    pub fn lines(&self) -> Vec<(Severity, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any line at `severity` contains `needle`.
    #[must_use]
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(logged, line)| *logged == severity && line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, severity: Severity, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((severity, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn severity_codes_follow_syslog_order() {
        assert_eq!(Severity::Emergency.code(), 0);
        assert_eq!(Severity::Error.code(), 3);
        assert_eq!(Severity::Info.code(), 6);
        assert_eq!(Severity::Debug.code(), 7);
        assert_eq!(Severity::Warning.to_string(), "WARNING");
    }

    #[test]
    fn console_line_carries_microsecond_timestamp() {
        let now = Utc
            .with_ymd_and_hms(2025, 3, 9, 14, 5, 7)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            console_line(now, "hello"),
            "2025-03-09 14:05:07.000000 hello\n"
        );
    }

    #[test]
    fn console_logger_strips_trailing_newlines() {
        let buffer = SharedBuffer::default();
        let logger = Logger::console_only(buffer.clone());

        logger.log(Severity::Error, "Timeout Connecting\n");

        let written = String::from_utf8(buffer.0.lock().expect("buffer lock").clone())
            .expect("utf-8 output");
        assert!(written.ends_with(" Timeout Connecting\n"));
        assert_eq!(written.lines().count(), 1);
        assert!(!logger.has_syslog());
    }

    #[test]
    fn failing_console_does_not_propagate() {
        let logger = Logger::console_only(BrokenPipe);
        logger.log(Severity::Info, "dropped on the floor");
    }

    #[test]
    fn memory_sink_records_severity() {
        let sink = MemorySink::new();
        sink.log(Severity::Notice, "first");
        sink.log(Severity::Error, "second");

        assert_eq!(sink.lines().len(), 2);
        assert!(sink.contains(Severity::Error, "sec"));
        assert!(!sink.contains(Severity::Info, "first"));
    }
}
