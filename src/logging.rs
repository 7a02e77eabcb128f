// ============================================
// logging.rs - Session log sink
// ============================================
//
// Every log call becomes one LogEntry per message line. Each entry carries
// two pre-rendered strings:
// - Legacy line:  [timestamp] [section] [source] [severity] :: message
// - CMTrace line: <![LOG[message]LOG]!><time=".." date=".." component=".." ...>
//
// The disk line uses whichever style is configured; the host/console always
// gets the legacy line. The log file is opened in append mode for the
// duration of a single call so log viewers never see it locked.
// ============================================

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::panic::Location;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Local};
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use serde::{Deserialize, Serialize};

use crate::error::LogError;

// ============================================
// CONSTANTS
// ============================================

/// Divider line written at the start and end of a session.
pub const LOG_DIVIDER: &str =
    "-------------------------------------------------------------------------------";

/// Stand-in for blank lines and leading whitespace in CMTrace messages.
/// It counts as whitespace for Rust but OneTrace/CMTrace doesn't trim it.
const LEADING_SPACE_CHAR: char = '\u{2008}';

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ============================================
// ENUMS
// ============================================

/// Severity of a log entry. The numeric value is what CMTrace expects in `type=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSeverity {
    Success = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSeverity::Success => write!(f, "Success"),
            LogSeverity::Info => write!(f, "Info"),
            LogSeverity::Warning => write!(f, "Warning"),
            LogSeverity::Error => write!(f, "Error"),
        }
    }
}

/// On-disk log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStyle {
    Legacy,
    #[serde(rename = "CMTrace")]
    CMTrace,
}

/// Where host output for a log call goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLogStreamType {
    /// No host output
    None,
    /// The embedding host's log stream (tracing events)
    Host,
    /// Straight to stdout/stderr with colours
    Console,
    /// The host's verbose stream (tracing debug events)
    Verbose,
}

// ============================================
// LOG ENTRY
// ============================================

/// One rendered log message.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub message: String,
    pub severity: LogSeverity,
    pub source: String,
    pub script_section: Option<String>,
    pub debug_message: bool,
    pub caller_file_name: String,
    pub caller_source: String,
    pub legacy_line: String,
    pub cmtrace_line: String,
}

/// Fields needed to build a LogEntry.
#[derive(Debug, Clone)]
pub struct LogEntryFields<'a> {
    pub timestamp: DateTime<FixedOffset>,
    pub message: &'a str,
    pub severity: LogSeverity,
    pub source: &'a str,
    pub script_section: Option<&'a str>,
    pub debug_message: bool,
    pub caller_file_name: &'a str,
    pub caller_source: &'a str,
    /// Account name written to CMTrace's `context=`
    pub context: &'a str,
    /// Process id written to CMTrace's `thread=`
    pub process_id: u32,
}

impl LogEntry {
    /// Build an entry and render both line styles.
    pub fn new(fields: LogEntryFields<'_>) -> Result<Self, LogError> {
        let message = clean_message(fields.message);
        if message.trim().is_empty() {
            return Err(LogError::EmptyField { field: "message" });
        }
        if fields.source.trim().is_empty() {
            return Err(LogError::EmptyField { field: "source" });
        }
        if fields.caller_file_name.trim().is_empty() {
            return Err(LogError::EmptyField { field: "caller file name" });
        }
        if fields.caller_source.trim().is_empty() {
            return Err(LogError::EmptyField { field: "caller source" });
        }
        let script_section = fields
            .script_section
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let legacy_line = render_legacy(
            &fields.timestamp,
            &message,
            fields.severity,
            fields.source,
            script_section.as_deref(),
        );
        let cmtrace_line = render_cmtrace(&fields, &message, script_section.as_deref());

        Ok(LogEntry {
            timestamp: fields.timestamp,
            message,
            severity: fields.severity,
            source: fields.source.to_string(),
            script_section,
            debug_message: fields.debug_message,
            caller_file_name: fields.caller_file_name.to_string(),
            caller_source: fields.caller_source.to_string(),
            legacy_line,
            cmtrace_line,
        })
    }

    /// The line written to disk for the given style.
    pub fn line_for(&self, style: LogStyle) -> &str {
        match style {
            LogStyle::Legacy => &self.legacy_line,
            LogStyle::CMTrace => &self.cmtrace_line,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.legacy_line)
    }
}

/// Strip NUL characters and trailing whitespace.
fn clean_message(message: &str) -> String {
    message.replace('\0', "").trim_end().to_string()
}

/// ISO-8601 round-trip timestamp with 7 fractional digits.
fn round_trip_timestamp(timestamp: &DateTime<FixedOffset>) -> String {
    format!(
        "{}.{:07}{}",
        timestamp.format("%Y-%m-%dT%H:%M:%S"),
        timestamp.timestamp_subsec_nanos() / 100,
        timestamp.format("%:z")
    )
}

fn render_legacy(
    timestamp: &DateTime<FixedOffset>,
    message: &str,
    severity: LogSeverity,
    source: &str,
    script_section: Option<&str>,
) -> String {
    let section = script_section
        .map(|s| format!(" [{}]", s))
        .unwrap_or_default();
    format!(
        "[{}]{} [{}] [{}] :: {}",
        round_trip_timestamp(timestamp),
        section,
        source,
        severity,
        message
    )
}

fn render_cmtrace(fields: &LogEntryFields<'_>, message: &str, script_section: Option<&str>) -> String {
    let section = match script_section {
        Some(s) if message != LOG_DIVIDER => format!("[{}] :: ", s),
        _ => String::new(),
    };
    let body = if message.contains('\n') {
        flatten_multiline(message)
    } else {
        message.to_string()
    };
    let bias = fields.timestamp.offset().local_minus_utc() / 60;
    let bias = if bias >= 0 {
        format!("+{}", bias)
    } else {
        bias.to_string()
    };
    format!(
        "<![LOG[{}{}]LOG]!><time=\"{}{}\" date=\"{}\" component=\"{}\" context=\"{}\" type=\"{}\" thread=\"{}\" file=\"{}\">",
        section,
        body,
        fields.timestamp.format("%H:%M:%S%.3f"),
        bias,
        fields.timestamp.format("%-m-%d-%Y"),
        fields.source,
        fields.context,
        fields.severity as u32,
        fields.process_id,
        fields.caller_file_name
    )
}

/// Blank lines become a single placeholder character and leading
/// whitespace is replaced with placeholders so the viewer keeps the
/// indentation. The trailing line ending is required by the viewer.
fn flatten_multiline(message: &str) -> String {
    let lines: Vec<String> = message
        .replace('\r', "")
        .split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                return LEADING_SPACE_CHAR.to_string();
            }
            let indent = line.chars().take_while(|c| c.is_whitespace()).count();
            if indent == 0 {
                return line.to_string();
            }
            let start = line
                .char_indices()
                .nth(indent)
                .map(|(i, _)| i)
                .unwrap_or(line.len());
            let mut out: String = std::iter::repeat(LEADING_SPACE_CHAR).take(indent).collect();
            out.push_str(&line[start..]);
            out
        })
        .collect();
    let mut joined = lines.join(LINE_ENDING);
    joined.push_str(LINE_ENDING);
    joined
}

// ============================================
// LOG SINK
// ============================================

/// One call's worth of messages plus where they should go.
#[derive(Debug, Clone)]
pub struct LogRequest<'a> {
    pub messages: &'a [String],
    pub severity: LogSeverity,
    /// Component name; falls back to the caller location when blank
    pub source: Option<&'a str>,
    pub script_section: Option<&'a str>,
    pub debug_message: bool,
    /// Log directory and file name; `None` disables disk output
    pub log_file: Option<(&'a Path, &'a str)>,
    pub log_style: LogStyle,
    pub host: HostLogStreamType,
    pub caller: &'static Location<'static>,
}

/// Renders log requests and writes them to disk and to the host.
#[derive(Debug, Clone)]
pub struct LogSink {
    /// Record debug-flagged messages
    pub debug_enabled: bool,
    /// Account name for CMTrace's `context=`
    pub context: String,
}

impl LogSink {
    pub fn new(debug_enabled: bool, context: impl Into<String>) -> Self {
        LogSink {
            debug_enabled,
            context: context.into(),
        }
    }

    /// Render entries for a request without any I/O.
    /// Returns an empty list when the debug gate suppresses the message.
    pub fn render(&self, request: &LogRequest<'_>) -> Result<Vec<LogEntry>, LogError> {
        if request.debug_message && !self.debug_enabled {
            return Ok(Vec::new());
        }

        let timestamp = Local::now().fixed_offset();
        let caller_file = request.caller.file();
        let caller_source = format!("{}:{}", request.caller.file(), request.caller.line());
        let source = request
            .source
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&caller_source);

        let entries = request
            .messages
            .iter()
            .filter(|m| !clean_message(m).trim().is_empty())
            .map(|message| {
                LogEntry::new(LogEntryFields {
                    timestamp,
                    message,
                    severity: request.severity,
                    source,
                    script_section: request.script_section,
                    debug_message: request.debug_message,
                    caller_file_name: caller_file,
                    caller_source: &caller_source,
                    context: &self.context,
                    process_id: std::process::id(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if entries.is_empty() {
            return Err(LogError::NoMessages);
        }
        Ok(entries)
    }

    /// Render a request and write it to disk and/or the host.
    /// Does nothing when there is neither a log file nor host output.
    pub fn write(&self, request: &LogRequest<'_>) -> Result<Vec<LogEntry>, LogError> {
        if request.debug_message && !self.debug_enabled {
            return Ok(Vec::new());
        }
        if request.log_file.is_none() && request.host == HostLogStreamType::None {
            return Ok(Vec::new());
        }

        let entries = self.render(request)?;

        if let Some((directory, file_name)) = request.log_file {
            let lines: Vec<&str> = entries.iter().map(|e| e.line_for(request.log_style)).collect();
            append_lines(&directory.join(file_name), &lines)?;
        }

        if request.host != HostLogStreamType::None {
            write_host(&entries, request.severity, request.host)?;
        }
        Ok(entries)
    }
}

/// Append lines to a log file, creating it (and its folder) with a UTF-8 BOM
/// when it doesn't exist yet. The handle is closed before returning.
pub fn append_lines(path: &Path, lines: &[&str]) -> Result<(), LogError> {
    let io_err = |source| LogError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;

    let mut buffer = Vec::new();
    if file.metadata().map_err(io_err)?.len() == 0 {
        buffer.extend_from_slice(UTF8_BOM);
    }
    for line in lines {
        buffer.extend_from_slice(line.as_bytes());
        buffer.extend_from_slice(LINE_ENDING.as_bytes());
    }
    file.write_all(&buffer).map_err(io_err)?;
    Ok(())
}

// ============================================
// HOST OUTPUT
// ============================================

/// Which standard stream a coloured write went to.
#[derive(Clone, Copy)]
enum StdStream {
    Out,
    Err,
}

/// Sets the console foreground colour and resets it on drop, so the
/// colour never leaks even when the write fails.
struct ConsoleColorGuard {
    stream: StdStream,
    active: bool,
}

impl StdStream {
    fn is_terminal(self) -> bool {
        match self {
            StdStream::Out => io::stdout().is_terminal(),
            StdStream::Err => io::stderr().is_terminal(),
        }
    }
}

impl ConsoleColorGuard {
    fn new(stream: StdStream, color: Option<Color>) -> Self {
        Self::start(stream, color, stream.is_terminal())
    }

    /// Redirected output gets no escape codes.
    fn start(stream: StdStream, color: Option<Color>, terminal: bool) -> Self {
        let active = match color.filter(|_| terminal) {
            Some(color) => match stream {
                StdStream::Out => crossterm::execute!(io::stdout(), SetForegroundColor(color)).is_ok(),
                StdStream::Err => crossterm::execute!(io::stderr(), SetForegroundColor(color)).is_ok(),
            },
            None => false,
        };
        ConsoleColorGuard { stream, active }
    }
}

impl Drop for ConsoleColorGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let _ = match self.stream {
            StdStream::Out => crossterm::execute!(io::stdout(), ResetColor),
            StdStream::Err => crossterm::execute!(io::stderr(), ResetColor),
        };
    }
}

/// Console colour for a severity. Info uses the terminal default.
fn severity_color(severity: LogSeverity) -> Option<Color> {
    match severity {
        LogSeverity::Success => Some(Color::Green),
        LogSeverity::Info => None,
        LogSeverity::Warning => Some(Color::Yellow),
        LogSeverity::Error => Some(Color::Red),
    }
}

fn write_host(entries: &[LogEntry], severity: LogSeverity, host: HostLogStreamType) -> Result<(), LogError> {
    match host {
        HostLogStreamType::None => Ok(()),
        HostLogStreamType::Console => {
            let stream = if severity == LogSeverity::Error {
                StdStream::Err
            } else {
                StdStream::Out
            };
            let _guard = ConsoleColorGuard::new(stream, severity_color(severity));
            let result = match stream {
                StdStream::Out => write_lines(&mut io::stdout().lock(), entries),
                StdStream::Err => write_lines(&mut io::stderr().lock(), entries),
            };
            result.map_err(LogError::Console)
        }
        HostLogStreamType::Host => {
            for entry in entries {
                match severity {
                    LogSeverity::Error => tracing::error!(target: "deploysession::host", "{}", entry.legacy_line),
                    LogSeverity::Warning => tracing::warn!(target: "deploysession::host", "{}", entry.legacy_line),
                    _ => tracing::info!(target: "deploysession::host", "{}", entry.legacy_line),
                }
            }
            Ok(())
        }
        HostLogStreamType::Verbose => {
            for entry in entries {
                tracing::debug!(target: "deploysession::host", "{}", entry.legacy_line);
            }
            Ok(())
        }
    }
}

fn write_lines(out: &mut impl Write, entries: &[LogEntry]) -> io::Result<()> {
    for entry in entries {
        writeln!(out, "{}", entry.legacy_line)?;
    }
    out.flush()
}

// ============================================
// TESTS
// ============================================
