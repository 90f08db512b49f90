//! Provisioning output streaming
//!
//! The provisioning tool can write a lot of output while a cluster comes up.
//! Its pipes are drained continuously by dedicated reader tasks; every line
//! is classified, remembered in a bounded tail and forwarded (without
//! waiting) to both the configured [`LogSink`] and the caller's
//! [`LogStream`]. When either side cannot keep up, events are dropped and
//! counted rather than stalling the process.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;

/// Number of lines kept for error reports
pub const LOG_TAIL_LINES: usize = 50;

/// Default log template
pub const DEFAULT_LOG_FORMAT: &str = "[KIND {stream}] {message}";

/// Severity of a provisioning log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Stdout => "STDOUT",
            StreamSource::Stderr => "STDERR",
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamLoggingConfig {
    /// Forward lines to the sink; output is drained either way
    pub enabled: bool,
    pub stdout_level: LogLevel,
    pub stderr_level: LogLevel,
    /// Template with `{stream}` and `{message}` placeholders
    pub format: String,
    pub include_stream_info: bool,
    /// Capacity of the sink and consumer queues
    pub buffer_capacity: usize,
}

impl Default for StreamLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stdout_level: LogLevel::Info,
            stderr_level: LogLevel::Warning,
            format: DEFAULT_LOG_FORMAT.to_string(),
            include_stream_info: true,
            buffer_capacity: 256,
        }
    }
}

/// A single classified line of provisioning output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub source: StreamSource,
    pub timestamp: DateTime<Utc>,
}

/// Destination for formatted provisioning output
pub trait LogSink: Send + Sync + 'static {
    fn emit(&self, level: LogLevel, line: &str);
}

/// Sink that forwards to `tracing` under the `kindtest::kind` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Debug => debug!(target: "kindtest::kind", "{}", line),
            LogLevel::Info => info!(target: "kindtest::kind", "{}", line),
            LogLevel::Warning => warn!(target: "kindtest::kind", "{}", line),
            LogLevel::Error => error!(target: "kindtest::kind", "{}", line),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Classify a line of tool output
///
/// The stream's configured level is the baseline; explicit error or warning
/// markers in the line itself raise it.
pub fn classify_line(source: StreamSource, line: &str, config: &StreamLoggingConfig) -> LogLevel {
    static MARKERS: OnceLock<Option<Regex>> = OnceLock::new();

    let base = match source {
        StreamSource::Stdout => config.stdout_level,
        StreamSource::Stderr => config.stderr_level,
    };

    let marker = MARKERS
        .get_or_init(|| Regex::new(r"(?i)^\s*(?:✗\s*)?(ERROR|FATAL|WARN(?:ING)?)\b").ok())
        .as_ref()
        .and_then(|re| re.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase());

    let detected = match marker.as_deref() {
        Some("ERROR") | Some("FATAL") => LogLevel::Error,
        Some(_) => LogLevel::Warning,
        None => base,
    };

    detected.max(base)
}

/// Render a line through the configured template
pub fn format_line(config: &StreamLoggingConfig, source: StreamSource, message: &str) -> String {
    let template = if config.include_stream_info {
        config.format.replace("{stream}", source.as_str())
    } else {
        config
            .format
            .replace(" {stream}", "")
            .replace("{stream}", "")
    };
    template.replace("{message}", message)
}

// ============================================================================
// Streamer
// ============================================================================

/// Attaches to a provisioning process and streams its output
#[derive(Clone)]
pub struct LogStreamer {
    config: StreamLoggingConfig,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for LogStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStreamer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for LogStreamer {
    fn default() -> Self {
        Self::new(StreamLoggingConfig::default())
    }
}

impl LogStreamer {
    pub fn new(config: StreamLoggingConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the default tracing sink
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &StreamLoggingConfig {
        &self.config
    }

    /// Take the piped stdout/stderr of a spawned child and start draining them
    pub fn attach(&self, child: &mut Child) -> LogStream {
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        self.attach_readers(stdout, stderr)
    }

    /// Start draining arbitrary readers
    pub fn attach_readers(
        &self,
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    ) -> LogStream {
        let capacity = self.config.buffer_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let dropped = Arc::new(AtomicU64::new(0));

        let sink_tx = if self.config.enabled {
            let (tx, mut rx) = mpsc::channel::<(LogLevel, String)>(capacity);
            let sink = self.sink.clone();
            tokio::spawn(async move {
                while let Some((level, line)) = rx.recv().await {
                    sink.emit(level, &line);
                }
            });
            Some(tx)
        } else {
            None
        };

        let mut readers = Vec::new();
        for (source, reader) in [
            (StreamSource::Stdout, stdout),
            (StreamSource::Stderr, stderr),
        ] {
            if let Some(reader) = reader {
                let pump = Pump {
                    source,
                    config: self.config.clone(),
                    events: event_tx.clone(),
                    sink: sink_tx.clone(),
                    tail: tail.clone(),
                    dropped: dropped.clone(),
                };
                readers.push(tokio::spawn(pump.run(reader)));
            }
        }

        LogStream {
            events: event_rx,
            tail,
            dropped,
            readers,
        }
    }
}

/// Reader side for one pipe
struct Pump {
    source: StreamSource,
    config: StreamLoggingConfig,
    events: mpsc::Sender<LogEvent>,
    sink: Option<mpsc::Sender<(LogLevel, String)>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    dropped: Arc<AtomicU64>,
}

impl Pump {
    async fn run(self, reader: Box<dyn AsyncRead + Send + Unpin>) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.forward(line.trim_end());
                }
                Err(e) => {
                    debug!("Stopped reading {} stream: {}", self.source.as_str(), e);
                    break;
                }
            }
        }
    }

    fn forward(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let level = classify_line(self.source, line, &self.config);

        if let Ok(mut tail) = self.tail.lock() {
            if tail.len() == LOG_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }

        if let Some(sink) = &self.sink {
            let formatted = format_line(&self.config, self.source, line);
            if let Err(mpsc::error::TrySendError::Full(_)) = sink.try_send((level, formatted)) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let event = LogEvent {
            level,
            message: line.to_string(),
            source: self.source,
            timestamp: Utc::now(),
        };
        // A closed receiver just means nobody is consuming events
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Live, non-restartable sequence of [`LogEvent`]s
///
/// Ends once both output pipes of the process have closed.
pub struct LogStream {
    events: mpsc::Receiver<LogEvent>,
    tail: Arc<Mutex<VecDeque<String>>>,
    dropped: Arc<AtomicU64>,
    readers: Vec<JoinHandle<()>>,
}

impl LogStream {
    /// Most recent lines, oldest first
    pub fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Shared handle to the tail for use after the stream is consumed
    pub fn tail_handle(&self) -> LogTail {
        LogTail(self.tail.clone())
    }

    /// Events dropped because the sink or the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until both pipes are fully drained
    pub async fn finished(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
    }
}

impl Stream for LogStream {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Cloneable view of a stream's tail
#[derive(Clone, Debug)]
pub struct LogTail(Arc<Mutex<VecDeque<String>>>);

impl LogTail {
    pub fn lines(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }
}
