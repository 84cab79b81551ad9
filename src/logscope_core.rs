//! Core domain types and seams for logscope.

pub mod types {
    use std::fmt;
    use std::str::FromStr;

    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use smol_str::SmolStr;

    use crate::logscope_core::errors::MalformedEntry;

    /// ISO-8601 timestamp kept as the backend sent it.
    ///
    /// Ordering is plain lexicographic string comparison, which matches
    /// chronological order for uniformly formatted RFC 3339 UTC values.
    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Timestamp(SmolStr);

    impl Timestamp {
        pub fn new(value: impl AsRef<str>) -> Self {
            Self(SmolStr::new(value.as_ref()))
        }

        /// Accepts only values that parse as RFC 3339.
        pub fn parse(value: &str) -> Result<Self, MalformedEntry> {
            let trimmed = value.trim();
            chrono::DateTime::parse_from_rfc3339(trimmed)
                .map_err(|_| MalformedEntry::InvalidTimestamp(value.to_string()))?;
            Ok(Self::new(trimmed))
        }

        pub fn as_str(&self) -> &str {
            self.0.as_str()
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Trace,
        Debug,
        Info,
        Warn,
        Error,
        Fatal,
    }

    impl LogLevel {
        pub const ALL: [LogLevel; 6] = [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Trace => "trace",
                LogLevel::Debug => "debug",
                LogLevel::Info => "info",
                LogLevel::Warn => "warn",
                LogLevel::Error => "error",
                LogLevel::Fatal => "fatal",
            }
        }
    }

    impl fmt::Display for LogLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for LogLevel {
        type Err = MalformedEntry;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value.trim().to_ascii_lowercase().as_str() {
                "trace" => Ok(LogLevel::Trace),
                "debug" => Ok(LogLevel::Debug),
                "info" => Ok(LogLevel::Info),
                "warn" | "warning" => Ok(LogLevel::Warn),
                "error" => Ok(LogLevel::Error),
                "fatal" => Ok(LogLevel::Fatal),
                _ => Err(MalformedEntry::InvalidLevel(value.to_string())),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Prop {
        pub key: String,
        pub value: String,
    }

    impl Prop {
        pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self { key: key.into(), value: value.into() }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    pub struct LogEntry {
        pub id: SmolStr,
        pub timestamp: Timestamp,
        pub level: LogLevel,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub props: Vec<Prop>,
        pub msg: String,
    }

    impl LogEntry {
        pub fn new(
            id: impl AsRef<str>,
            timestamp: Timestamp,
            level: LogLevel,
            msg: impl Into<String>,
        ) -> Self {
            Self { id: SmolStr::new(id.as_ref()), timestamp, level, props: Vec::new(), msg: msg.into() }
        }

        pub fn with_props(mut self, props: Vec<Prop>) -> Self {
            self.props = props;
            self
        }

        /// Builds an entry from one backend JSON object.
        pub fn from_value(value: Value) -> Result<Self, MalformedEntry> {
            let raw: RawLogEntry = serde_json::from_value(value)
                .map_err(|error| MalformedEntry::InvalidShape(error.to_string()))?;
            Self::try_from(raw)
        }

        pub fn from_json(text: &str) -> Result<Self, MalformedEntry> {
            let raw: RawLogEntry = serde_json::from_str(text)
                .map_err(|error| MalformedEntry::InvalidShape(error.to_string()))?;
            Self::try_from(raw)
        }
    }

    /// Wire shape before validation. Every field is optional so a missing one
    /// becomes a [`MalformedEntry`] instead of a decode failure for the batch.
    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct RawLogEntry {
        id: Option<Value>,
        timestamp: Option<String>,
        level: Option<String>,
        props: Option<Vec<Prop>>,
        msg: Option<String>,
    }

    impl TryFrom<RawLogEntry> for LogEntry {
        type Error = MalformedEntry;

        fn try_from(raw: RawLogEntry) -> Result<Self, Self::Error> {
            let id = match raw.id {
                Some(Value::String(id)) if !id.trim().is_empty() => SmolStr::new(id),
                Some(Value::Number(id)) => SmolStr::new(id.to_string()),
                _ => return Err(MalformedEntry::MissingField("id")),
            };
            let timestamp = raw.timestamp.ok_or(MalformedEntry::MissingField("timestamp"))?;
            let timestamp = Timestamp::parse(&timestamp)?;
            let level = raw.level.ok_or(MalformedEntry::MissingField("level"))?.parse()?;

            Ok(LogEntry {
                id,
                timestamp,
                level,
                props: raw.props.unwrap_or_default(),
                msg: raw.msg.unwrap_or_default(),
            })
        }
    }

    /// Decodes a JSON array of entries, dropping malformed ones.
    ///
    /// Returns the accepted entries and how many were dropped.
    pub fn decode_entries(values: Vec<Value>) -> (Vec<LogEntry>, usize) {
        let mut entries = Vec::with_capacity(values.len());
        let mut malformed = 0usize;
        for value in values {
            match LogEntry::from_value(value) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    malformed += 1;
                    tracing::debug!(%error, "dropping malformed entry");
                }
            }
        }
        (entries, malformed)
    }

    /// Fetch status surfaced to the presentation layer.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Status {
        Idle,
        Fetching,
        Exhausted,
        Error(String),
    }

    impl Status {
        pub fn label(&self) -> &str {
            match self {
                Status::Idle => "idle",
                Status::Fetching => "fetching",
                Status::Exhausted => "end of results",
                Status::Error(message) => message.as_str(),
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TimerId(pub u64);

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct PageRequest {
        pub generation: u64,
        pub query: String,
        /// Exclusive upper bound; `None` anchors the page at "now".
        pub before: Option<Timestamp>,
        pub limit: usize,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct StreamRequest {
        pub generation: u64,
        /// Distinguishes streams reopened within one generation.
        pub stream: u64,
        pub query: String,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct Page {
        pub entries: Vec<LogEntry>,
        pub malformed: usize,
    }

    impl Page {
        pub fn new(entries: Vec<LogEntry>) -> Self {
            Self { entries, malformed: 0 }
        }
    }

    /// One item delivered by a live subscription.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum StreamItem {
        Entry(LogEntry),
        Malformed,
    }
}

pub mod errors {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum TransportError {
        #[error("http error: {0}")]
        Http(#[from] reqwest::Error),
        #[error("server responded {status}: {body}")]
        Status { status: u16, body: String },
        #[error("invalid response: {0}")]
        Decode(#[from] serde_json::Error),
        #[error("connection closed")]
        Closed,
    }

    #[derive(Clone, Debug, Error, PartialEq, Eq)]
    #[error("query `{query}` rejected: {message}")]
    pub struct QueryValidationError {
        pub query: String,
        pub message: String,
    }

    #[derive(Clone, Debug, Error, PartialEq, Eq)]
    pub enum MalformedEntry {
        #[error("missing required field: {0}")]
        MissingField(&'static str),
        #[error("invalid level: {0}")]
        InvalidLevel(String),
        #[error("invalid timestamp: {0}")]
        InvalidTimestamp(String),
        #[error("invalid entry: {0}")]
        InvalidShape(String),
    }
}

pub mod traits {
    use std::time::Duration;

    use crate::logscope_core::errors::{QueryValidationError, TransportError};
    use crate::logscope_core::types::{
        LogEntry, PageRequest, Status, StreamRequest, TimerId,
    };

    /// Cancels a live subscription.
    pub trait StreamHandle {
        fn cancel(&mut self);
    }

    /// Issues requests; completions come back through the coordinator's
    /// `on_page_loaded` / `on_stream_*` methods tagged with the generation.
    pub trait Transport {
        type Stream: StreamHandle;

        fn fetch_older_page(&mut self, request: PageRequest);
        fn open_stream(&mut self, request: StreamRequest) -> Self::Stream;
    }

    pub trait Scheduler {
        fn schedule_once(&mut self, delay: Duration) -> TimerId;
        fn cancel(&mut self, timer: TimerId);
    }

    pub trait Observer {
        fn entries_changed(&mut self, snapshot: &[LogEntry], inserted: usize);
        fn status_changed(&mut self, status: &Status);

        fn stream_ended(&mut self, _error: Option<&TransportError>) {}

        fn query_rejected(&mut self, _error: &QueryValidationError) {}
    }

    /// Where the consumer is looking, expressed as policy.
    pub trait Viewport {
        /// Eviction of the oldest rows is allowed only while this holds.
        fn at_top(&self) -> bool;
        /// The consumer is close to the last loaded row and wants more.
        fn near_end(&self, loaded: usize) -> bool;
    }

    impl<T> Observer for &mut T
    where
        T: Observer + ?Sized,
    {
        fn entries_changed(&mut self, snapshot: &[LogEntry], inserted: usize) {
            (**self).entries_changed(snapshot, inserted)
        }

        fn status_changed(&mut self, status: &Status) {
            (**self).status_changed(status)
        }

        fn stream_ended(&mut self, error: Option<&TransportError>) {
            (**self).stream_ended(error)
        }

        fn query_rejected(&mut self, error: &QueryValidationError) {
            (**self).query_rejected(error)
        }
    }
}

pub use errors::{MalformedEntry, QueryValidationError, TransportError};
pub use traits::{Observer, Scheduler, StreamHandle, Transport, Viewport};
pub use types::{
    decode_entries, LogEntry, LogLevel, Page, PageRequest, Prop, Status, StreamItem,
    StreamRequest, TimerId, Timestamp,
};
