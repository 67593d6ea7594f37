// Scanner stream protocol: a sequence of JSON documents, each carrying
// exactly one of config / progress / osv / finding.

use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;
use serde_json::StreamDeserializer;
use thiserror::Error;

/// Protocol version this decoder understands.
pub const PROTOCOL_VERSION: &str = "v0.1.0";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message #{index}: {reason}")]
    Malformed { index: usize, reason: String },

    #[error("stream truncated inside message #{index}")]
    Truncated { index: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scanner_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scanner_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub go_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub goos: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub goarch: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub imports_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(rename = "time", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// The parts of an OSV entry the pipeline looks at. `affected` is kept raw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsvEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected: Vec<serde_json::Value>,
}

/// One detected vulnerability and the trace that reaches it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub osv: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fixed_version: String,
    /// Vulnerable symbol first, entry point last. A package that is only
    /// imported yields a single frame without a function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<Frame>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Module path; importable standard library packages use "stdlib".
    #[serde(default)]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub column: i64,
}

impl Position {
    pub fn is_valid(&self) -> bool {
        self.line > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Config(Config),
    Progress(Progress),
    Osv(OsvEntry),
    Finding(Finding),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Config(_) => "config",
            Message::Progress(_) => "progress",
            Message::Osv(_) => "osv",
            Message::Finding(_) => "finding",
        }
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self.clone() {
            Message::Config(c) => WireMessage { config: Some(c), ..Default::default() },
            Message::Progress(p) => WireMessage { progress: Some(p), ..Default::default() },
            Message::Osv(o) => WireMessage { osv: Some(o), ..Default::default() },
            Message::Finding(f) => WireMessage { finding: Some(f), ..Default::default() },
        };
        wire.serialize(serializer)
    }
}

// On-the-wire shape: a record of optional fields, only one of which may be set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    osv: Option<OsvEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finding: Option<Finding>,
}

impl WireMessage {
    fn into_message(self, index: usize) -> Result<Message, ProtocolError> {
        let populated = [
            self.config.is_some(),
            self.progress.is_some(),
            self.osv.is_some(),
            self.finding.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if populated != 1 {
            return Err(ProtocolError::Malformed {
                index,
                reason: format!("expected exactly one populated field, found {}", populated),
            });
        }

        let message = match self {
            WireMessage { config: Some(c), .. } => Message::Config(c),
            WireMessage { progress: Some(p), .. } => Message::Progress(p),
            WireMessage { osv: Some(o), .. } => Message::Osv(o),
            WireMessage { finding: Some(f), .. } => Message::Finding(f),
            _ => unreachable!("exactly one field is populated"),
        };
        Ok(message)
    }
}

/// Incremental decoder over a scanner output stream.
///
/// Messages are yielded in stream order as soon as each one is complete.
/// The first error ends the iteration.
pub struct MessageDecoder<R: Read> {
    stream: StreamDeserializer<'static, IoRead<R>, WireMessage>,
    index: usize,
    failed: bool,
}

impl<R: Read> MessageDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            stream: serde_json::Deserializer::from_reader(reader).into_iter::<WireMessage>(),
            index: 0,
            failed: false,
        }
    }
}

impl<R: Read> Iterator for MessageDecoder<R> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let index = self.index;
        let item = match self.stream.next()? {
            Ok(wire) => wire.into_message(index),
            Err(e) if e.is_eof() => Err(ProtocolError::Truncated { index }),
            Err(e) => Err(ProtocolError::Malformed {
                index,
                reason: e.to_string(),
            }),
        };
        self.index += 1;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Callbacks for each message kind. All default to doing nothing.
pub trait MessageHandler {
    fn config(&mut self, _config: Config) {}
    fn progress(&mut self, _progress: Progress) {}
    fn osv(&mut self, _entry: OsvEntry) {}
    fn finding(&mut self, _finding: Finding) {}
}

/// Decodes `reader` and dispatches every message to `handler`, in order.
pub fn decode_stream<R: Read, H: MessageHandler + ?Sized>(
    reader: R,
    handler: &mut H,
) -> Result<(), ProtocolError> {
    for message in MessageDecoder::new(reader) {
        match message? {
            Message::Config(c) => handler.config(c),
            Message::Progress(p) => handler.progress(p),
            Message::Osv(o) => handler.osv(o),
            Message::Finding(f) => handler.finding(f),
        }
    }
    Ok(())
}

/// Keeps findings; everything else is informational.
#[derive(Debug, Default)]
pub struct FindingCollector {
    pub config: Option<Config>,
    pub findings: Vec<Finding>,
}

impl FindingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_findings(self) -> Vec<Finding> {
        self.findings
    }
}

impl MessageHandler for FindingCollector {
    fn config(&mut self, config: Config) {
        if !config.protocol_version.is_empty() && config.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                announced = %config.protocol_version,
                supported = PROTOCOL_VERSION,
                "scanner speaks a different protocol version"
            );
        }
        tracing::debug!(
            scanner = %config.scanner_name,
            scanner_version = %config.scanner_version,
            db = %config.db,
            "scanner config"
        );
        self.config = Some(config);
    }

    fn progress(&mut self, progress: Progress) {
        tracing::trace!(message = %progress.message, "scanner progress");
    }

    fn finding(&mut self, finding: Finding) {
        self.findings.push(finding);
    }
}
