//! Crash reporting.
//!
//! When the application under test crashes, the agent hands a structured,
//! schemaless crash description to [`CrashReporter::report`]. The reporter
//! stamps it into a [`CrashRecord`], forwards it to the configured
//! [`CrashTransport`], and keeps it as the pending crash until the harness
//! collects it with [`CrashReporter::take_pending`].
//!
//! Reporting runs during teardown after a crash, so it never panics and never
//! returns an error: transport failures are logged and swallowed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::events::SyncEvent;

/// Crash details: string keys mapping to arbitrarily nested values.
pub type CrashDetails = BTreeMap<String, CrashValue>;

/// A value inside [`CrashDetails`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CrashValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<CrashValue>),
    Map(CrashDetails),
}

impl CrashValue {
    /// Returns the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CrashValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CrashValue {
    fn from(value: &str) -> Self {
        CrashValue::String(value.to_string())
    }
}

impl From<String> for CrashValue {
    fn from(value: String) -> Self {
        CrashValue::String(value)
    }
}

impl From<bool> for CrashValue {
    fn from(value: bool) -> Self {
        CrashValue::Bool(value)
    }
}

impl From<i64> for CrashValue {
    fn from(value: i64) -> Self {
        CrashValue::Int(value)
    }
}

impl From<f64> for CrashValue {
    fn from(value: f64) -> Self {
        CrashValue::Float(value)
    }
}

impl From<Vec<CrashValue>> for CrashValue {
    fn from(value: Vec<CrashValue>) -> Self {
        CrashValue::List(value)
    }
}

impl From<CrashDetails> for CrashValue {
    fn from(value: CrashDetails) -> Self {
        CrashValue::Map(value)
    }
}

impl From<serde_json::Value> for CrashValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => CrashValue::Null,
            Value::Bool(b) => CrashValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CrashValue::Int(i),
                None => CrashValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => CrashValue::String(s),
            Value::Array(items) => CrashValue::List(items.into_iter().map(CrashValue::from).collect()),
            Value::Object(map) => {
                CrashValue::Map(map.into_iter().map(|(k, v)| (k, CrashValue::from(v))).collect())
            }
        }
    }
}

/// Keys checked, in order, when summarizing a crash for the log.
const SUMMARY_KEYS: [&str; 3] = ["errorDetails", "reason", "message"];

/// A reported crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: Uuid,
    pub reported_at: DateTime<Utc>,
    pub details: CrashDetails,
}

impl CrashRecord {
    pub fn new(details: CrashDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            reported_at: Utc::now(),
            details,
        }
    }

    /// A one-line description: the first well-known string field, if any.
    pub fn summary(&self) -> Option<&str> {
        SUMMARY_KEYS
            .iter()
            .find_map(|key| self.details.get(*key).and_then(CrashValue::as_str))
    }
}

/// Errors raised by a crash transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The receiving end is gone.
    #[error("crash transport is closed")]
    Closed,
}

/// Delivers crash records to the outer harness.
pub trait CrashTransport: Send + Sync {
    fn forward(&self, record: &CrashRecord) -> Result<(), TransportError>;
}

/// Appends crash records to a file as JSON Lines.
pub struct JsonLinesTransport {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesTransport {
    /// Opens (creating if needed) the file at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CrashTransport for JsonLinesTransport {
    fn forward(&self, record: &CrashRecord) -> Result<(), TransportError> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}

/// Hands crash records to an in-process receiver.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<CrashRecord>,
}

impl ChannelTransport {
    /// Creates the transport and the receiver the harness reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CrashRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CrashTransport for ChannelTransport {
    fn forward(&self, record: &CrashRecord) -> Result<(), TransportError> {
        self.tx.send(record.clone()).map_err(|_| TransportError::Closed)
    }
}

/// Stamps, forwards and retains crash reports.
pub struct CrashReporter {
    transport: Option<Arc<dyn CrashTransport>>,
    pending: Mutex<Option<CrashRecord>>,
    events: broadcast::Sender<SyncEvent>,
}

impl CrashReporter {
    pub fn new(transport: Option<Arc<dyn CrashTransport>>, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            transport,
            pending: Mutex::new(None),
            events,
        }
    }

    /// Records a crash and forwards it to the transport.
    ///
    /// Never panics and never fails; returns the id of the stored record.
    pub fn report(&self, details: CrashDetails) -> Uuid {
        let record = CrashRecord::new(details);
        let id = record.id;

        error!(
            event = "APP_CRASH",
            crash_id = %id,
            summary = record.summary().unwrap_or("no details"),
            "application crashed"
        );

        if let Some(transport) = &self.transport {
            match panic::catch_unwind(AssertUnwindSafe(|| transport.forward(&record))) {
                Ok(Ok(())) => debug!(crash_id = %id, "crash record forwarded"),
                Ok(Err(e)) => warn!(crash_id = %id, error = %e, "failed to forward crash record"),
                Err(_) => warn!(crash_id = %id, "crash transport panicked"),
            }
        }

        *self.pending.lock() = Some(record);
        let _ = self.events.send(SyncEvent::CrashReported { id });
        id
    }

    /// Returns the most recent crash and clears it.
    pub fn take_pending(&self) -> Option<CrashRecord> {
        self.pending.lock().take()
    }

    /// Returns `true` if a crash is waiting to be collected.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl std::fmt::Debug for CrashReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashReporter")
            .field("transport", &self.transport.as_ref().map(|_| "<dyn CrashTransport>"))
            .field("has_pending", &self.has_pending())
            .finish()
    }
}
