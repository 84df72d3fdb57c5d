//! Append-only CSV access log.
//!
//! Every dispatch event (`gen_request`, `gen_done`, `rejected`) becomes one
//! CSV row. The header row is written only when the file is created. Each
//! field is serialized as a JSON string so embedded commas and quotes
//! cannot break the row format. All writes funnel through a single writer
//! task; a failed write is reported and swallowed, it never fails the
//! request that produced it.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

pub const CSV_HEADER: &str =
    "time_stamp,event,user_name,ip_address,access,server,nb_queued_requests_on_server,error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEvent {
    GenRequest,
    GenDone,
    Rejected,
}

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessEvent::GenRequest => "gen_request",
            AccessEvent::GenDone => "gen_done",
            AccessEvent::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Authorized,
    Denied,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Access::Authorized => "Authorized",
            Access::Denied => "Denied",
        };
        f.write_str(s)
    }
}

/// One row of the access log, fully materialized at the call site so the
/// writer task needs no shared state.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub time_stamp: String,
    pub event: AccessEvent,
    pub user_name: String,
    pub ip_address: Option<IpAddr>,
    pub access: Access,
    pub server: String,
    pub nb_queued: i64,
    pub error: String,
}

impl LogRecord {
    fn to_csv_row(&self) -> String {
        let ip = self
            .ip_address
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        [
            csv_field(&self.time_stamp),
            csv_field(&self.event.to_string()),
            csv_field(&self.user_name),
            csv_field(&ip),
            csv_field(&self.access.to_string()),
            csv_field(&self.server),
            csv_field(&self.nb_queued.to_string()),
            csv_field(&self.error),
        ]
        .join(",")
    }
}

/// JSON-string quoting doubles as CSV escaping here: the value ends up
/// double-quoted with `"` and `\` escaped, so commas never split a field.
fn csv_field(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Cloneable handle the dispatcher logs through. Sending never blocks;
/// ordering is preserved by the single consumer.
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl AccessLog {
    /// Creates the handle plus the writer half that owns the file path.
    /// The writer must be spawned (see [`AccessLogWriter::run`]) for
    /// records to reach disk.
    pub fn new(path: impl Into<PathBuf>) -> (Self, AccessLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            AccessLogWriter {
                path: path.into(),
                rx,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        event: AccessEvent,
        user: &str,
        ip: Option<IpAddr>,
        access: Access,
        server: &str,
        nb_queued: i64,
        error: &str,
    ) {
        let record = LogRecord {
            time_stamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event,
            user_name: user.to_string(),
            ip_address: ip,
            access,
            server: server.to_string(),
            nb_queued,
            error: error.to_string(),
        };
        if self.tx.send(record).is_err() {
            error!("Access log writer is gone, dropping record");
        }
    }
}

/// The single-writer side of the log. Consumes records until shutdown,
/// then drains whatever is still queued so no event is lost on a clean
/// exit.
pub struct AccessLogWriter {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<LogRecord>,
}

impl AccessLogWriter {
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Access log writer received shutdown signal, draining");
                    while let Ok(record) = self.rx.try_recv() {
                        self.write(&record);
                    }
                    return;
                }
                record = self.rx.recv() => match record {
                    Some(record) => self.write(&record),
                    None => return,
                }
            }
        }
    }

    fn write(&self, record: &LogRecord) {
        if let Err(e) = write_record(&self.path, record) {
            error!(path = %self.path.display(), error = %e, "Failed to write access log record");
        }
    }
}

/// Appends one record, prefixing the header when the file does not exist
/// yet. Header and row go out in a single `write_all` so concurrent
/// processes appending to the same file cannot interleave bytes within a
/// record.
pub fn write_record(path: &Path, record: &LogRecord) -> std::io::Result<()> {
    let existed = path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut line = String::new();
    if !existed {
        line.push_str(CSV_HEADER);
        line.push('\n');
    }
    line.push_str(&record.to_csv_row());
    line.push('\n');
    file.write_all(line.as_bytes())
}
