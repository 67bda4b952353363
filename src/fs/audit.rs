//! Audit logging for policy decisions
//!
//! Records are handed to a bounded channel and written out by a dedicated
//! thread, so a slow sink never stalls a filesystem call. When the channel
//! is full the record is dropped and counted.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

use super::policy::{OperationKind, Reason, Verdict};

/// Target used for audit events
pub const AUDIT_TARGET: &str = "immutfs::audit";

/// Default number of records that may wait for the sink
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// Who issued a filesystem request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallerIdentity {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Kind of audited decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Denied,
    AllowedViaGrace,
}

/// One audited decision
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub op: OperationKind,
    pub path: PathBuf,
    pub caller: CallerIdentity,
    pub reason: Reason,
    /// Time since the object's birth, when known
    pub elapsed: Option<Duration>,
    /// Time left in the grace window, for grace-allowed operations
    pub remaining: Option<Duration>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record for a verdict worth auditing. Plain allows (reads,
    /// new objects) produce nothing.
    pub fn from_verdict(
        verdict: &Verdict,
        op: OperationKind,
        path: PathBuf,
        caller: CallerIdentity,
    ) -> Option<Self> {
        let (event, elapsed, remaining) = match verdict.reason {
            Reason::WithinGrace { elapsed, remaining } if verdict.allowed => {
                (AuditEvent::AllowedViaGrace, Some(elapsed), Some(remaining))
            }
            _ if verdict.allowed => return None,
            Reason::NoGrace { elapsed } => (AuditEvent::Denied, elapsed, None),
            _ => (AuditEvent::Denied, None, None),
        };

        Some(AuditRecord {
            event,
            op,
            path,
            caller,
            reason: verdict.reason,
            elapsed,
            remaining,
            at: Utc::now(),
        })
    }
}

/// Destination for audit records
pub trait AuditSink: Send {
    fn emit(&mut self, record: &AuditRecord);
}

/// Writes each record as a structured tracing event
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&mut self, record: &AuditRecord) {
        let elapsed_ms = record.elapsed.map(|d| d.as_millis() as u64);
        let remaining_ms = record.remaining.map(|d| d.as_millis() as u64);
        match record.event {
            AuditEvent::Denied => warn!(
                target: AUDIT_TARGET,
                op = %record.op,
                path = %record.path.display(),
                pid = record.caller.pid,
                uid = record.caller.uid,
                gid = record.caller.gid,
                reason = ?record.reason,
                elapsed_ms,
                at = %record.at.to_rfc3339(),
                "denied"
            ),
            AuditEvent::AllowedViaGrace => info!(
                target: AUDIT_TARGET,
                op = %record.op,
                path = %record.path.display(),
                pid = record.caller.pid,
                uid = record.caller.uid,
                gid = record.caller.gid,
                elapsed_ms,
                remaining_ms,
                at = %record.at.to_rfc3339(),
                "allowed within grace"
            ),
        }
    }
}

/// Best-effort, non-blocking audit logger
pub struct AuditLogger {
    /// Read-locked by every record call, write-locked only to close
    tx: RwLock<Option<mpsc::Sender<AuditRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl AuditLogger {
    /// Logger that discards everything
    pub fn disabled() -> Self {
        AuditLogger {
            tx: RwLock::new(None),
            worker: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Start a logger writing to tracing
    pub fn tracing() -> crate::error::Result<Self> {
        Self::spawn(DEFAULT_AUDIT_CAPACITY, TracingSink)
    }

    /// Start a logger draining into `sink` on its own thread
    pub fn spawn<S: AuditSink + 'static>(capacity: usize, mut sink: S) -> crate::error::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));

        let worker = std::thread::Builder::new()
            .name("audit".to_string())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    sink.emit(&record);
                }
            })?;

        Ok(AuditLogger {
            tx: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Queue a record. Never blocks; drops the record if the sink is behind.
    pub fn record(&self, record: AuditRecord) {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records lost because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting records, drain what is queued and join the worker
    pub fn shutdown(&self) {
        self.tx.write().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// Sink collecting records for inspection
    #[derive(Clone, Default)]
    pub struct MemorySink {
        pub records: Arc<Mutex<Vec<AuditRecord>>>,
    }

    impl AuditSink for MemorySink {
        fn emit(&mut self, record: &AuditRecord) {
            self.records.lock().push(record.clone());
        }
    }
}
