//! Persistence boundaries.
//!
//! The engine proposes attendance records and session results; the
//! caller owns durable storage and transport. Both traits are async so
//! the waits are cancellable, and both sit outside the matching hot
//! path: they are only touched when a session closes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use muster_core::{AttendanceRecord, RecordType};
use thiserror::Error;

use crate::reconcile::GroupAttendanceResult;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission channel: {0}")]
    Channel(String),
}

/// Durable home of attendance records, owned by the caller.
pub trait RecordStore: Send + Sync + 'static {
    /// Persist idempotently on the (identity, session, record type)
    /// key. `Ok(true)` means newly stored, `Ok(false)` means an
    /// equivalent record already existed.
    fn persist(
        &self,
        record: &AttendanceRecord,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send;

    fn exists(
        &self,
        identity_id: &str,
        session_id: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send;
}

/// Outbound path for completed session results.
pub trait SubmissionChannel: Send + Sync + 'static {
    fn submit(
        &self,
        result: &GroupAttendanceResult,
    ) -> impl Future<Output = Result<(), SubmitError>> + Send;
}

#[derive(Default)]
struct MemoryInner {
    keys: HashSet<(String, String, RecordType)>,
    records: Vec<AttendanceRecord>,
}

/// In-memory record store for tests and diagnostics.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    fn persist(
        &self,
        record: &AttendanceRecord,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send {
        let inserted = {
            let mut inner = self.lock();
            let key = (
                record.identity_id.clone(),
                record.session_id.clone(),
                record.record_type,
            );
            if inner.keys.insert(key) {
                inner.records.push(record.clone());
                true
            } else {
                false
            }
        };
        async move { Ok(inserted) }
    }

    fn exists(
        &self,
        identity_id: &str,
        session_id: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send {
        let key = (identity_id.to_string(), session_id.to_string(), record_type);
        let found = self.lock().keys.contains(&key);
        async move { Ok(found) }
    }
}

/// Discards submitted results. For callers that only poll
/// `end_session`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSubmissionChannel;

impl SubmissionChannel for NullSubmissionChannel {
    fn submit(
        &self,
        _result: &GroupAttendanceResult,
    ) -> impl Future<Output = Result<(), SubmitError>> + Send {
        async move { Ok(()) }
    }
}

/// Captures submitted results, for tests.
#[derive(Default)]
pub struct MemorySubmissionChannel {
    results: Mutex<Vec<GroupAttendanceResult>>,
}

impl MemorySubmissionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<GroupAttendanceResult> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SubmissionChannel for MemorySubmissionChannel {
    fn submit(
        &self,
        result: &GroupAttendanceResult,
    ) -> impl Future<Output = Result<(), SubmitError>> + Send {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        async move { Ok(()) }
    }
}
