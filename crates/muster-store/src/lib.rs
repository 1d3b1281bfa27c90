//! muster-store — On-device persistence for the Muster engine.
//!
//! A SQLite-backed [`RecordStore`] for deployments that keep attendance
//! records locally until the field device syncs, plus file helpers for
//! the versioned gallery snapshot format.

use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Utc};
use muster_core::{AttendanceRecord, EmbeddingStore, GeoPoint, RecordType, SnapshotError};
use muster_engine::{RecordStore, RecordStoreError};
use rusqlite::params;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance_records (
    identity_id     TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    record_type     TEXT NOT NULL,
    confidence      REAL NOT NULL,
    latitude        REAL,
    longitude       REAL,
    created_at      TEXT NOT NULL,
    source_track_id TEXT NOT NULL,
    PRIMARY KEY (identity_id, session_id, record_type)
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("stored record is malformed: {0}")]
    Malformed(String),
}

/// SQLite-backed attendance record store. The primary key mirrors the
/// engine's dedupe key, so persistence is idempotent even across
/// process restarts.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// All stored records, optionally filtered by session, newest first.
    pub async fn list(&self, session_id: Option<String>) -> Result<Vec<AttendanceRecord>, StoreError> {
        type Row = (String, String, String, f64, Option<f64>, Option<f64>, String, String);

        let rows: Vec<Row> = self
            .conn
            .call(move |c| {
                let (sql, filter) = match &session_id {
                    Some(session) => (
                        "SELECT identity_id, session_id, record_type, confidence, latitude,
                                longitude, created_at, source_track_id
                         FROM attendance_records WHERE session_id = ?1
                         ORDER BY created_at DESC",
                        Some(session.clone()),
                    ),
                    None => (
                        "SELECT identity_id, session_id, record_type, confidence, latitude,
                                longitude, created_at, source_track_id
                         FROM attendance_records ORDER BY created_at DESC",
                        None,
                    ),
                };
                let mut stmt = c.prepare(sql)?;
                let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                };
                let rows = match filter {
                    Some(session) => stmt
                        .query_map(params![session], map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                    None => stmt
                        .query_map([], map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                };
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(parse_row).collect()
    }
}

fn parse_row(
    (identity_id, session_id, record_type, confidence, latitude, longitude, created_at, track): (
        String,
        String,
        String,
        f64,
        Option<f64>,
        Option<f64>,
        String,
        String,
    ),
) -> Result<AttendanceRecord, StoreError> {
    let record_type = RecordType::parse(&record_type)
        .ok_or_else(|| StoreError::Malformed(format!("unknown record type {record_type}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Malformed(format!("created_at: {e}")))?
        .with_timezone(&Utc);
    let source_track_id = Uuid::parse_str(&track)
        .map_err(|e| StoreError::Malformed(format!("source_track_id: {e}")))?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    };
    Ok(AttendanceRecord {
        identity_id,
        session_id,
        record_type,
        confidence: confidence as f32,
        location,
        created_at,
        source_track_id,
    })
}

impl RecordStore for SqliteRecordStore {
    fn persist(
        &self,
        record: &AttendanceRecord,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send {
        let conn = self.conn.clone();
        let record = record.clone();
        async move {
            let changed = conn
                .call(move |c| {
                    let changed = c.execute(
                        "INSERT OR IGNORE INTO attendance_records
                         (identity_id, session_id, record_type, confidence, latitude,
                          longitude, created_at, source_track_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            record.identity_id,
                            record.session_id,
                            record.record_type.as_str(),
                            record.confidence as f64,
                            record.location.map(|l| l.latitude),
                            record.location.map(|l| l.longitude),
                            record.created_at.to_rfc3339(),
                            record.source_track_id.to_string(),
                        ],
                    )?;
                    Ok(changed)
                })
                .await
                .map_err(|e| RecordStoreError::Backend(e.to_string()))?;
            Ok(changed > 0)
        }
    }

    fn exists(
        &self,
        identity_id: &str,
        session_id: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<bool, RecordStoreError>> + Send {
        let conn = self.conn.clone();
        let identity_id = identity_id.to_string();
        let session_id = session_id.to_string();
        async move {
            conn.call(move |c| {
                let found = c.query_row(
                    "SELECT EXISTS(
                         SELECT 1 FROM attendance_records
                         WHERE identity_id = ?1 AND session_id = ?2 AND record_type = ?3
                     )",
                    params![identity_id, session_id, record_type.as_str()],
                    |row| row.get::<_, bool>(0),
                )?;
                Ok(found)
            })
            .await
            .map_err(|e| RecordStoreError::Backend(e.to_string()))
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotFileError {
    #[error("snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Write the gallery snapshot (versioned, checksummed JSON) to disk.
pub fn save_snapshot_file(
    store: &EmbeddingStore,
    path: impl AsRef<Path>,
) -> Result<(), SnapshotFileError> {
    let json = store.to_json()?;
    std::fs::write(path.as_ref(), json)?;
    tracing::info!(path = %path.as_ref().display(), identities = store.len(), "gallery snapshot saved");
    Ok(())
}

/// Rehydrate a gallery from a snapshot file, verifying version and
/// checksum.
pub fn load_snapshot_file(
    path: impl AsRef<Path>,
    history_bound: usize,
) -> Result<EmbeddingStore, SnapshotFileError> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let store = EmbeddingStore::from_json(&json, history_bound)?;
    tracing::info!(path = %path.as_ref().display(), identities = store.len(), "gallery snapshot loaded");
    Ok(store)
}
