//! Engine facade.
//!
//! Owns the embedding store and the session registry, and wires closed
//! sessions to the caller's record store and submission channel. An
//! engine instance is self-contained: tests and multi-tenant callers
//! construct independent engines with independent stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use muster_core::{EmbeddingStore, EnrollError, Observation};
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::enroll::{EnrollReceipt, EnrollmentWorkflow};
use crate::reconcile::GroupAttendanceResult;
use crate::session::{
    spawn_session, FrameReport, SessionError, SessionHandle, SessionOptions, SessionRequest,
};
use crate::sink::{RecordStore, SubmissionChannel};

enum SessionSlot {
    Active(SessionHandle),
    /// Tombstone left after `end_session`, so late frames are told the
    /// session closed rather than that it never existed.
    Closed,
}

pub struct Engine<R: RecordStore, C: SubmissionChannel> {
    config: EngineConfig,
    store: Arc<EmbeddingStore>,
    enrollment: EnrollmentWorkflow,
    records: Arc<R>,
    channel: Arc<C>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl<R: RecordStore, C: SubmissionChannel> Engine<R, C> {
    pub fn new(config: EngineConfig, records: R, channel: C) -> Self {
        let store = Arc::new(EmbeddingStore::with_history_bound(
            config.embedding_dim,
            config.template_history_bound,
        ));
        Self::with_store(config, store, records, channel)
    }

    /// Construct around an existing store, e.g. one rehydrated from a
    /// snapshot.
    pub fn with_store(
        config: EngineConfig,
        store: Arc<EmbeddingStore>,
        records: R,
        channel: C,
    ) -> Self {
        let enrollment = EnrollmentWorkflow::new(&config, Arc::clone(&store));
        Self {
            config,
            store,
            enrollment,
            records: Arc::new(records),
            channel: Arc::new(channel),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn records(&self) -> &Arc<R> {
        &self.records
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Open a capture session. Must be called from within a tokio
    /// runtime; the session runs as its own task until closed.
    pub fn begin_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock_sessions();
        if sessions.contains_key(session_id) {
            return Err(SessionError::SessionExists(session_id.to_string()));
        }
        let handle = spawn_session(
            session_id.to_string(),
            options,
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.records),
            Arc::clone(&self.channel),
        );
        sessions.insert(session_id.to_string(), SessionSlot::Active(handle));
        Ok(())
    }

    /// Feed one frame's observations. Safe to call concurrently with
    /// `end_session`; the per-session actor serializes them.
    pub async fn feed_frame(
        &self,
        session_id: &str,
        observations: Vec<Observation>,
    ) -> Result<FrameReport, SessionError> {
        let tx = self.sender_for(session_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SessionRequest::Feed { observations, reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Close the session and return its reconciled result. Idempotent
    /// against an idle-timeout close: the parked result is returned.
    pub async fn end_session(
        &self,
        session_id: &str,
    ) -> Result<GroupAttendanceResult, SessionError> {
        let tx = self.sender_for(session_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SessionRequest::End { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| SessionError::ChannelClosed)?;

        self.lock_sessions()
            .insert(session_id.to_string(), SessionSlot::Closed);
        Ok(result)
    }

    pub fn enroll_candidate(
        &self,
        identity_id: &str,
        observation: &Observation,
    ) -> Result<EnrollReceipt, EnrollError> {
        self.enrollment.enroll_candidate(identity_id, observation)
    }

    pub fn re_enroll_candidate(
        &self,
        identity_id: &str,
        observation: &Observation,
    ) -> Result<EnrollReceipt, EnrollError> {
        self.enrollment.re_enroll_candidate(identity_id, observation)
    }

    fn sender_for(
        &self,
        session_id: &str,
    ) -> Result<tokio::sync::mpsc::Sender<SessionRequest>, SessionError> {
        match self.lock_sessions().get(session_id) {
            Some(SessionSlot::Active(handle)) => Ok(handle.tx.clone()),
            Some(SessionSlot::Closed) => {
                Err(SessionError::SessionClosed(session_id.to_string()))
            }
            None => Err(SessionError::UnknownSession(session_id.to_string())),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
