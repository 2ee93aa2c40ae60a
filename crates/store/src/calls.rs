//! Call history store; implements the session engine's journal seam.
//!
//! Backed by `calls.json`. Mutations mark the store dirty; a periodic
//! task (and every finalize) flushes to disk. On load, rows still marked
//! live are failed — in-flight calls do not survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use vox_domain::call::{CallOutcome, CallRecord, CallState, TranscriptEntry};
use vox_domain::error::{Error, Result};
use vox_sessions::journal::CallJournal;

pub struct CallStore {
    path: PathBuf,
    calls: RwLock<HashMap<String, CallRecord>>,
    dirty: AtomicBool,
}

impl CallStore {
    /// Load or create the store at `state_path/calls.json`, running
    /// startup recovery on rows still marked live.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("calls.json");

        let mut calls: HashMap<String, CallRecord> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        // Recovery: anything not terminal was in flight when the process
        // died.
        let mut recovered = 0usize;
        for record in calls.values_mut() {
            if record.state != CallState::Ended {
                record.state = CallState::Ended;
                record.outcome = Some(CallOutcome::Failed);
                record.ended.get_or_insert_with(Utc::now);
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "failed in-flight calls from previous run");
        }

        tracing::info!(calls = calls.len(), path = %path.display(), "call store loaded");

        let store = Self {
            path,
            calls: RwLock::new(calls),
            dirty: AtomicBool::new(recovered > 0),
        };
        store.flush_if_dirty();
        Ok(store)
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.read().get(call_id).cloned()
    }

    /// Paginated history, newest first, optionally filtered by outcome
    /// (`"completed"` / `"failed"`). Returns `(page, total_matching)`.
    pub fn list(
        &self,
        page: usize,
        per_page: usize,
        status: Option<&str>,
    ) -> (Vec<CallRecord>, usize) {
        let calls = self.calls.read();
        let mut rows: Vec<&CallRecord> = calls
            .values()
            .filter(|r| match status {
                Some("completed") => r.outcome == Some(CallOutcome::Completed),
                Some("failed") => r.outcome == Some(CallOutcome::Failed),
                Some("active") => r.state != CallState::Ended,
                _ => true,
            })
            .collect();
        rows.sort_by(|a, b| b.created.cmp(&a.created));

        let total = rows.len();
        let page = page.max(1);
        let start = (page - 1).saturating_mul(per_page);
        let rows = rows
            .into_iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        (rows, total)
    }

    pub fn delete(&self, call_id: &str) -> Result<()> {
        let removed = self.calls.write().remove(call_id);
        if removed.is_none() {
            return Err(Error::NotFound(format!("call {call_id}")));
        }
        self.mark_dirty();
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the snapshot when anything changed since the last flush.
    pub fn flush_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "call store flush failed");
            self.mark_dirty();
        }
    }

    pub fn flush(&self) -> Result<()> {
        let calls = self.calls.read();
        let json = serde_json::to_string_pretty(&*calls)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CallJournal for CallStore {
    async fn insert_call(&self, record: CallRecord) -> Result<()> {
        let mut calls = self.calls.write();
        // Idempotent on call_id: a re-insert never clobbers the original.
        calls.entry(record.call_id.clone()).or_insert(record);
        drop(calls);
        self.mark_dirty();
        Ok(())
    }

    async fn append_message(&self, call_id: &str, entry: TranscriptEntry) -> Result<()> {
        let mut calls = self.calls.write();
        let record = calls
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        record.transcript.push(entry);
        drop(calls);
        self.mark_dirty();
        Ok(())
    }

    async fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut calls = self.calls.write();
        if let Some(record) = calls.get_mut(call_id) {
            record.answered = Some(at);
        }
        drop(calls);
        self.mark_dirty();
        Ok(())
    }

    async fn set_switch_uuid(&self, call_id: &str, switch_uuid: String) -> Result<()> {
        let mut calls = self.calls.write();
        if let Some(record) = calls.get_mut(call_id) {
            record.switch_uuid = Some(switch_uuid);
        }
        drop(calls);
        self.mark_dirty();
        Ok(())
    }

    async fn finalize_call(
        &self,
        call_id: &str,
        outcome: CallOutcome,
        ended: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<()> {
        {
            let mut calls = self.calls.write();
            let record = calls
                .get_mut(call_id)
                .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
            record.state = CallState::Ended;
            record.outcome = Some(outcome);
            record.ended = Some(ended);
            record.duration_ms = duration_ms;
        }
        self.mark_dirty();
        // Terminal rows are flushed eagerly; everything else rides the
        // periodic flush.
        self.flush_if_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_domain::call::{CallDirection, CallOrigin, PromptSnapshot};

    fn record(call_id: &str) -> CallRecord {
        CallRecord {
            call_id: call_id.into(),
            switch_uuid: None,
            caller: "+5511000000001".into(),
            called: "+5511000000002".into(),
            direction: CallDirection::Outbound,
            origin: CallOrigin::Operator,
            prompt: PromptSnapshot {
                system_text: "x".into(),
                voice_id: "luna".into(),
                model: "gpt-4o-mini".into(),
                temperature: 0.7,
                greeting: None,
            },
            state: CallState::Pending,
            outcome: None,
            created: Utc::now(),
            answered: None,
            ended: None,
            duration_ms: 0,
            transcript: Vec::new(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_call_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::new(dir.path()).unwrap();

        let mut first = record("c1");
        first.caller = "original".into();
        store.insert_call(first).await.unwrap();

        let mut second = record("c1");
        second.caller = "imposter".into();
        store.insert_call(second).await.unwrap();

        assert_eq!(store.get("c1").unwrap().caller, "original");
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        store.insert_call(record("c1")).await.unwrap();

        for i in 0..5 {
            store
                .append_message("c1", TranscriptEntry::user(format!("m{i}"), None))
                .await
                .unwrap();
        }
        let contents: Vec<String> = store
            .get("c1")
            .unwrap()
            .transcript
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn recovery_fails_in_flight_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CallStore::new(dir.path()).unwrap();
            let mut live = record("c1");
            live.state = CallState::Speaking;
            store.insert_call(live).await.unwrap();
            store.flush().unwrap();
        }
        let reloaded = CallStore::new(dir.path()).unwrap();
        let rec = reloaded.get("c1").unwrap();
        assert_eq!(rec.state, CallState::Ended);
        assert_eq!(rec.outcome, Some(CallOutcome::Failed));
    }

    #[tokio::test]
    async fn finalize_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        store.insert_call(record("c1")).await.unwrap();
        store
            .finalize_call("c1", CallOutcome::Completed, Utc::now(), 12_000)
            .await
            .unwrap();

        let reloaded = CallStore::new(dir.path()).unwrap();
        let rec = reloaded.get("c1").unwrap();
        assert_eq!(rec.outcome, Some(CallOutcome::Completed));
        assert_eq!(rec.duration_ms, 12_000);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::new(dir.path()).unwrap();
        for i in 0..7 {
            let id = format!("c{i}");
            store.insert_call(record(&id)).await.unwrap();
            let outcome = if i % 2 == 0 {
                CallOutcome::Completed
            } else {
                CallOutcome::Failed
            };
            store
                .finalize_call(&id, outcome, Utc::now(), 0)
                .await
                .unwrap();
        }

        let (rows, total) = store.list(1, 3, None);
        assert_eq!(total, 7);
        assert_eq!(rows.len(), 3);

        let (_, completed) = store.list(1, 10, Some("completed"));
        assert_eq!(completed, 4);
        let (_, failed) = store.list(1, 10, Some("failed"));
        assert_eq!(failed, 3);
    }
}
