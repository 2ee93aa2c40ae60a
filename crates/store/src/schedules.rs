//! Scheduled one-off calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use vox_domain::error::{Error, Result};
use vox_domain::schedule::{ScheduleStatus, ScheduledCall};

pub struct ScheduleStore {
    path: PathBuf,
    schedules: RwLock<HashMap<Uuid, ScheduledCall>>,
}

impl ScheduleStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("schedules.json");
        let mut schedules: HashMap<Uuid, ScheduledCall> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        // Recovery: an `executing` schedule lost its call with the process.
        let mut recovered = 0usize;
        for s in schedules.values_mut() {
            if s.status == ScheduleStatus::Executing {
                s.status = ScheduleStatus::Failed;
                s.last_error = Some("process restarted mid-call".into());
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "failed in-flight schedules from previous run");
        }

        Ok(Self {
            path,
            schedules: RwLock::new(schedules),
        })
    }

    pub fn create(
        &self,
        phone_number: String,
        scheduled_time: DateTime<Utc>,
        prompt_id: Option<Uuid>,
    ) -> Result<ScheduledCall> {
        let now = Utc::now();
        let schedule = ScheduledCall {
            id: Uuid::new_v4(),
            phone_number,
            scheduled_time,
            prompt_id,
            status: ScheduleStatus::Pending,
            call_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.schedules
            .write()
            .insert(schedule.id, schedule.clone());
        self.flush()?;
        Ok(schedule)
    }

    pub fn get(&self, id: &Uuid) -> Option<ScheduledCall> {
        self.schedules.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ScheduledCall> {
        let mut all: Vec<ScheduledCall> =
            self.schedules.read().values().cloned().collect();
        all.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time));
        all
    }

    /// Operator cancellation; only pending schedules qualify.
    pub fn cancel(&self, id: &Uuid) -> Result<ScheduledCall> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        if !schedule.cancellable() {
            return Err(Error::Conflict(format!(
                "schedule {id} is {:?}, only pending can be cancelled",
                schedule.status
            )));
        }
        schedule.status = ScheduleStatus::Cancelled;
        schedule.updated_at = Utc::now();
        let cancelled = schedule.clone();
        drop(schedules);
        self.flush()?;
        Ok(cancelled)
    }

    /// Pending schedules whose time has come.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledCall> {
        self.schedules
            .read()
            .values()
            .filter(|s| s.due(now))
            .cloned()
            .collect()
    }

    /// Claim a due schedule for execution. Returns false when it was
    /// cancelled (or already claimed) in the meantime.
    pub fn mark_executing(&self, id: &Uuid) -> bool {
        let mut schedules = self.schedules.write();
        let Some(schedule) = schedules.get_mut(id) else {
            return false;
        };
        if schedule.status != ScheduleStatus::Pending {
            return false;
        }
        schedule.status = ScheduleStatus::Executing;
        schedule.updated_at = Utc::now();
        drop(schedules);
        let _ = self.flush();
        true
    }

    /// Bind the originated call once the dialer hands back its id.
    pub fn set_call(&self, id: &Uuid, call_id: &str) {
        let mut schedules = self.schedules.write();
        if let Some(schedule) = schedules.get_mut(id) {
            schedule.call_id = Some(call_id.to_string());
        }
        drop(schedules);
        let _ = self.flush();
    }

    pub fn mark_completed(&self, id: &Uuid) {
        self.finish(id, ScheduleStatus::Completed, None);
    }

    pub fn mark_failed(&self, id: &Uuid, error: &str) {
        self.finish(id, ScheduleStatus::Failed, Some(error.to_string()));
    }

    fn finish(&self, id: &Uuid, status: ScheduleStatus, error: Option<String>) {
        let mut schedules = self.schedules.write();
        if let Some(schedule) = schedules.get_mut(id) {
            schedule.status = status;
            schedule.last_error = error;
            schedule.updated_at = Utc::now();
        }
        drop(schedules);
        let _ = self.flush();
    }

    fn flush(&self) -> Result<()> {
        let schedules = self.schedules.read();
        let json = serde_json::to_string_pretty(&*schedules)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn due_only_returns_pending_past_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path()).unwrap();
        let now = Utc::now();

        let past = store
            .create("+551100".into(), now - Duration::seconds(5), None)
            .unwrap();
        store
            .create("+551101".into(), now + Duration::seconds(300), None)
            .unwrap();

        let due = store.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);
    }

    #[test]
    fn cancel_is_only_valid_while_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path()).unwrap();
        let s = store
            .create("+551100".into(), Utc::now() + Duration::seconds(60), None)
            .unwrap();

        store.cancel(&s.id).unwrap();
        assert_eq!(store.get(&s.id).unwrap().status, ScheduleStatus::Cancelled);

        // Second cancel conflicts.
        assert!(matches!(store.cancel(&s.id), Err(Error::Conflict(_))));
        // Cancelled schedules never come due.
        assert!(store.due(Utc::now() + Duration::seconds(120)).is_empty());
    }

    #[test]
    fn mark_executing_loses_race_with_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path()).unwrap();
        let s = store
            .create("+551100".into(), Utc::now(), None)
            .unwrap();
        store.cancel(&s.id).unwrap();
        assert!(!store.mark_executing(&s.id));
    }

    #[test]
    fn executing_schedules_fail_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ScheduleStore::new(dir.path()).unwrap();
            let s = store.create("+551100".into(), Utc::now(), None).unwrap();
            assert!(store.mark_executing(&s.id));
            store.set_call(&s.id, "call-1");
            s.id
        };
        let store = ScheduleStore::new(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap().status, ScheduleStatus::Failed);
    }
}
