//! One-off scheduled calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: Uuid,
    pub phone_number: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<Uuid>,
    pub status: ScheduleStatus,
    /// Live call bound to this schedule while `executing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledCall {
    /// Only pending schedules may be cancelled by the operator.
    pub fn cancellable(&self) -> bool {
        self.status == ScheduleStatus::Pending
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Pending && self.scheduled_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sched(status: ScheduleStatus, offset_secs: i64) -> ScheduledCall {
        ScheduledCall {
            id: Uuid::new_v4(),
            phone_number: "+5511999990000".into(),
            scheduled_time: Utc::now() + Duration::seconds(offset_secs),
            prompt_id: None,
            status,
            call_id: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn only_pending_is_cancellable() {
        assert!(sched(ScheduleStatus::Pending, 60).cancellable());
        assert!(!sched(ScheduleStatus::Executing, 60).cancellable());
        assert!(!sched(ScheduleStatus::Completed, 60).cancellable());
    }

    #[test]
    fn due_requires_pending_and_past_time() {
        assert!(sched(ScheduleStatus::Pending, -5).due(Utc::now()));
        assert!(!sched(ScheduleStatus::Pending, 300).due(Utc::now()));
        assert!(!sched(ScheduleStatus::Cancelled, -5).due(Utc::now()));
    }
}
