//! Campaign entities: paced outbound dialing over a contact list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Campaign
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    /// Legal transitions form pending → running ↔ paused → completed.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Paused, Completed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<Uuid>,
    /// Per-campaign concurrency cap, clamped to 1–50.
    pub max_concurrent: u32,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MAX_CONCURRENT_FLOOR: u32 = 1;
pub const MAX_CONCURRENT_CEIL: u32 = 50;

pub fn clamp_max_concurrent(v: u32) -> u32 {
    v.clamp(MAX_CONCURRENT_FLOOR, MAX_CONCURRENT_CEIL)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Calling,
    Completed,
    Failed,
}

/// Maximum dial attempts per contact (initial try + 2 retries).
pub const MAX_CONTACT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContact {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extra CSV columns beyond phone_number/name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub status: ContactStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the next attempt may be made (retry spacing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Live call currently bound to this contact, while `calling`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag() {
        use CampaignStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Pending));
    }

    #[test]
    fn max_concurrent_is_clamped() {
        assert_eq!(clamp_max_concurrent(0), 1);
        assert_eq!(clamp_max_concurrent(7), 7);
        assert_eq!(clamp_max_concurrent(500), 50);
    }
}
