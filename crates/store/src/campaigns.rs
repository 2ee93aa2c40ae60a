//! Campaign and contact store, including CSV contact import.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vox_domain::campaign::{
    clamp_max_concurrent, Campaign, CampaignContact, CampaignStatus, ContactStatus,
    MAX_CONTACT_ATTEMPTS,
};
use vox_domain::error::{Error, Result};

/// Spacing before a connect-failed contact may be retried.
const RETRY_SPACING_SECS: i64 = 60;

#[derive(Default, Serialize, Deserialize)]
struct CampaignFile {
    campaigns: HashMap<Uuid, Campaign>,
    contacts: HashMap<Uuid, Vec<CampaignContact>>,
}

/// Result of a CSV import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

pub struct CampaignStore {
    path: PathBuf,
    inner: RwLock<CampaignFile>,
}

impl CampaignStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("campaigns.json");
        let mut inner: CampaignFile = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            CampaignFile::default()
        };

        // Recovery: contacts stuck in `calling` from a previous run go back
        // to pending so a restarted campaign can pick them up.
        let mut recovered = 0usize;
        for contacts in inner.contacts.values_mut() {
            for contact in contacts.iter_mut() {
                if contact.status == ContactStatus::Calling {
                    contact.status = ContactStatus::Pending;
                    contact.call_id = None;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "reset in-flight campaign contacts to pending");
        }

        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    // ── Campaigns ────────────────────────────────────────────────────

    pub fn create(
        &self,
        name: String,
        prompt_id: Option<Uuid>,
        max_concurrent: u32,
    ) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name,
            prompt_id,
            max_concurrent: clamp_max_concurrent(max_concurrent),
            status: CampaignStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write();
        inner.campaigns.insert(campaign.id, campaign.clone());
        inner.contacts.insert(campaign.id, Vec::new());
        drop(inner);
        self.flush()?;
        Ok(campaign)
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.inner.read().campaigns.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Campaign> {
        let mut all: Vec<Campaign> =
            self.inner.read().campaigns.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Transition a campaign along the pending → running ↔ paused →
    /// completed DAG; anything else is a state conflict.
    pub fn set_status(&self, id: &Uuid, next: CampaignStatus) -> Result<Campaign> {
        let mut inner = self.inner.write();
        let campaign = inner
            .campaigns
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        if !campaign.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "campaign {id} cannot go {:?} → {next:?}",
                campaign.status
            )));
        }
        campaign.status = next;
        campaign.updated_at = Utc::now();
        let updated = campaign.clone();
        drop(inner);
        self.flush()?;
        Ok(updated)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.campaigns.remove(id).is_none() {
            return Err(Error::NotFound(format!("campaign {id}")));
        }
        inner.contacts.remove(id);
        drop(inner);
        self.flush()
    }

    // ── Contact import ───────────────────────────────────────────────

    /// Import contacts from CSV bytes. Header row required; `phone_number`
    /// is mandatory, `name` optional, any other column lands in contact
    /// metadata. Duplicates within the campaign are skipped silently and
    /// reported.
    pub fn import_csv(&self, id: &Uuid, data: &[u8]) -> Result<ImportReport> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(data);

        let headers = reader
            .headers()
            .map_err(|e| Error::Other(format!("csv: {e}")))?
            .clone();
        let phone_col = headers
            .iter()
            .position(|h| h == "phone_number")
            .ok_or_else(|| Error::Other("csv is missing a phone_number column".into()))?;
        let name_col = headers.iter().position(|h| h == "name");

        let mut inner = self.inner.write();
        if !inner.campaigns.contains_key(id) {
            return Err(Error::NotFound(format!("campaign {id}")));
        }
        let contacts = inner.contacts.entry(*id).or_default();
        let mut seen: std::collections::HashSet<String> =
            contacts.iter().map(|c| c.phone_number.clone()).collect();

        let mut report = ImportReport {
            imported: 0,
            duplicates: 0,
            invalid: 0,
        };

        for row in reader.records() {
            let row = match row {
                Ok(r) => r,
                Err(_) => {
                    report.invalid += 1;
                    continue;
                }
            };
            let phone = row.get(phone_col).unwrap_or("").trim();
            if phone.is_empty() {
                report.invalid += 1;
                continue;
            }
            if !seen.insert(phone.to_string()) {
                report.duplicates += 1;
                continue;
            }

            let mut metadata = HashMap::new();
            for (i, value) in row.iter().enumerate() {
                if i == phone_col || Some(i) == name_col || value.is_empty() {
                    continue;
                }
                if let Some(key) = headers.get(i) {
                    metadata.insert(key.to_string(), value.to_string());
                }
            }

            contacts.push(CampaignContact {
                id: Uuid::new_v4(),
                campaign_id: *id,
                phone_number: phone.to_string(),
                name: name_col
                    .and_then(|i| row.get(i))
                    .filter(|n| !n.is_empty())
                    .map(String::from),
                metadata,
                status: ContactStatus::Pending,
                attempts: 0,
                last_error: None,
                next_attempt_at: None,
                call_id: None,
            });
            report.imported += 1;
        }
        drop(inner);
        self.flush()?;
        Ok(report)
    }

    // ── Contact pacing ───────────────────────────────────────────────

    pub fn contacts(&self, id: &Uuid) -> Vec<CampaignContact> {
        self.inner
            .read()
            .contacts
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Counts by status: (pending, calling, completed, failed). A pending
    /// contact waiting out its retry spacing still counts as pending.
    pub fn counts(&self, id: &Uuid) -> (usize, usize, usize, usize) {
        let inner = self.inner.read();
        let mut counts = (0, 0, 0, 0);
        if let Some(contacts) = inner.contacts.get(id) {
            for c in contacts {
                match c.status {
                    ContactStatus::Pending => counts.0 += 1,
                    ContactStatus::Calling => counts.1 += 1,
                    ContactStatus::Completed => counts.2 += 1,
                    ContactStatus::Failed => counts.3 += 1,
                }
            }
        }
        counts
    }

    /// Claim up to `limit` dialable contacts, marking each `calling`.
    pub fn claim_pending(
        &self,
        id: &Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<CampaignContact> {
        let mut inner = self.inner.write();
        let mut claimed = Vec::new();
        if let Some(contacts) = inner.contacts.get_mut(id) {
            for contact in contacts.iter_mut() {
                if claimed.len() >= limit {
                    break;
                }
                let due = contact
                    .next_attempt_at
                    .map(|t| t <= now)
                    .unwrap_or(true);
                if contact.status == ContactStatus::Pending && due {
                    contact.status = ContactStatus::Calling;
                    claimed.push(contact.clone());
                }
            }
        }
        drop(inner);
        if !claimed.is_empty() {
            let _ = self.flush();
        }
        claimed
    }

    pub fn bind_call(&self, id: &Uuid, contact_id: &Uuid, call_id: &str) {
        let mut inner = self.inner.write();
        if let Some(contact) = inner
            .contacts
            .get_mut(id)
            .and_then(|c| c.iter_mut().find(|c| c.id == *contact_id))
        {
            contact.call_id = Some(call_id.to_string());
        }
        drop(inner);
        let _ = self.flush();
    }

    pub fn contact_succeeded(&self, id: &Uuid, contact_id: &Uuid) {
        let mut inner = self.inner.write();
        if let Some(contact) = inner
            .contacts
            .get_mut(id)
            .and_then(|c| c.iter_mut().find(|c| c.id == *contact_id))
        {
            contact.status = ContactStatus::Completed;
            contact.call_id = None;
            contact.last_error = None;
        }
        drop(inner);
        let _ = self.flush();
    }

    /// Record a failed attempt. Connect/answer failures are retried up to
    /// the attempt cap with fixed spacing; post-answer failures are
    /// terminal.
    pub fn contact_failed(
        &self,
        id: &Uuid,
        contact_id: &Uuid,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write();
        if let Some(contact) = inner
            .contacts
            .get_mut(id)
            .and_then(|c| c.iter_mut().find(|c| c.id == *contact_id))
        {
            contact.attempts += 1;
            contact.last_error = Some(error.to_string());
            contact.call_id = None;
            if retryable && contact.attempts < MAX_CONTACT_ATTEMPTS {
                contact.status = ContactStatus::Pending;
                contact.next_attempt_at = Some(now + Duration::seconds(RETRY_SPACING_SECS));
            } else {
                contact.status = ContactStatus::Failed;
            }
        }
        drop(inner);
        let _ = self.flush();
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        let json = serde_json::to_string_pretty(&*inner)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &[u8] =
        b"phone_number,name,city\n+5511999990001,Ana,Recife\n+5511999990002,,\n+5511999990001,Ana,Recife\n";

    fn store() -> (tempfile::TempDir, CampaignStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn import_skips_in_file_duplicates() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        let report = store.import_csv(&c.id, CSV).unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.duplicates, 1);

        let contacts = store.contacts(&c.id);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].name.as_deref(), Some("Ana"));
        assert_eq!(contacts[0].metadata.get("city").map(String::as_str), Some("Recife"));
    }

    #[test]
    fn reimport_reports_all_duplicates() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        store.import_csv(&c.id, CSV).unwrap();
        let second = store.import_csv(&c.id, CSV).unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 3);
    }

    #[test]
    fn import_requires_phone_number_column() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        let err = store.import_csv(&c.id, b"number,name\n123,x\n");
        assert!(err.is_err());
    }

    #[test]
    fn status_transitions_enforce_dag() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        let err = store.set_status(&c.id, CampaignStatus::Paused);
        assert!(matches!(err, Err(Error::Conflict(_))), "pending cannot pause");

        store.set_status(&c.id, CampaignStatus::Running).unwrap();
        store.set_status(&c.id, CampaignStatus::Paused).unwrap();
        store.set_status(&c.id, CampaignStatus::Running).unwrap();
        store.set_status(&c.id, CampaignStatus::Completed).unwrap();
        let err = store.set_status(&c.id, CampaignStatus::Running);
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[test]
    fn claim_respects_limit_and_marks_calling() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        store
            .import_csv(
                &c.id,
                b"phone_number\n+551100\n+551101\n+551102\n+551103\n",
            )
            .unwrap();

        let claimed = store.claim_pending(&c.id, 2, Utc::now());
        assert_eq!(claimed.len(), 2);
        let (pending, calling, _, _) = store.counts(&c.id);
        assert_eq!(pending, 2);
        assert_eq!(calling, 2);
    }

    #[test]
    fn retry_spacing_defers_reclaim() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        store.import_csv(&c.id, b"phone_number\n+551100\n").unwrap();

        let now = Utc::now();
        let contact = store.claim_pending(&c.id, 1, now).remove(0);
        store.contact_failed(&c.id, &contact.id, "no answer", true, now);

        // Not yet due.
        assert!(store.claim_pending(&c.id, 1, now).is_empty());
        // Due after the spacing window.
        let later = now + Duration::seconds(RETRY_SPACING_SECS + 1);
        assert_eq!(store.claim_pending(&c.id, 1, later).len(), 1);
    }

    #[test]
    fn attempts_cap_terminates_contact() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        store.import_csv(&c.id, b"phone_number\n+551100\n").unwrap();

        let mut now = Utc::now();
        for _ in 0..MAX_CONTACT_ATTEMPTS {
            now = now + Duration::seconds(RETRY_SPACING_SECS + 1);
            let claimed = store.claim_pending(&c.id, 1, now);
            assert_eq!(claimed.len(), 1);
            store.contact_failed(&c.id, &claimed[0].id, "no answer", true, now);
        }
        let contacts = store.contacts(&c.id);
        assert_eq!(contacts[0].status, ContactStatus::Failed);
        assert_eq!(contacts[0].attempts, MAX_CONTACT_ATTEMPTS);
        // No further claims.
        assert!(store
            .claim_pending(&c.id, 1, now + Duration::seconds(600))
            .is_empty());
    }

    #[test]
    fn post_answer_failure_is_terminal() {
        let (_dir, store) = store();
        let c = store.create("c".into(), None, 2).unwrap();
        store.import_csv(&c.id, b"phone_number\n+551100\n").unwrap();

        let now = Utc::now();
        let claimed = store.claim_pending(&c.id, 1, now);
        store.contact_failed(&c.id, &claimed[0].id, "stt died", false, now);
        assert_eq!(store.contacts(&c.id)[0].status, ContactStatus::Failed);
    }

    #[test]
    fn calling_contacts_reset_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = CampaignStore::new(dir.path()).unwrap();
            let c = store.create("c".into(), None, 2).unwrap();
            store.import_csv(&c.id, b"phone_number\n+551100\n").unwrap();
            store.claim_pending(&c.id, 1, Utc::now());
            c.id
        };
        let store = CampaignStore::new(dir.path()).unwrap();
        assert_eq!(store.contacts(&id)[0].status, ContactStatus::Pending);
    }
}
