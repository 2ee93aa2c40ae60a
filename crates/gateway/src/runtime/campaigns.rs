//! Campaign runner: one cooperative loop per running campaign.
//!
//! Each iteration claims up to `max_concurrent − calling` pending
//! contacts, dials them, and binds the resulting calls. Terminal session
//! events update contact status; connect/answer failures retry with
//! spacing, post-answer failures are terminal. Pause is cooperative:
//! the loop keeps ticking but stops claiming; in-flight calls finish on
//! their own.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use vox_domain::call::{CallOrigin, CallOutcome, LifecycleEvent};
use vox_domain::campaign::{Campaign, CampaignStatus};
use vox_domain::error::{Error, Result};

use crate::state::AppState;

const TICK: Duration = Duration::from_secs(1);

/// Tracks which campaigns currently have a live loop, so start/resume
/// never doubles one up.
pub struct CampaignSupervisor {
    running: Mutex<HashSet<Uuid>>,
}

impl Default for CampaignSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignSupervisor {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Start (or resume) a campaign and ensure its loop is running.
    pub fn start(&self, state: &AppState, id: Uuid) -> Result<Campaign> {
        let campaign = state
            .campaigns
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        let campaign = if campaign.status == CampaignStatus::Running {
            campaign
        } else {
            state.campaigns.set_status(&id, CampaignStatus::Running)?
        };
        self.ensure_loop(state, id);
        Ok(campaign)
    }

    /// Cooperative pause: the loop sees the flag on its next iteration.
    pub fn pause(&self, state: &AppState, id: Uuid) -> Result<Campaign> {
        state.campaigns.set_status(&id, CampaignStatus::Paused)
    }

    /// Re-attach loops for campaigns persisted as running (startup).
    pub fn resume_persisted(&self, state: &AppState) {
        for campaign in state.campaigns.list() {
            if campaign.status == CampaignStatus::Running {
                tracing::info!(campaign_id = %campaign.id, "resuming campaign loop");
                self.ensure_loop(state, campaign.id);
            }
        }
    }

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.running.lock().contains(id)
    }

    fn ensure_loop(&self, state: &AppState, id: Uuid) {
        {
            let mut running = self.running.lock();
            if !running.insert(id) {
                return;
            }
        }
        let state = state.clone();
        tokio::spawn(async move {
            run_campaign(state.clone(), id).await;
            state.campaign_runner.running.lock().remove(&id);
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_campaign(state: AppState, id: Uuid) {
    tracing::info!(campaign_id = %id, "campaign loop started");
    let mut events = state.registry.subscribe();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            ev = events.recv() => match ev {
                Ok(LifecycleEvent::CallEnded {
                    outcome,
                    answered,
                    origin: CallOrigin::Campaign { campaign_id, contact_id },
                    ..
                }) if campaign_id == id => {
                    on_contact_terminal(&state, id, contact_id, outcome, answered);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        let Some(campaign) = state.campaigns.get(&id) else {
            break;
        };
        match campaign.status {
            CampaignStatus::Running => {}
            CampaignStatus::Paused => continue,
            CampaignStatus::Pending | CampaignStatus::Completed => break,
        }

        let (pending, calling, completed, failed) = state.campaigns.counts(&id);
        if pending == 0 && calling == 0 {
            if state
                .campaigns
                .set_status(&id, CampaignStatus::Completed)
                .is_ok()
            {
                tracing::info!(
                    campaign_id = %id,
                    completed,
                    failed,
                    "campaign completed"
                );
            }
            break;
        }

        let slots = (campaign.max_concurrent as usize).saturating_sub(calling);
        if slots == 0 {
            continue;
        }

        let prompt = match state.launcher.resolve_prompt(campaign.prompt_id) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(campaign_id = %id, error = %e, "prompt resolution failed");
                continue;
            }
        };

        for contact in state.campaigns.claim_pending(&id, slots, Utc::now()) {
            let origin = CallOrigin::Campaign {
                campaign_id: id,
                contact_id: contact.id,
            };
            match state
                .dialer
                .dial(
                    &contact.phone_number,
                    prompt.clone(),
                    origin,
                    Some(campaign.max_concurrent),
                )
                .await
            {
                Ok(call_id) => state.campaigns.bind_call(&id, &contact.id, &call_id),
                Err(Error::Switch(e)) => {
                    // The pending session exists and was told to hang up;
                    // its CallEnded event settles the contact.
                    tracing::warn!(campaign_id = %id, error = %e, "origination rejected");
                }
                Err(e) => {
                    // No session was created (validation or admission):
                    // settle here, with retry spacing.
                    state.campaigns.contact_failed(
                        &id,
                        &contact.id,
                        &e.to_string(),
                        true,
                        Utc::now(),
                    );
                }
            }
        }
    }
    tracing::info!(campaign_id = %id, "campaign loop ended");
}

fn on_contact_terminal(
    state: &AppState,
    id: Uuid,
    contact_id: Uuid,
    outcome: CallOutcome,
    answered: bool,
) {
    match outcome {
        CallOutcome::Completed => state.campaigns.contact_succeeded(&id, &contact_id),
        // A call that never answered is a connect failure and retries;
        // a post-answer failure is terminal for the contact.
        CallOutcome::Failed => state.campaigns.contact_failed(
            &id,
            &contact_id,
            "call failed",
            !answered,
            Utc::now(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::build_state;

    #[tokio::test]
    async fn empty_campaign_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _control) = build_state(dir.path());
        let campaign = state.campaigns.create("vazia".into(), None, 2).unwrap();

        state.campaign_runner.start(&state, campaign.id).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if state.campaigns.get(&campaign.id).unwrap().status == CampaignStatus::Completed {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "campaign never completed"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_pause_conflicts_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let (state, control) = build_state(dir.path());
        let campaign = state.campaigns.create("c".into(), None, 2).unwrap();
        // Contacts keep the loop alive while we assert.
        state
            .campaigns
            .import_csv(&campaign.id, b"phone_number\nnot-a-number\n")
            .unwrap();

        // Pausing a campaign that is not running is a state conflict.
        let err = state.campaign_runner.pause(&state, campaign.id);
        assert!(matches!(err, Err(Error::Conflict(_))));

        state.campaign_runner.start(&state, campaign.id).unwrap();
        assert!(state.campaign_runner.is_running(&campaign.id));
        // Starting again neither errors nor doubles the loop.
        state.campaign_runner.start(&state, campaign.id).unwrap();

        state.campaign_runner.pause(&state, campaign.id).unwrap();
        assert_eq!(
            state.campaigns.get(&campaign.id).unwrap().status,
            CampaignStatus::Paused
        );
        // The invalid number never reached the switch.
        assert_eq!(
            control
                .originations
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
