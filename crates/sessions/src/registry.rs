//! Process-wide index of live sessions with concurrency accounting.
//!
//! Admission enforces two caps atomically: the global
//! `max_concurrent_calls` and, for campaign-originated calls, the
//! campaign's own `max_concurrent`. Sessions are owned here for their
//! whole lifetime; the media adapter only ever borrows a command sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use vox_domain::call::{CallDirection, CallOrigin, CallState, LifecycleEvent};
use vox_domain::error::{Error, Result};

use crate::events::SessionCommand;

const EVENT_BUS_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State cell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lock-free view of one session's FSM state. The FSM is the only writer.
#[derive(Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(state: CallState) -> Self {
        let cell = Self(Arc::new(AtomicU8::new(0)));
        cell.set(state);
        cell
    }

    pub fn set(&self, state: CallState) {
        self.0.store(encode(state), Ordering::Release);
    }

    pub fn get(&self) -> CallState {
        decode(self.0.load(Ordering::Acquire))
    }
}

fn encode(state: CallState) -> u8 {
    match state {
        CallState::Pending => 0,
        CallState::Greeting => 1,
        CallState::Listening => 2,
        CallState::Thinking => 3,
        CallState::Speaking => 4,
        CallState::HangingUp => 5,
        CallState::Ended => 6,
    }
}

fn decode(v: u8) -> CallState {
    match v {
        0 => CallState::Pending,
        1 => CallState::Greeting,
        2 => CallState::Listening,
        3 => CallState::Thinking,
        4 => CallState::Speaking,
        5 => CallState::HangingUp,
        _ => CallState::Ended,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entries & snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry-held handle to one live session.
#[derive(Clone)]
pub struct SessionEntry {
    pub call_id: String,
    pub direction: CallDirection,
    pub origin: CallOrigin,
    pub caller: String,
    pub called: String,
    pub created_at: DateTime<Utc>,
    pub commands: mpsc::Sender<SessionCommand>,
    pub state: StateCell,
}

/// Read-only description of a live session for the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub call_id: String,
    pub direction: CallDirection,
    pub caller: String,
    pub called: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

/// Lock-free-ish observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active: usize,
    pub max_concurrent: usize,
    pub by_state: HashMap<String, usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SessionEntry>>,
    max_concurrent: AtomicUsize,
    /// campaign_id → sessions currently live for it.
    campaign_live: parking_lot::Mutex<HashMap<Uuid, u32>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl SessionRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: RwLock::new(HashMap::new()),
            max_concurrent: AtomicUsize::new(max_concurrent.max(1)),
            campaign_live: parking_lot::Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to session lifecycle events (webhooks, dashboard, runners).
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Broadcast a lifecycle event. Lagging subscribers miss events; the
    /// dispatcher's own queue is what guarantees webhook ordering.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    /// Admit and insert a session, enforcing duplicate-id rejection, the
    /// global cap, and the per-campaign cap in one atomic step.
    ///
    /// `campaign_cap` carries the campaign's `max_concurrent` when the call
    /// was originated by a campaign runner.
    pub fn admit(&self, entry: SessionEntry, campaign_cap: Option<u32>) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.contains_key(&entry.call_id) {
            return Err(Error::Conflict(format!(
                "call {} already exists",
                entry.call_id
            )));
        }

        let max = self.max_concurrent.load(Ordering::Acquire);
        if inner.len() >= max {
            return Err(Error::Capacity(format!(
                "at max_concurrent_calls ({max})"
            )));
        }

        if let CallOrigin::Campaign { campaign_id, .. } = &entry.origin {
            let mut live = self.campaign_live.lock();
            let count = live.entry(*campaign_id).or_insert(0);
            let cap = campaign_cap.unwrap_or(u32::MAX);
            if *count >= cap {
                return Err(Error::Capacity(format!(
                    "campaign {campaign_id} at max_concurrent ({cap})"
                )));
            }
            *count += 1;
        }

        tracing::debug!(
            call_id = %entry.call_id,
            active = inner.len() + 1,
            "session admitted"
        );
        inner.insert(entry.call_id.clone(), entry);
        Ok(())
    }

    /// Remove a session (on `ENDED`), releasing its campaign slot.
    pub fn remove(&self, call_id: &str) -> Option<SessionEntry> {
        let entry = self.inner.write().remove(call_id)?;
        if let CallOrigin::Campaign { campaign_id, .. } = &entry.origin {
            let mut live = self.campaign_live.lock();
            if let Some(count) = live.get_mut(campaign_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    live.remove(campaign_id);
                }
            }
        }
        Some(entry)
    }

    pub fn get(&self, call_id: &str) -> Option<SessionEntry> {
        self.inner.read().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.inner.read().contains_key(call_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Sessions currently live for one campaign.
    pub fn campaign_live_count(&self, campaign_id: &Uuid) -> u32 {
        self.campaign_live
            .lock()
            .get(campaign_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.inner
            .read()
            .values()
            .map(|e| SessionInfo {
                call_id: e.call_id.clone(),
                direction: e.direction,
                caller: e.caller.clone(),
                called: e.called.clone(),
                state: e.state.get(),
                created_at: e.created_at,
            })
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        for entry in inner.values() {
            *by_state
                .entry(entry.state.get().as_str().to_owned())
                .or_insert(0) += 1;
        }
        RegistrySnapshot {
            active: inner.len(),
            max_concurrent: self.max_concurrent.load(Ordering::Acquire),
            by_state,
        }
    }

    /// Runtime-adjustable global cap (settings reload).
    pub fn set_max_concurrent(&self, max: usize) {
        self.max_concurrent.store(max.max(1), Ordering::Release);
    }

    /// Ask every live session to hang up (process drain). Teardown is
    /// asynchronous; callers poll `active_count` with a bound.
    pub async fn drain(&self) {
        let senders: Vec<_> = self
            .inner
            .read()
            .values()
            .map(|e| e.commands.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(SessionCommand::Hangup).await;
        }
    }
}
