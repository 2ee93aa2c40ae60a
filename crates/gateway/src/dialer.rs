//! Outbound call origination.
//!
//! The dialer admits a pending session first (so the media socket has
//! something to bind to the moment the switch answers), then issues the
//! origination command. A rejected command tears the pending session
//! down and surfaces the error to the caller — campaigns retry per their
//! policy, schedules fail.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use vox_domain::call::{CallOrigin, PromptSnapshot};
use vox_domain::error::{Error, Result};
use vox_sessions::{SessionCommand, SessionRegistry};

use crate::engine::SessionLauncher;
use crate::switch::SwitchControl;

pub struct Dialer {
    control: Arc<dyn SwitchControl>,
    launcher: Arc<SessionLauncher>,
    registry: Arc<SessionRegistry>,
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+?[0-9]{8,15}$").expect("static pattern"))
}

pub fn valid_number(number: &str) -> bool {
    number_pattern().is_match(number)
}

impl Dialer {
    pub fn new(
        control: Arc<dyn SwitchControl>,
        launcher: Arc<SessionLauncher>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            control,
            launcher,
            registry,
        }
    }

    /// Originate an outbound call. Returns the new `call_id` once the
    /// switch accepts the command; the session itself completes the
    /// `PENDING → GREETING` transition when media attaches.
    pub async fn dial(
        &self,
        number: &str,
        prompt: PromptSnapshot,
        origin: CallOrigin,
        campaign_cap: Option<u32>,
    ) -> Result<String> {
        if !valid_number(number) {
            return Err(Error::Other(format!("invalid phone number {number:?}")));
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        self.launcher
            .start_outbound(&call_id, number, prompt, origin, campaign_cap)?;

        match self.control.originate(number, &call_id).await {
            Ok(()) => Ok(call_id),
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "origination rejected");
                if let Some(entry) = self.registry.get(&call_id) {
                    let _ = entry.commands.send(SessionCommand::Hangup).await;
                }
                Err(e)
            }
        }
    }

    /// Hang up a live call: the FSM transitions synchronously, teardown
    /// is asynchronous but bounded.
    pub async fn hangup(&self, call_id: &str) -> Result<()> {
        let entry = self
            .registry
            .get(call_id)
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))?;
        entry
            .commands
            .send(SessionCommand::Hangup)
            .await
            .map_err(|_| Error::Other(format!("call {call_id} is already tearing down")))?;
        // Best effort on the switch leg; the session's disconnect handling
        // covers a switch that never saw this.
        if let Err(e) = self.control.hangup(call_id).await {
            tracing::debug!(call_id = %call_id, error = %e, "switch hangup command failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_validation() {
        assert!(valid_number("+5511999990000"));
        assert!(valid_number("08001234567"));
        assert!(!valid_number("911"));
        assert!(!valid_number("+55 11 99999"));
        assert!(!valid_number("ligue-ja"));
        assert!(!valid_number(""));
    }
}
