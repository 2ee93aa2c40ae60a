//! Schedule runner: fires one-off scheduled calls at their appointed
//! time.
//!
//! A single loop queries due pending rows every 5 s, claims each into
//! `executing`, and dials. The bound call's terminal event settles the
//! row as completed or failed. Cancellation only wins while the row is
//! still pending — `mark_executing` is the atomic claim.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use vox_domain::call::{CallOrigin, CallOutcome, LifecycleEvent};
use vox_domain::error::Error;

use crate::state::AppState;

pub const TICK: Duration = Duration::from_secs(5);

/// Spawn the schedule loop. Runs for the process lifetime.
pub fn start(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    tracing::info!("schedule runner started");
    let mut events = state.registry.subscribe();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => fire_due(&state).await,
            ev = events.recv() => match ev {
                Ok(LifecycleEvent::CallEnded {
                    outcome,
                    origin: CallOrigin::Schedule { schedule_id },
                    ..
                }) => match outcome {
                    CallOutcome::Completed => state.schedules.mark_completed(&schedule_id),
                    CallOutcome::Failed => {
                        state.schedules.mark_failed(&schedule_id, "call failed")
                    }
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn fire_due(state: &AppState) {
    for schedule in state.schedules.due(Utc::now()) {
        // Atomic claim; loses cleanly to a concurrent cancel.
        if !state.schedules.mark_executing(&schedule.id) {
            continue;
        }
        tracing::info!(
            schedule_id = %schedule.id,
            number = %schedule.phone_number,
            "firing scheduled call"
        );

        let prompt = match state.launcher.resolve_prompt(schedule.prompt_id) {
            Ok(p) => p,
            Err(e) => {
                state
                    .schedules
                    .mark_failed(&schedule.id, &format!("prompt: {e}"));
                continue;
            }
        };

        let origin = CallOrigin::Schedule {
            schedule_id: schedule.id,
        };
        match state
            .dialer
            .dial(&schedule.phone_number, prompt, origin, None)
            .await
        {
            Ok(call_id) => state.schedules.set_call(&schedule.id, &call_id),
            Err(Error::Switch(e)) => {
                // Session exists; its CallEnded event settles the row.
                tracing::warn!(schedule_id = %schedule.id, error = %e, "origination rejected");
            }
            Err(e) => {
                // Admission denied or invalid number: schedules do not
                // requeue, they fail.
                state.schedules.mark_failed(&schedule.id, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::build_state;
    use chrono::Duration as ChronoDuration;
    use vox_domain::schedule::ScheduleStatus;

    #[tokio::test]
    async fn due_schedule_fires_within_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (state, control) = build_state(dir.path());
        let schedule = state
            .schedules
            .create(
                "+5511999990000".into(),
                Utc::now() - ChronoDuration::seconds(1),
                None,
            )
            .unwrap();

        start(state.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = state.schedules.get(&schedule.id).unwrap().status;
            if status == ScheduleStatus::Executing {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "schedule never fired, status {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            control
                .originations
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(state.schedules.get(&schedule.id).unwrap().call_id.is_some());
    }

    #[tokio::test]
    async fn cancelled_schedule_never_originates() {
        let dir = tempfile::tempdir().unwrap();
        let (state, control) = build_state(dir.path());
        let schedule = state
            .schedules
            .create(
                "+5511999990000".into(),
                Utc::now() + ChronoDuration::seconds(60),
                None,
            )
            .unwrap();

        start(state.clone());
        state.schedules.cancel(&schedule.id).unwrap();

        // Give the runner a beat; the cancelled row must stay untouched.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            state.schedules.get(&schedule.id).unwrap().status,
            ScheduleStatus::Cancelled
        );
        assert_eq!(
            control
                .originations
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
