pub mod campaigns;
pub mod schedules;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::sync::Arc;

    use vox_domain::config::Config;
    use vox_domain::error::Result;
    use vox_sessions::{GreetingCache, SessionRegistry};
    use vox_store::{
        CallStore, CampaignStore, PromptStore, ScheduleStore, SettingsStore, WebhookStore,
    };

    use crate::dialer::Dialer;
    use crate::engine::SessionLauncher;
    use crate::runtime::campaigns::CampaignSupervisor;
    use crate::runtime::webhooks::WebhookDispatcher;
    use crate::state::AppState;
    use crate::switch::SwitchControl;

    /// Switch stub that accepts every command and counts originations.
    #[derive(Default)]
    pub struct RecordingControl {
        pub originations: AtomicU32,
    }

    #[async_trait::async_trait]
    impl SwitchControl for RecordingControl {
        async fn originate(&self, _number: &str, _call_id: &str) -> Result<()> {
            self.originations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn hangup(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }
    }

    pub fn build_state(dir: &std::path::Path) -> (AppState, Arc<RecordingControl>) {
        let mut config = Config::default();
        config.storage.state_path = dir.to_path_buf();
        let config = Arc::new(config);

        let registry = Arc::new(SessionRegistry::new(config.engine.max_concurrent_calls));
        let calls = Arc::new(CallStore::new(dir).unwrap());
        let prompts = Arc::new(PromptStore::new(dir).unwrap());
        let campaigns = Arc::new(CampaignStore::new(dir).unwrap());
        let schedules = Arc::new(ScheduleStore::new(dir).unwrap());
        let webhooks = Arc::new(WebhookStore::new(dir, 100).unwrap());
        let settings = Arc::new(SettingsStore::new(dir).unwrap());
        let greetings = Arc::new(GreetingCache::new());

        let launcher = Arc::new(
            SessionLauncher::new(
                config.clone(),
                registry.clone(),
                calls.clone(),
                settings.clone(),
                prompts.clone(),
                greetings.clone(),
            )
            .unwrap(),
        );
        let control = Arc::new(RecordingControl::default());
        let dialer = Arc::new(Dialer::new(
            control.clone(),
            launcher.clone(),
            registry.clone(),
        ));
        let dispatcher = Arc::new(WebhookDispatcher::new(webhooks.clone()));

        let state = AppState {
            config,
            registry,
            launcher,
            dialer,
            calls,
            prompts,
            campaigns,
            schedules,
            webhooks,
            settings,
            greetings,
            campaign_runner: Arc::new(CampaignSupervisor::new()),
            dispatcher,
            api_token_hash: None,
            unknown_frames: Arc::new(AtomicU64::new(0)),
        };
        (state, control)
    }
}
