use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use vox_domain::config::{Config, ConfigSeverity};
use vox_gateway::api;
use vox_gateway::cli::{config_cmd, load_config, Cli, Command, ConfigCommand};
use vox_gateway::dialer::Dialer;
use vox_gateway::engine::{apply_settings, SessionLauncher};
use vox_gateway::runtime::campaigns::CampaignSupervisor;
use vox_gateway::runtime::schedules as schedule_runner;
use vox_gateway::runtime::webhooks::WebhookDispatcher;
use vox_gateway::state::AppState;
use vox_gateway::switch::HttpSwitchControl;
use vox_sessions::{GreetingCache, SessionRegistry};
use vox_store::{
    CallStore, CampaignStore, PromptStore, ScheduleStore, SettingsStore, WebhookStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            if !config_cmd::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli.config)?;
            config_cmd::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("voxline {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vox_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("voxline starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let state_path = config.storage.state_path.clone();

    // ── Stores ───────────────────────────────────────────────────────
    let calls = Arc::new(CallStore::new(&state_path).context("initializing call store")?);
    let prompts =
        Arc::new(PromptStore::new(&state_path).context("initializing prompt store")?);
    let campaigns =
        Arc::new(CampaignStore::new(&state_path).context("initializing campaign store")?);
    let schedules =
        Arc::new(ScheduleStore::new(&state_path).context("initializing schedule store")?);
    let webhooks = Arc::new(
        WebhookStore::new(&state_path, config.storage.delivery_log_cap)
            .context("initializing webhook store")?,
    );
    let settings =
        Arc::new(SettingsStore::new(&state_path).context("initializing settings store")?);
    tracing::info!(path = %state_path.display(), "stores ready");

    // ── Session registry ─────────────────────────────────────────────
    let max_calls = settings
        .max_concurrent_calls()
        .unwrap_or(config.engine.max_concurrent_calls);
    let registry = Arc::new(SessionRegistry::new(max_calls));
    tracing::info!(max_concurrent_calls = max_calls, "session registry ready");

    // ── Greeting cache + session launcher ────────────────────────────
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
        .context("initializing session launcher")?,
    );
    tracing::info!("session launcher ready");

    // ── Switch control + dialer ──────────────────────────────────────
    let control = Arc::new(
        HttpSwitchControl::new(&config.switch).context("initializing switch control")?,
    );
    let dialer = Arc::new(Dialer::new(control, launcher.clone(), registry.clone()));
    tracing::info!(control_url = %config.switch.control_url, "dialer ready");

    // ── Webhook dispatcher ───────────────────────────────────────────
    let dispatcher = Arc::new(WebhookDispatcher::new(webhooks.clone()));
    dispatcher.clone().run(registry.subscribe());
    tracing::info!("webhook dispatcher started");

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var) {
            Ok(token) if !token.is_empty() => {
                tracing::info!(env_var = %env_var, "API bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    env_var = %env_var,
                    "API bearer-token auth DISABLED — set {env_var} to enable"
                );
                None
            }
        }
    };

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        launcher: launcher.clone(),
        dialer,
        calls: calls.clone(),
        prompts: prompts.clone(),
        campaigns,
        schedules,
        webhooks,
        settings: settings.clone(),
        greetings,
        campaign_runner: Arc::new(CampaignSupervisor::new()),
        dispatcher,
        api_token_hash,
        unknown_frames: Arc::new(AtomicU64::new(0)),
    };

    // Apply runtime-adjustable settings once everything exists.
    apply_settings(&settings, &registry, &launcher);

    // ── Schedule runner (5s tick) ────────────────────────────────────
    schedule_runner::start(state.clone());
    tracing::info!("schedule runner started (5s tick)");

    // ── Resume campaigns persisted as running ────────────────────────
    state.campaign_runner.resume_persisted(&state);

    // ── Warm greeting cache for the active prompt ────────────────────
    {
        let state_for_warm = state.clone();
        tokio::spawn(async move {
            if let Some(active) = state_for_warm.prompts.active() {
                match state_for_warm.launcher.presynthesize_greeting(&active).await {
                    Ok(duration_ms) if duration_ms > 0 => {
                        state_for_warm
                            .prompts
                            .set_greeting_duration(&active.id, duration_ms);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "greeting warm-up failed");
                    }
                }
            }
        });
    }

    // ── Periodic call-store flush ────────────────────────────────────
    {
        let calls = calls.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                calls.flush_if_dirty();
            }
        });
    }

    // ── HTTP middleware ──────────────────────────────────────────────
    let max_concurrent_requests = std::env::var("VOX_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    // Optional per-IP throttle on the control surface. The bounds were
    // checked by config validation above.
    let throttle = config.server.rate_limit.as_ref().map(|limits| {
        let quota = tower_governor::governor::GovernorConfigBuilder::default()
            .per_second(limits.requests_per_second)
            .burst_size(limits.burst_size)
            .finish()
            .expect("validated rate-limit bounds");
        tracing::info!(
            per_second = limits.requests_per_second,
            burst = limits.burst_size,
            "per-IP throttle enabled"
        );
        tower_governor::GovernorLayer {
            config: Arc::new(quota),
        }
    });

    // ── Router ───────────────────────────────────────────────────────
    let routes = api::router(state.clone())
        .layer(api::cors::layer(&config.server.cors))
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            max_concurrent_requests,
        ));
    let app = match throttle {
        Some(layer) => routes.layer(layer).with_state(state.clone()),
        None => routes.with_state(state.clone()),
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "voxline listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // ── Drain: ask every live session to hang up, bounded ────────────
    tracing::info!(active = registry.active_count(), "draining sessions");
    registry.drain().await;
    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while registry.active_count() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    calls.flush_if_dirty();
    tracing::info!("voxline stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
