//! End-to-end FSM scenarios driven by scripted providers and an in-memory
//! switch link: the inbound happy path and barge-in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use vox_domain::call::{
    CallDirection, CallOrigin, CallOutcome, CallRecord, CallState, LifecycleEvent,
    PromptSnapshot, TranscriptEntry, TranscriptRole,
};
use vox_domain::config::EngineConfig;
use vox_domain::error::Result;
use vox_domain::stream::{LlmEvent, SttEvent, TtsEvent};
use vox_providers::traits::{
    LlmProvider, LlmStream, SttProvider, SttSession, TtsProvider, TtsStream,
};
use vox_sessions::events::{SessionCommand, SwitchInbound, SwitchLink};
use vox_sessions::fsm::{spawn_session, SessionCtx};
use vox_sessions::journal::CallJournal;
use vox_sessions::outbox::FramePoll;
use vox_sessions::{GreetingCache, SessionRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// STT whose event stream is driven directly by the test.
struct ScriptedStt {
    sessions: Mutex<VecDeque<mpsc::Receiver<SttEvent>>>,
}

impl ScriptedStt {
    fn single() -> (Arc<Self>, mpsc::Sender<SttEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let mut sessions = VecDeque::new();
        sessions.push_back(rx);
        (
            Arc::new(Self {
                sessions: Mutex::new(sessions),
            }),
            tx,
        )
    }
}

#[async_trait::async_trait]
impl SttProvider for ScriptedStt {
    async fn open(&self) -> Result<SttSession> {
        let events = self
            .sessions
            .lock()
            .pop_front()
            .expect("stt opened more than scripted");
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        Ok(SttSession {
            audio: audio_tx,
            events,
            cancel: CancellationToken::new(),
        })
    }
}

/// LLM serving prepared scripts, one per `stream()` call. A script with
/// `hold_open` keeps the stream alive after its events (for barge-in).
struct ScriptedLlm {
    scripts: Mutex<VecDeque<(Vec<LlmEvent>, bool)>>,
}

impl ScriptedLlm {
    fn new(scripts: Vec<(Vec<LlmEvent>, bool)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream(&self, _req: vox_domain::stream::ChatRequest) -> Result<LlmStream> {
        let (events, hold_open) = self
            .scripts
            .lock()
            .pop_front()
            .expect("llm called more than scripted");
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for ev in events {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
            if hold_open {
                // Keep the sender alive; the FSM must cancel us.
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
        });
        Ok(LlmStream {
            events: rx,
            cancel: CancellationToken::new(),
        })
    }
}

/// TTS emitting one 320-byte frame per input character; `Done` when the
/// text channel closes.
struct FrameTts;

#[async_trait::async_trait]
impl TtsProvider for FrameTts {
    async fn synthesize(&self, _voice_id: &str) -> Result<TtsStream> {
        let (text_tx, mut text_rx) = mpsc::channel::<String>(64);
        let (ev_tx, ev_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = token.cancelled() => return,
                    t = text_rx.recv() => t,
                };
                match text {
                    Some(text) => {
                        for _ in 0..text.chars().count() {
                            if token.is_cancelled() {
                                return;
                            }
                            if ev_tx
                                .send(TtsEvent::Frame {
                                    pcm: vec![0u8; 320],
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    None => {
                        let _ = ev_tx.send(TtsEvent::Done).await;
                        return;
                    }
                }
            }
        });
        Ok(TtsStream {
            text: text_tx,
            events: ev_rx,
            cancel,
        })
    }
}

/// Journal capturing commits in memory.
#[derive(Default)]
struct MemJournal {
    messages: Mutex<Vec<TranscriptEntry>>,
    finalized: Mutex<Option<CallOutcome>>,
}

#[async_trait::async_trait]
impl CallJournal for MemJournal {
    async fn insert_call(&self, _record: CallRecord) -> Result<()> {
        Ok(())
    }
    async fn append_message(&self, _call_id: &str, entry: TranscriptEntry) -> Result<()> {
        self.messages.lock().push(entry);
        Ok(())
    }
    async fn mark_answered(&self, _call_id: &str, _at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        Ok(())
    }
    async fn set_switch_uuid(&self, _call_id: &str, _switch_uuid: String) -> Result<()> {
        Ok(())
    }
    async fn finalize_call(
        &self,
        _call_id: &str,
        outcome: CallOutcome,
        _ended: chrono::DateTime<chrono::Utc>,
        _duration_ms: u64,
    ) -> Result<()> {
        *self.finalized.lock() = Some(outcome);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    registry: Arc<SessionRegistry>,
    journal: Arc<MemJournal>,
    events: broadcast::Receiver<LifecycleEvent>,
    stt_tx: mpsc::Sender<SttEvent>,
    in_tx: mpsc::Sender<SwitchInbound>,
    delivered: Arc<AtomicU64>,
}

fn engine_cfg() -> EngineConfig {
    EngineConfig {
        teardown_drain_secs: 0,
        ..EngineConfig::default()
    }
}

async fn start_call(
    greeting: Option<&str>,
    llm: Arc<ScriptedLlm>,
) -> Harness {
    let registry = Arc::new(SessionRegistry::new(10));
    let journal = Arc::new(MemJournal::default());
    let (stt, stt_tx) = ScriptedStt::single();
    let events = registry.subscribe();

    let ctx = SessionCtx {
        call_id: "call-1".into(),
        direction: CallDirection::Inbound,
        origin: CallOrigin::Switch,
        caller: "+5511988887777".into(),
        called: "+5511200001000".into(),
        prompt: PromptSnapshot {
            system_text: "Você é um atendente simpático.".into(),
            voice_id: "luna".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            greeting: greeting.map(String::from),
        },
        cfg: engine_cfg(),
        stt,
        llm,
        tts: Arc::new(FrameTts),
        journal: journal.clone(),
        greetings: Arc::new(GreetingCache::new()),
    };
    spawn_session(ctx, registry.clone(), None).expect("admission");

    // Attach the in-memory switch link.
    let (in_tx, in_rx) = mpsc::channel(64);
    let (ready_tx, ready_rx) = oneshot::channel();
    let commands = registry.get("call-1").expect("registered").commands;
    commands
        .send(SessionCommand::Attach(SwitchLink {
            inbound: in_rx,
            ready: ready_tx,
        }))
        .await
        .expect("attach");
    let mut driver = ready_rx.await.expect("driver");

    // Unpaced frame pump standing in for the media writer.
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    tokio::spawn(async move {
        loop {
            match driver.try_next() {
                FramePoll::Frame(_) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                FramePoll::Empty => tokio::time::sleep(Duration::from_millis(2)).await,
                FramePoll::Closed => return,
            }
        }
    });

    Harness {
        registry,
        journal,
        events,
        stt_tx,
        in_tx,
        delivered,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(ev)) => return ev,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => panic!("timed out waiting for lifecycle event"),
        }
    }
}

/// Wait for a state-changed event into `to`.
async fn wait_for_state(rx: &mut broadcast::Receiver<LifecycleEvent>, to: CallState) {
    loop {
        if let LifecycleEvent::CallStateChanged { to: t, .. } = next_event(rx).await {
            if t == to {
                return;
            }
        }
    }
}

async fn wait_for_ended(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    loop {
        let ev = next_event(rx).await;
        if matches!(ev, LifecycleEvent::CallEnded { .. }) {
            return ev;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn inbound_happy_path_commits_alternating_transcript() {
    let llm = ScriptedLlm::new(vec![(
        vec![
            LlmEvent::Delta {
                text: "Tudo ótimo".into(),
            },
            LlmEvent::Delta {
                text: " por aqui!".into(),
            },
            LlmEvent::Done {
                full_text: "Tudo ótimo por aqui!".into(),
            },
        ],
        false,
    )]);
    let mut h = start_call(Some("Olá, em que posso ajudar?"), llm).await;

    // call.started precedes every state change.
    let first = next_event(&mut h.events).await;
    assert_eq!(first.name(), "call.started");

    // Greeting plays, then the session listens.
    wait_for_state(&mut h.events, CallState::Listening).await;

    // Caller speaks; endpointing fires.
    h.stt_tx
        .send(SttEvent::Final {
            text: "oi tudo bem".into(),
            ts: chrono::Utc::now(),
            duration_ms: 2_000,
        })
        .await
        .unwrap();
    h.stt_tx.send(SttEvent::UtteranceEnd).await.unwrap();

    wait_for_state(&mut h.events, CallState::Thinking).await;
    wait_for_state(&mut h.events, CallState::Speaking).await;
    wait_for_state(&mut h.events, CallState::Listening).await;

    // Switch announces hangup in-band.
    h.in_tx.send(SwitchInbound::Hangup).await.unwrap();

    let ended = wait_for_ended(&mut h.events).await;
    let LifecycleEvent::CallEnded {
        outcome,
        answered,
        transcript,
        ..
    } = ended
    else {
        unreachable!()
    };
    assert_eq!(outcome, CallOutcome::Completed);
    assert!(answered);

    let roles: Vec<TranscriptRole> = transcript.iter().map(|e| e.role).collect();
    assert_eq!(
        roles,
        vec![
            TranscriptRole::Assistant,
            TranscriptRole::User,
            TranscriptRole::Assistant
        ]
    );
    assert_eq!(transcript[0].content, "Olá, em que posso ajudar?");
    assert_eq!(transcript[1].content, "oi tudo bem");
    assert_eq!(transcript[2].content, "Tudo ótimo por aqui!");

    // Journal saw the same commits, in order.
    let messages = h.journal.messages.lock();
    assert_eq!(messages.len(), 3);
    assert_eq!(*h.journal.finalized.lock(), Some(CallOutcome::Completed));

    // Registry slot released.
    assert_eq!(h.registry.active_count(), 0);

    // Greeting frames actually went out (one per character).
    assert!(h.delivered.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn barge_in_cancels_reply_and_truncates_commit() {
    let reply = "o seu pedido já saiu para entrega e deve chegar amanhã";
    let llm = ScriptedLlm::new(vec![
        // First turn: a delta, then the stream stays open — the user will
        // interrupt before the model finishes.
        (
            vec![LlmEvent::Delta {
                text: reply.into(),
            }],
            true,
        ),
        // Second turn after the barge-in.
        (
            vec![
                LlmEvent::Delta {
                    text: "Claro.".into(),
                },
                LlmEvent::Done {
                    full_text: "Claro.".into(),
                },
            ],
            false,
        ),
    ]);
    // No greeting: session goes straight to listening.
    let mut h = start_call(None, llm).await;

    wait_for_state(&mut h.events, CallState::Listening).await;

    h.stt_tx
        .send(SttEvent::Final {
            text: "oi".into(),
            ts: chrono::Utc::now(),
            duration_ms: 600,
        })
        .await
        .unwrap();
    h.stt_tx.send(SttEvent::UtteranceEnd).await.unwrap();
    wait_for_state(&mut h.events, CallState::Speaking).await;

    // Let some audio reach the switch before interrupting.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.delivered.load(Ordering::SeqCst) < 5 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no frames delivered"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // User starts talking over the assistant.
    h.stt_tx
        .send(SttEvent::Interim {
            text: "na verdade".into(),
            ts: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // Barge-in returns to listening without waiting for synthesis.
    wait_for_state(&mut h.events, CallState::Listening).await;

    // The new utterance completes and re-enters the turn loop.
    h.stt_tx
        .send(SttEvent::Final {
            text: "na verdade quero outra coisa".into(),
            ts: chrono::Utc::now(),
            duration_ms: 1_500,
        })
        .await
        .unwrap();
    h.stt_tx.send(SttEvent::UtteranceEnd).await.unwrap();
    wait_for_state(&mut h.events, CallState::Thinking).await;
    wait_for_state(&mut h.events, CallState::Speaking).await;
    wait_for_state(&mut h.events, CallState::Listening).await;

    h.in_tx.send(SwitchInbound::Hangup).await.unwrap();
    let ended = wait_for_ended(&mut h.events).await;
    let LifecycleEvent::CallEnded { transcript, .. } = ended else {
        unreachable!()
    };

    // [user "oi", assistant <truncated>, user ..., assistant "Claro."]
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[0].role, TranscriptRole::User);
    assert_eq!(transcript[1].role, TranscriptRole::Assistant);
    assert_eq!(transcript[3].content, "Claro.");

    let truncated = &transcript[1].content;
    assert!(!truncated.is_empty(), "some text was delivered");
    assert!(
        truncated.chars().count() < reply.chars().count(),
        "entry must be truncated, got {truncated:?}"
    );
    assert!(reply.starts_with(truncated.as_str()));
}

#[tokio::test]
async fn duplicate_call_id_is_rejected_without_touching_original() {
    let llm = ScriptedLlm::new(vec![]);
    let h = start_call(None, llm).await;

    let (stt2, _tx2) = ScriptedStt::single();
    let ctx = SessionCtx {
        call_id: "call-1".into(),
        direction: CallDirection::Outbound,
        origin: CallOrigin::Operator,
        caller: "a".into(),
        called: "b".into(),
        prompt: PromptSnapshot {
            system_text: String::new(),
            voice_id: "luna".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            greeting: None,
        },
        cfg: engine_cfg(),
        stt: stt2,
        llm: ScriptedLlm::new(vec![]),
        tts: Arc::new(FrameTts),
        journal: Arc::new(MemJournal::default()),
        greetings: Arc::new(GreetingCache::new()),
    };
    let err = spawn_session(ctx, h.registry.clone(), None);
    assert!(matches!(err, Err(vox_domain::error::Error::Conflict(_))));
    assert!(h.registry.contains("call-1"));
}
