//! The per-call state machine.
//!
//! One task per call. All event sources — switch media, STT, LLM, TTS,
//! control commands, timers — fan into a single `select!` loop, and this
//! loop is the only mutator of session state. Provider I/O runs in
//! side tasks bridged by bounded channels so the loop never blocks on the
//! network.
//!
//! States: `PENDING → GREETING → LISTENING ⇄ THINKING → SPEAKING →
//! LISTENING …`, any state → `HANGING_UP → ENDED`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vox_domain::audio::{self, FRAME_MS};
use vox_domain::call::{
    CallDirection, CallOrigin, CallOutcome, CallRecord, CallState, LifecycleEvent,
    PromptSnapshot,
};
use vox_domain::config::EngineConfig;
use vox_domain::error::Result;
use vox_domain::stream::{ChatRequest, LlmEvent, SttEvent, TtsEvent};
use vox_providers::traits::TtsStream;
use vox_providers::{LlmProvider, SttProvider, SttSession, TtsProvider};

use crate::events::{SessionCommand, SwitchInbound, SwitchLink};
use crate::greeting::GreetingCache;
use crate::journal::CallJournal;
use crate::outbox::{outbox, AudioOut, OUTBOX_FRAMES};
use crate::registry::{SessionEntry, SessionRegistry, StateCell};
use crate::transcript::{truncate_spoken, Transcript};

const COMMAND_BUFFER: usize = 8;
const LLM_EVENT_BUFFER: usize = 64;
const SPEAK_EVENT_BUFFER: usize = 8;

/// Window within which a second failure of the same provider is fatal.
const REPEAT_FAILURE_WINDOW: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context & spawning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a session needs, captured at admission. The prompt snapshot
/// is immutable for the life of the call.
pub struct SessionCtx {
    pub call_id: String,
    pub direction: CallDirection,
    pub origin: CallOrigin,
    pub caller: String,
    pub called: String,
    pub prompt: PromptSnapshot,
    pub cfg: EngineConfig,
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub journal: Arc<dyn CallJournal>,
    pub greetings: Arc<GreetingCache>,
}

/// Admit a session into the registry and spawn its task.
///
/// `campaign_cap` carries the campaign's `max_concurrent` for
/// campaign-originated calls. Fails synchronously on duplicate `call_id`
/// or when an admission cap is hit; nothing is spawned in that case.
pub fn spawn_session(
    ctx: SessionCtx,
    registry: Arc<SessionRegistry>,
    campaign_cap: Option<u32>,
) -> Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let state_cell = StateCell::new(CallState::Pending);
    let entry = SessionEntry {
        call_id: ctx.call_id.clone(),
        direction: ctx.direction,
        origin: ctx.origin.clone(),
        caller: ctx.caller.clone(),
        called: ctx.called.clone(),
        created_at: Utc::now(),
        commands: cmd_tx,
        state: state_cell.clone(),
    };
    registry.admit(entry, campaign_cap)?;

    let session = Session::new(ctx, registry, state_cell);
    tokio::spawn(session.run(cmd_rx));
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Internal types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, PartialEq)]
enum SpeakSource {
    Greeting,
    Reply,
    /// Canned apology/farewell; spoken but not committed to the transcript.
    Phrase,
}

enum SpeakEvent {
    First,
    Done { queued_frames: u64 },
    Error(String),
}

/// One assistant utterance in flight: the synthesis stream (or cached
/// playback), the text planned so far, and delivery accounting.
struct Speaking {
    source: SpeakSource,
    planned: String,
    text: Option<mpsc::Sender<String>>,
    cancel: Option<CancellationToken>,
    notify: mpsc::Receiver<SpeakEvent>,
    started: Instant,
    first_frame: bool,
    warned_slow: bool,
    delivered_start: u64,
}

/// One chat completion in flight. The side task owns the provider stream;
/// cancelling the token aborts it at the next token boundary.
struct LlmHandle {
    events: mpsc::Receiver<LlmEvent>,
    cancel: CancellationToken,
    got_delta: bool,
    started: Instant,
}

#[derive(Clone, Copy)]
enum ProviderKind {
    Stt,
    Llm,
    Tts,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Session {
    ctx: SessionCtx,
    registry: Arc<SessionRegistry>,
    state: CallState,
    state_cell: StateCell,
    transcript: Transcript,

    switch_rx: Option<mpsc::Receiver<SwitchInbound>>,
    audio_out: Option<AudioOut>,

    stt: Option<SttSession>,
    llm: Option<LlmHandle>,
    speaking: Option<Speaking>,

    pending_finals: Vec<String>,
    pending_user_ms: u64,

    last_audio: Instant,
    last_stt_failure: Option<Instant>,
    last_llm_failure: Option<Instant>,
    last_tts_failure: Option<Instant>,
    stt_dropped_frames: u64,

    fatal: Option<String>,
    reached_listening: bool,
    hangup_after_speak: bool,
    started_emitted: bool,
    answered: bool,
    answered_at: Option<chrono::DateTime<Utc>>,
    created_at: chrono::DateTime<Utc>,
}

impl Session {
    fn new(ctx: SessionCtx, registry: Arc<SessionRegistry>, state_cell: StateCell) -> Self {
        Self {
            ctx,
            registry,
            state: CallState::Pending,
            state_cell,
            transcript: Transcript::new(),
            switch_rx: None,
            audio_out: None,
            stt: None,
            llm: None,
            speaking: None,
            pending_finals: Vec::new(),
            pending_user_ms: 0,
            last_audio: Instant::now(),
            last_stt_failure: None,
            last_llm_failure: None,
            last_tts_failure: None,
            stt_dropped_frames: 0,
            fatal: None,
            reached_listening: false,
            hangup_after_speak: false,
            started_emitted: false,
            answered: false,
            answered_at: None,
            created_at: Utc::now(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let record = CallRecord {
            call_id: self.ctx.call_id.clone(),
            switch_uuid: None,
            caller: self.ctx.caller.clone(),
            called: self.ctx.called.clone(),
            direction: self.ctx.direction,
            origin: self.ctx.origin.clone(),
            prompt: self.ctx.prompt.clone(),
            state: CallState::Pending,
            outcome: None,
            created: self.created_at,
            answered: None,
            ended: None,
            duration_ms: 0,
            transcript: Vec::new(),
        };
        if let Err(e) = self.ctx.journal.insert_call(record).await {
            tracing::warn!(
                call_id = %self.ctx.call_id,
                error = %e,
                "insert_call failed; session continues in memory"
            );
        }

        if !self.wait_for_attach(&mut commands).await {
            return self.finish().await;
        }

        // One recognition stream serves the whole call.
        match self.open_stt().await {
            Some(stt) => self.stt = Some(stt),
            None => return self.finish().await,
        }

        self.answered = true;
        let answered_at = Utc::now();
        self.answered_at = Some(answered_at);
        if let Err(e) = self
            .ctx
            .journal
            .mark_answered(&self.ctx.call_id, answered_at)
            .await
        {
            tracing::warn!(call_id = %self.ctx.call_id, error = %e, "mark_answered failed");
        }
        self.last_audio = Instant::now();
        self.emit_started();

        let greeting = self
            .ctx
            .prompt
            .greeting
            .clone()
            .filter(|g| !g.trim().is_empty());
        match greeting {
            Some(text) => {
                self.set_state(CallState::Greeting);
                if let Err(message) = self.speak(text, SpeakSource::Greeting).await {
                    self.handle_tts_error(message).await;
                }
            }
            None => self.enter_listening(),
        }

        while self.state != CallState::HangingUp {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = commands.recv() => self.on_command(cmd).await,
                inbound = recv_switch(&mut self.switch_rx) => self.on_switch(inbound).await,
                ev = recv_stt(&mut self.stt) => self.on_stt(ev).await,
                ev = recv_llm(&mut self.llm) => self.on_llm(ev).await,
                ev = recv_speak(&mut self.speaking) => self.on_speak(ev).await,
                _ = tokio::time::sleep_until(deadline) => self.on_deadline().await,
            }
        }

        self.finish().await
    }

    // ── Attachment ───────────────────────────────────────────────────

    async fn wait_for_attach(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> bool {
        let deadline =
            Instant::now() + Duration::from_secs(self.ctx.cfg.connect_timeout_secs);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                self.fatal = Some("switch did not connect before timeout".into());
                false
            }
            cmd = commands.recv() => match cmd {
                Some(SessionCommand::Attach(link)) => {
                    self.attach(link);
                    true
                }
                Some(SessionCommand::Hangup) | None => false,
            }
        }
    }

    fn attach(&mut self, link: SwitchLink) {
        let (out, driver) = outbox(OUTBOX_FRAMES);
        self.switch_rx = Some(link.inbound);
        self.audio_out = Some(out);
        let _ = link.ready.send(driver);
        tracing::info!(call_id = %self.ctx.call_id, "switch media attached");
    }

    async fn open_stt(&mut self) -> Option<SttSession> {
        match self.ctx.stt.open().await {
            Ok(s) => Some(s),
            Err(first) => {
                tracing::warn!(
                    call_id = %self.ctx.call_id,
                    error = %first,
                    "stt open failed, retrying once"
                );
                match self.ctx.stt.open().await {
                    Ok(s) => Some(s),
                    Err(second) => {
                        self.fatal = Some(format!("stt open: {second}"));
                        None
                    }
                }
            }
        }
    }

    // ── Event handlers ───────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Option<SessionCommand>) {
        match cmd {
            Some(SessionCommand::Hangup) | None => {
                tracing::info!(call_id = %self.ctx.call_id, "hangup requested");
                self.begin_hangup(None);
            }
            Some(SessionCommand::Attach(_)) => {
                tracing::warn!(call_id = %self.ctx.call_id, "duplicate switch attach ignored");
            }
        }
    }

    async fn on_switch(&mut self, inbound: Option<SwitchInbound>) {
        match inbound {
            Some(SwitchInbound::Audio(frame)) => {
                if audio::frame_has_speech(&frame) {
                    self.last_audio = Instant::now();
                }
                if let Some(stt) = &self.stt {
                    if stt.audio.try_send(frame).is_err() {
                        self.stt_dropped_frames += 1;
                        if self.stt_dropped_frames % 250 == 1 {
                            tracing::warn!(
                                call_id = %self.ctx.call_id,
                                dropped = self.stt_dropped_frames,
                                "stt behind realtime, dropping frames"
                            );
                        }
                    }
                }
            }
            Some(SwitchInbound::Metadata { switch_uuid, .. }) => {
                if let Some(uuid) = switch_uuid {
                    if let Err(e) = self
                        .ctx
                        .journal
                        .set_switch_uuid(&self.ctx.call_id, uuid)
                        .await
                    {
                        tracing::debug!(call_id = %self.ctx.call_id, error = %e, "set_switch_uuid failed");
                    }
                }
            }
            Some(SwitchInbound::Dtmf { digit }) => {
                tracing::debug!(call_id = %self.ctx.call_id, digit = %digit, "dtmf");
            }
            Some(SwitchInbound::Hangup) | None => {
                tracing::info!(call_id = %self.ctx.call_id, "switch disconnected");
                self.switch_rx = None;
                self.begin_hangup(None);
            }
        }
    }

    async fn on_stt(&mut self, ev: Option<SttEvent>) {
        match ev {
            Some(SttEvent::Interim { text, .. }) => {
                let chars = text.chars().count();
                if matches!(self.state, CallState::Speaking | CallState::Greeting)
                    && chars > self.ctx.cfg.barge_in_min_chars
                {
                    self.barge_in().await;
                }
            }
            Some(SttEvent::Final {
                text, duration_ms, ..
            }) => {
                if !text.trim().is_empty() {
                    self.pending_finals.push(text);
                    self.pending_user_ms += duration_ms;
                }
            }
            Some(SttEvent::UtteranceEnd) => {
                if self.state == CallState::Listening && !self.pending_finals.is_empty() {
                    self.start_turn().await;
                }
            }
            Some(SttEvent::Error { message }) => {
                tracing::warn!(call_id = %self.ctx.call_id, error = %message, "stt stream error");
                self.stt = None;
                self.recover_stt().await;
            }
            None => {
                self.stt = None;
                self.recover_stt().await;
            }
        }
    }

    async fn recover_stt(&mut self) {
        if self.provider_failed(ProviderKind::Stt) {
            self.begin_hangup(Some("stt failed twice within 5s".into()));
            return;
        }
        match self.ctx.stt.open().await {
            Ok(s) => {
                tracing::info!(call_id = %self.ctx.call_id, "stt reconnected");
                self.stt = Some(s);
            }
            Err(e) => self.begin_hangup(Some(format!("stt reconnect: {e}"))),
        }
    }

    async fn on_llm(&mut self, ev: Option<LlmEvent>) {
        match ev {
            Some(LlmEvent::Delta { text }) => {
                if let Some(llm) = &mut self.llm {
                    llm.got_delta = true;
                }
                if self.state == CallState::Thinking {
                    self.set_state(CallState::Speaking);
                    match self.start_tts_stream(SpeakSource::Reply, None).await {
                        Ok(speaking) => self.speaking = Some(speaking),
                        Err(message) => {
                            self.handle_tts_error(message).await;
                            return;
                        }
                    }
                }
                if let Some(speaking) = &mut self.speaking {
                    speaking.planned.push_str(&text);
                    if let Some(sender) = &speaking.text {
                        let _ = sender.send(text).await;
                    }
                    if speaking.planned.chars().count() > self.ctx.cfg.max_reply_chars {
                        tracing::warn!(
                            call_id = %self.ctx.call_id,
                            "over-long model reply, finishing the turn early"
                        );
                        // Flush what was already fed to synthesis and stop
                        // the model.
                        speaking.text = None;
                        if let Some(llm) = self.llm.take() {
                            llm.cancel.cancel();
                        }
                    }
                }
            }
            Some(LlmEvent::Done { full_text }) => {
                self.llm = None;
                if let Some(speaking) = &mut self.speaking {
                    if !full_text.is_empty() {
                        // The terminal event carries the authoritative text.
                        speaking.planned = full_text;
                    }
                    // Closing the text input lets the synthesis flush its
                    // last partial sentence and finish.
                    speaking.text = None;
                } else if self.state == CallState::Thinking {
                    tracing::warn!(call_id = %self.ctx.call_id, "empty model response");
                    self.speak_phrase().await;
                }
            }
            Some(LlmEvent::Error { message }) => self.on_llm_failure(message).await,
            None => self.on_llm_failure("stream closed unexpectedly".into()).await,
        }
    }

    async fn on_llm_failure(&mut self, message: String) {
        tracing::warn!(call_id = %self.ctx.call_id, error = %message, "llm stream error");
        self.llm = None;
        if self.provider_failed(ProviderKind::Llm) {
            self.begin_hangup(Some(format!("llm failed twice within 5s: {message}")));
            return;
        }
        self.abort_speaking().await;
        self.speak_phrase().await;
    }

    /// Speak the apology phrase and stay in the call.
    async fn speak_phrase(&mut self) {
        let phrase = self.ctx.cfg.apology_phrase.clone();
        self.set_state(CallState::Speaking);
        if let Err(message) = self.speak(phrase, SpeakSource::Phrase).await {
            self.handle_tts_error(message).await;
        }
    }

    async fn on_speak(&mut self, ev: Option<SpeakEvent>) {
        match ev {
            Some(SpeakEvent::First) => {
                if let Some(speaking) = &mut self.speaking {
                    speaking.first_frame = true;
                }
                self.last_audio = Instant::now();
            }
            Some(SpeakEvent::Done { queued_frames }) => {
                self.last_audio = Instant::now();
                let Some(speaking) = self.speaking.take() else {
                    return;
                };
                if speaking.source != SpeakSource::Phrase && !speaking.planned.is_empty() {
                    let audio_ms = queued_frames * FRAME_MS;
                    self.commit_assistant(&speaking.planned, Some(audio_ms)).await;
                }
                if self.hangup_after_speak {
                    self.begin_hangup(None);
                } else {
                    self.enter_listening();
                }
            }
            Some(SpeakEvent::Error(message)) => self.handle_tts_error(message).await,
            None => {
                // Forwarder ended without a terminal event (cancelled).
                self.speaking = None;
            }
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        // TTS first-frame watchdog.
        let mut tts_timed_out = false;
        if let Some(speaking) = &mut self.speaking {
            if !speaking.first_frame {
                let elapsed = now.duration_since(speaking.started);
                if elapsed >= Duration::from_secs(self.ctx.cfg.tts_first_frame_fail_secs) {
                    tts_timed_out = true;
                } else if elapsed
                    >= Duration::from_secs(self.ctx.cfg.tts_first_frame_warn_secs)
                    && !speaking.warned_slow
                {
                    speaking.warned_slow = true;
                    tracing::warn!(
                        call_id = %self.ctx.call_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "tts first frame is slow"
                    );
                }
            }
        }
        if tts_timed_out {
            self.handle_tts_error("first frame timeout".into()).await;
            return;
        }

        // LLM first-token timeout: apologize, keep the session.
        let llm_timed_out = self
            .llm
            .as_ref()
            .map(|l| {
                !l.got_delta
                    && now.duration_since(l.started)
                        >= Duration::from_secs(self.ctx.cfg.llm_first_token_secs)
            })
            .unwrap_or(false);
        if llm_timed_out {
            tracing::warn!(call_id = %self.ctx.call_id, "llm first token timeout");
            if let Some(handle) = self.llm.take() {
                handle.cancel.cancel();
            }
            self.speak_phrase().await;
            return;
        }

        // Inactivity: polite farewell, then hang up.
        if self.speaking.is_none()
            && !self.hangup_after_speak
            && now.duration_since(self.last_audio)
                >= Duration::from_secs(self.ctx.cfg.inactivity_timeout_secs)
        {
            tracing::info!(call_id = %self.ctx.call_id, "inactivity timeout");
            self.hangup_after_speak = true;
            if let Some(llm) = self.llm.take() {
                llm.cancel.cancel();
            }
            let phrase = self.ctx.cfg.farewell_phrase.clone();
            self.set_state(CallState::Speaking);
            if let Err(message) = self.speak(phrase, SpeakSource::Phrase).await {
                self.begin_hangup(Some(format!("tts: {message}")));
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        // While the assistant is speaking, audio is flowing by definition.
        let mut deadline = if self.speaking.is_some() {
            Instant::now() + Duration::from_secs(self.ctx.cfg.inactivity_timeout_secs)
        } else {
            self.last_audio + Duration::from_secs(self.ctx.cfg.inactivity_timeout_secs)
        };
        if let Some(llm) = &self.llm {
            if !llm.got_delta {
                deadline = deadline
                    .min(llm.started + Duration::from_secs(self.ctx.cfg.llm_first_token_secs));
            }
        }
        if let Some(speaking) = &self.speaking {
            if !speaking.first_frame {
                if !speaking.warned_slow {
                    deadline = deadline.min(
                        speaking.started
                            + Duration::from_secs(self.ctx.cfg.tts_first_frame_warn_secs),
                    );
                }
                deadline = deadline.min(
                    speaking.started
                        + Duration::from_secs(self.ctx.cfg.tts_first_frame_fail_secs),
                );
            }
        }
        deadline
    }

    // ── Turn mechanics ───────────────────────────────────────────────

    async fn start_turn(&mut self) {
        let text = self.pending_finals.join(" ");
        let audio_ms = (self.pending_user_ms > 0).then_some(self.pending_user_ms);
        self.pending_finals.clear();
        self.pending_user_ms = 0;
        self.commit_user(&text, audio_ms).await;
        self.set_state(CallState::Thinking);
        self.start_llm();
    }

    /// Launch the completion in a side task so the FSM keeps selecting
    /// while the request connects.
    fn start_llm(&mut self) {
        let req = ChatRequest {
            messages: self.transcript.chat_messages(&self.ctx.prompt.system_text),
            model: self.ctx.prompt.model.clone(),
            temperature: self.ctx.prompt.temperature,
            max_tokens: None,
        };
        let (tx, rx) = mpsc::channel(LLM_EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let provider = self.ctx.llm.clone();

        tokio::spawn(async move {
            let stream = tokio::select! {
                _ = token.cancelled() => return,
                s = provider.stream(req) => s,
            };
            match stream {
                Ok(mut stream) => loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            stream.cancel();
                            return;
                        }
                        ev = stream.events.recv() => match ev {
                            Some(ev) => {
                                if tx.send(ev).await.is_err() {
                                    stream.cancel();
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                },
                Err(e) => {
                    let _ = tx
                        .send(LlmEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });

        self.llm = Some(LlmHandle {
            events: rx,
            cancel,
            got_delta: false,
            started: Instant::now(),
        });
    }

    /// Cancel the current assistant utterance and LLM, commit what was
    /// actually delivered, and go back to listening.
    async fn barge_in(&mut self) {
        tracing::debug!(call_id = %self.ctx.call_id, "barge-in");
        if let Some(llm) = self.llm.take() {
            llm.cancel.cancel();
        }
        self.abort_speaking().await;
        self.enter_listening();
    }

    /// Stop the in-flight utterance and commit its delivered prefix.
    async fn abort_speaking(&mut self) {
        let Some(mut speaking) = self.speaking.take() else {
            return;
        };
        if let Some(cancel) = speaking.cancel.take() {
            cancel.cancel();
        }
        speaking.text = None;
        if let Some(out) = &self.audio_out {
            out.flush();
        }
        let delivered_ms = self.delivered_since(speaking.delivered_start);
        if speaking.source != SpeakSource::Phrase {
            let spoken = truncate_spoken(
                &speaking.planned,
                delivered_ms,
                self.ctx.cfg.speech_chars_per_sec,
            );
            if !spoken.is_empty() {
                self.commit_assistant(&spoken, Some(delivered_ms)).await;
            }
        }
    }

    fn delivered_since(&self, start: u64) -> u64 {
        self.audio_out
            .as_ref()
            .map(|o| o.delivered_frames().saturating_sub(start) * FRAME_MS)
            .unwrap_or(0)
    }

    // ── Speaking ─────────────────────────────────────────────────────

    /// Speak a full utterance (greeting or canned phrase).
    async fn speak(
        &mut self,
        text: String,
        source: SpeakSource,
    ) -> std::result::Result<(), String> {
        // Cached greetings skip the synthesis round-trip entirely.
        if source == SpeakSource::Greeting {
            if let Some(frames) = self.ctx.greetings.get(&self.ctx.prompt.voice_id, &text) {
                let out = self.audio_out.clone().ok_or("no switch link")?;
                let (notify_tx, notify_rx) = mpsc::channel(SPEAK_EVENT_BUFFER);
                let delivered_start = out.delivered_frames();
                tokio::spawn(play_cached(frames, out, notify_tx));
                self.speaking = Some(Speaking {
                    source,
                    planned: text,
                    text: None,
                    cancel: None,
                    notify: notify_rx,
                    started: Instant::now(),
                    first_frame: false,
                    warned_slow: false,
                    delivered_start,
                });
                return Ok(());
            }
        }

        let cache_key = (source == SpeakSource::Greeting)
            .then(|| (self.ctx.prompt.voice_id.clone(), text.clone()));
        let mut speaking = self.start_tts_stream(source, cache_key).await?;
        speaking.planned = text.clone();
        if let Some(sender) = speaking.text.take() {
            // The whole utterance is known up front; close the input so the
            // stream flushes after this batch.
            let _ = sender.send(text).await;
        }
        self.speaking = Some(speaking);
        Ok(())
    }

    /// Open a synthesis stream and its frame-forwarder task.
    async fn start_tts_stream(
        &mut self,
        source: SpeakSource,
        cache_key: Option<(String, String)>,
    ) -> std::result::Result<Speaking, String> {
        let out = self.audio_out.clone().ok_or("no switch link")?;
        let stream = self
            .ctx
            .tts
            .synthesize(&self.ctx.prompt.voice_id)
            .await
            .map_err(|e| e.to_string())?;
        let TtsStream {
            text,
            events,
            cancel,
        } = stream;

        let (notify_tx, notify_rx) = mpsc::channel(SPEAK_EVENT_BUFFER);
        let collect = cache_key.map(|(voice, text)| (self.ctx.greetings.clone(), voice, text));
        let delivered_start = out.delivered_frames();
        tokio::spawn(forward_frames(events, out, notify_tx, collect));

        Ok(Speaking {
            source,
            planned: String::new(),
            text: Some(text),
            cancel: Some(cancel),
            notify: notify_rx,
            started: Instant::now(),
            first_frame: false,
            warned_slow: false,
            delivered_start,
        })
    }

    /// Synthesis failure: cancel the turn, apologize once, escalate on a
    /// repeat within the failure window.
    async fn handle_tts_error(&mut self, message: String) {
        tracing::warn!(call_id = %self.ctx.call_id, error = %message, "tts error");
        if let Some(llm) = self.llm.take() {
            llm.cancel.cancel();
        }
        let hangup_pending = self.hangup_after_speak;
        self.abort_speaking().await;
        if self.provider_failed(ProviderKind::Tts) || hangup_pending {
            self.begin_hangup(Some(format!("tts: {message}")));
            return;
        }
        self.set_state(CallState::Speaking);
        if let Err(second) = self
            .speak(self.ctx.cfg.apology_phrase.clone(), SpeakSource::Phrase)
            .await
        {
            self.begin_hangup(Some(format!("tts: {second}")));
        }
    }

    // ── Commits, state, bookkeeping ──────────────────────────────────

    async fn commit_user(&mut self, text: &str, audio_ms: Option<u64>) {
        let entry = self.transcript.commit_user(text, audio_ms);
        if let Err(e) = self
            .ctx
            .journal
            .append_message(&self.ctx.call_id, entry)
            .await
        {
            tracing::warn!(call_id = %self.ctx.call_id, error = %e, "append_message failed");
        }
    }

    async fn commit_assistant(&mut self, text: &str, audio_ms: Option<u64>) {
        let entry = self.transcript.commit_assistant(text, audio_ms);
        if let Err(e) = self
            .ctx
            .journal
            .append_message(&self.ctx.call_id, entry)
            .await
        {
            tracing::warn!(call_id = %self.ctx.call_id, error = %e, "append_message failed");
        }
    }

    fn enter_listening(&mut self) {
        self.reached_listening = true;
        self.set_state(CallState::Listening);
    }

    fn begin_hangup(&mut self, fatal: Option<String>) {
        if let Some(reason) = fatal {
            self.fatal.get_or_insert(reason);
        }
        self.set_state(CallState::HangingUp);
    }

    fn set_state(&mut self, to: CallState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.state_cell.set(to);
        tracing::debug!(
            call_id = %self.ctx.call_id,
            from = from.as_str(),
            to = to.as_str(),
            "state transition"
        );
        if to != CallState::Ended {
            self.registry.emit(LifecycleEvent::CallStateChanged {
                call_id: self.ctx.call_id.clone(),
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }

    fn emit_started(&mut self) {
        if self.started_emitted {
            return;
        }
        self.started_emitted = true;
        self.registry.emit(LifecycleEvent::CallStarted {
            call_id: self.ctx.call_id.clone(),
            direction: self.ctx.direction,
            caller: self.ctx.caller.clone(),
            called: self.ctx.called.clone(),
            origin: self.ctx.origin.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Record a provider failure; returns true when this is a repeat
    /// within the escalation window.
    fn provider_failed(&mut self, kind: ProviderKind) -> bool {
        let now = Instant::now();
        let slot = match kind {
            ProviderKind::Stt => &mut self.last_stt_failure,
            ProviderKind::Llm => &mut self.last_llm_failure,
            ProviderKind::Tts => &mut self.last_tts_failure,
        };
        let repeat = slot
            .map(|prev| now.duration_since(prev) < REPEAT_FAILURE_WINDOW)
            .unwrap_or(false);
        *slot = Some(now);
        repeat
    }

    // ── Teardown ─────────────────────────────────────────────────────

    async fn finish(mut self) {
        if self.state != CallState::HangingUp {
            self.set_state(CallState::HangingUp);
        }

        if let Some(llm) = self.llm.take() {
            llm.cancel.cancel();
        }
        self.abort_speaking().await;

        // Commit user speech that never reached an utterance end.
        if !self.pending_finals.is_empty() {
            let text = self.pending_finals.join(" ");
            let audio_ms = (self.pending_user_ms > 0).then_some(self.pending_user_ms);
            self.pending_finals.clear();
            self.commit_user(&text, audio_ms).await;
        }

        // Drain the recognition stream, bounded.
        if let Some(mut stt) = self.stt.take() {
            stt.close();
            let drain = async {
                while stt.events.recv().await.is_some() {}
            };
            let _ = tokio::time::timeout(
                Duration::from_secs(self.ctx.cfg.teardown_drain_secs),
                drain,
            )
            .await;
        }

        // Dropping the link closes the media socket from the adapter side.
        self.switch_rx = None;
        self.audio_out = None;

        let ended = Utc::now();
        let duration_ms = self
            .answered_at
            .map(|a| (ended - a).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let outcome = if self.fatal.is_some() || !self.answered || !self.reached_listening {
            CallOutcome::Failed
        } else {
            CallOutcome::Completed
        };

        if let Err(e) = self
            .ctx
            .journal
            .finalize_call(&self.ctx.call_id, outcome, ended, duration_ms)
            .await
        {
            tracing::warn!(call_id = %self.ctx.call_id, error = %e, "finalize_call failed");
        }

        if let Some(reason) = &self.fatal {
            self.registry.emit(LifecycleEvent::CallFailed {
                call_id: self.ctx.call_id.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
        }

        self.state = CallState::Ended;
        self.state_cell.set(CallState::Ended);
        self.registry.remove(&self.ctx.call_id);
        self.registry.emit(LifecycleEvent::CallEnded {
            call_id: self.ctx.call_id.clone(),
            outcome,
            answered: self.answered,
            duration_ms,
            transcript: self.transcript.to_vec(),
            origin: self.ctx.origin.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            call_id = %self.ctx.call_id,
            outcome = ?outcome,
            duration_ms,
            "session ended"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-in receive helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn recv_switch(rx: &mut Option<mpsc::Receiver<SwitchInbound>>) -> Option<SwitchInbound> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_stt(stt: &mut Option<SttSession>) -> Option<SttEvent> {
    match stt {
        Some(s) => s.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_llm(llm: &mut Option<LlmHandle>) -> Option<LlmEvent> {
    match llm {
        Some(h) => h.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_speak(speaking: &mut Option<Speaking>) -> Option<SpeakEvent> {
    match speaking {
        Some(s) => s.notify.recv().await,
        None => std::future::pending().await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame forwarding tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Moves synthesized frames into the outbox (blocking on its 200 ms cap,
/// which is the telephony-realtime backpressure) and reports the terminal
/// event back to the FSM. Optionally tees frames into the greeting cache.
async fn forward_frames(
    mut tts_events: mpsc::Receiver<TtsEvent>,
    out: AudioOut,
    notify: mpsc::Sender<SpeakEvent>,
    collect: Option<(Arc<GreetingCache>, String, String)>,
) {
    let mut collect = collect;
    let mut collected: Vec<Vec<u8>> = Vec::new();
    let mut first = true;
    let mut queued: u64 = 0;

    while let Some(ev) = tts_events.recv().await {
        match ev {
            TtsEvent::Frame { pcm } => {
                if first {
                    first = false;
                    if notify.send(SpeakEvent::First).await.is_err() {
                        return;
                    }
                }
                if collect.is_some() {
                    collected.push(pcm.clone());
                }
                queued += 1;
                if !out.push(pcm).await {
                    return;
                }
            }
            TtsEvent::Done => {
                if let Some((cache, voice, text)) = collect.take() {
                    cache.insert(&voice, &text, std::mem::take(&mut collected));
                }
                let _ = notify
                    .send(SpeakEvent::Done {
                        queued_frames: queued,
                    })
                    .await;
                return;
            }
            TtsEvent::Error { message } => {
                let _ = notify.send(SpeakEvent::Error(message)).await;
                return;
            }
        }
    }
    // Stream closed without a terminal event: the utterance was cancelled.
}

/// Greeting playback straight from the cache.
async fn play_cached(
    frames: Arc<Vec<Vec<u8>>>,
    out: AudioOut,
    notify: mpsc::Sender<SpeakEvent>,
) {
    let mut first = true;
    for frame in frames.iter() {
        if first {
            first = false;
            if notify.send(SpeakEvent::First).await.is_err() {
                return;
            }
        }
        if !out.push(frame.clone()).await {
            return;
        }
    }
    let _ = notify
        .send(SpeakEvent::Done {
            queued_frames: frames.len() as u64,
        })
        .await;
}
