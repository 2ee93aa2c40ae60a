//! Messages flowing into a session's fan-in loop.

use tokio::sync::{mpsc, oneshot};

use crate::outbox::AudioOutDriver;

/// Everything the switch adapter forwards from the media socket.
#[derive(Debug)]
pub enum SwitchInbound {
    /// One 20 ms PCM frame.
    Audio(Vec<u8>),
    /// Out-of-band call metadata from the switch.
    Metadata {
        caller: Option<String>,
        called: Option<String>,
        switch_uuid: Option<String>,
    },
    Dtmf {
        digit: String,
    },
    /// The switch announced hangup in-band.
    Hangup,
}

/// Control-plane commands addressed to one session.
pub enum SessionCommand {
    /// The switch's media socket is here; bind it.
    Attach(SwitchLink),
    /// Force the FSM into `HANGING_UP` (operator hangup or process drain).
    Hangup,
}

/// Handed to the session by the media adapter at attach time. The session
/// replies with the outbox driver the adapter's paced writer consumes.
pub struct SwitchLink {
    pub inbound: mpsc::Receiver<SwitchInbound>,
    pub ready: oneshot::Sender<AudioOutDriver>,
}
