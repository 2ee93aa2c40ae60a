//! Per-call session engine: the call FSM, the process-wide session
//! registry, transcript bookkeeping, greeting audio cache, and the paced
//! audio outbox toward the switch.

pub mod events;
pub mod fsm;
pub mod greeting;
pub mod journal;
pub mod outbox;
pub mod registry;
pub mod transcript;

pub use events::{SessionCommand, SwitchInbound, SwitchLink};
pub use fsm::{spawn_session, SessionCtx};
pub use greeting::GreetingCache;
pub use journal::CallJournal;
pub use outbox::{outbox, AudioOut, AudioOutDriver, FramePoll, OUTBOX_FRAMES};
pub use registry::{RegistrySnapshot, SessionRegistry};
