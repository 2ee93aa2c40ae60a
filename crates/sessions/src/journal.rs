//! The narrow persistence seam the session engine writes through.
//!
//! Implemented by the store crate; sessions never see pooling, files, or
//! pagination. A failing journal never kills a call — the FSM logs and
//! continues in memory (recovery marks in-flight rows failed on restart).

use chrono::{DateTime, Utc};

use vox_domain::call::{CallOutcome, CallRecord, TranscriptEntry};
use vox_domain::error::Result;

#[async_trait::async_trait]
pub trait CallJournal: Send + Sync {
    /// Insert the call row. Idempotent on `call_id`.
    async fn insert_call(&self, record: CallRecord) -> Result<()>;

    /// Append a committed transcript entry, preserving per-call order.
    async fn append_message(&self, call_id: &str, entry: TranscriptEntry) -> Result<()>;

    /// Record the moment the switch attached its media stream.
    async fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Attach the switch's native identifier once known.
    async fn set_switch_uuid(&self, call_id: &str, switch_uuid: String) -> Result<()>;

    /// Close the row with its terminal outcome.
    async fn finalize_call(
        &self,
        call_id: &str,
        outcome: CallOutcome,
        ended: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<()>;
}
