//! Bounded, generation-tagged audio queue between a session and the
//! switch's paced writer.
//!
//! The queue holds at most 200 ms of audio; a full queue blocks the TTS
//! forwarder, which is the backpressure that rate-limits synthesis to
//! telephony real-time. Barge-in bumps the generation counter, instantly
//! invalidating every queued frame — the writer discards stale frames
//! silently, so cancellation takes effect within one 20 ms tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// 10 frames × 20 ms = the 200 ms switch-side buffer cap.
pub const OUTBOX_FRAMES: usize = 10;

struct OutFrame {
    generation: u64,
    pcm: Vec<u8>,
}

/// Session-side handle: frames in, flush on barge-in.
#[derive(Clone)]
pub struct AudioOut {
    tx: mpsc::Sender<OutFrame>,
    generation: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

/// Writer-side handle, owned by the media adapter's pacing loop.
pub struct AudioOutDriver {
    rx: mpsc::Receiver<OutFrame>,
    generation: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

/// Result of polling the outbox for the next paced frame.
pub enum FramePoll {
    Frame(Vec<u8>),
    Empty,
    Closed,
}

pub fn outbox(capacity: usize) -> (AudioOut, AudioOutDriver) {
    let (tx, rx) = mpsc::channel(capacity);
    let generation = Arc::new(AtomicU64::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    (
        AudioOut {
            tx,
            generation: generation.clone(),
            delivered: delivered.clone(),
        },
        AudioOutDriver {
            rx,
            generation,
            delivered,
        },
    )
}

impl AudioOut {
    /// Queue a frame under the current generation. Blocks while the queue
    /// is full (backpressure). Returns `false` when the writer is gone.
    pub async fn push(&self, pcm: Vec<u8>) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        self.tx.send(OutFrame { generation, pcm }).await.is_ok()
    }

    /// Invalidate all queued frames (barge-in cancellation).
    pub fn flush(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Frames actually handed to the switch so far.
    pub fn delivered_frames(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

impl AudioOutDriver {
    /// Non-blocking poll for the next live frame. Stale-generation frames
    /// are consumed and discarded in place.
    pub fn try_next(&mut self) -> FramePoll {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if frame.generation == self.generation.load(Ordering::Acquire) {
                        self.delivered.fetch_add(1, Ordering::AcqRel);
                        return FramePoll::Frame(frame.pcm);
                    }
                    // Frame produced before a cancel; drop silently.
                }
                Err(mpsc::error::TryRecvError::Empty) => return FramePoll::Empty,
                Err(mpsc::error::TryRecvError::Disconnected) => return FramePoll::Closed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_in_order() {
        let (out, mut driver) = outbox(OUTBOX_FRAMES);
        assert!(out.push(vec![1]).await);
        assert!(out.push(vec![2]).await);

        match driver.try_next() {
            FramePoll::Frame(f) => assert_eq!(f, vec![1]),
            _ => panic!("expected frame"),
        }
        match driver.try_next() {
            FramePoll::Frame(f) => assert_eq!(f, vec![2]),
            _ => panic!("expected frame"),
        }
        assert!(matches!(driver.try_next(), FramePoll::Empty));
        assert_eq!(out.delivered_frames(), 2);
    }

    #[tokio::test]
    async fn flush_discards_queued_frames() {
        let (out, mut driver) = outbox(OUTBOX_FRAMES);
        out.push(vec![1]).await;
        out.push(vec![2]).await;
        out.flush();
        out.push(vec![3]).await;

        match driver.try_next() {
            FramePoll::Frame(f) => assert_eq!(f, vec![3], "stale frames skipped"),
            _ => panic!("expected post-flush frame"),
        }
        // Only the live frame counts as delivered.
        assert_eq!(out.delivered_frames(), 1);
    }

    #[tokio::test]
    async fn closed_when_session_drops() {
        let (out, mut driver) = outbox(OUTBOX_FRAMES);
        drop(out);
        assert!(matches!(driver.try_next(), FramePoll::Closed));
    }

    #[tokio::test]
    async fn push_blocks_at_capacity() {
        let (out, _driver) = outbox(2);
        out.push(vec![0]).await;
        out.push(vec![0]).await;
        // Third push must not complete while the queue is full.
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), out.push(vec![0])).await;
        assert!(blocked.is_err(), "push should block at capacity");
    }
}
