//! Telephony audio frame math.
//!
//! All audio in the system is linear PCM, 8 kHz, mono, signed 16-bit
//! little-endian, carried in fixed 20 ms frames. Every conversion between
//! bytes, samples, frames, and milliseconds goes through this module.

/// Samples per second.
pub const SAMPLE_RATE: u32 = 8_000;

/// Frame duration in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Samples per frame (8 kHz × 20 ms).
pub const FRAME_SAMPLES: usize = 160;

/// Bytes per frame (160 samples × 2 bytes).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Milliseconds of audio represented by `n` frames.
pub fn frames_to_ms(frames: u64) -> u64 {
    frames * FRAME_MS
}

/// Milliseconds of audio represented by a PCM byte count (rounded down to
/// whole frames).
pub fn bytes_to_ms(bytes: usize) -> u64 {
    frames_to_ms((bytes / FRAME_BYTES) as u64)
}

/// Split a PCM byte buffer into exact 320-byte frames, zero-padding the
/// final partial frame if any.
pub fn chunk_frames(pcm: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(pcm.len() / FRAME_BYTES + 1);
    let mut chunks = pcm.chunks_exact(FRAME_BYTES);
    for chunk in &mut chunks {
        frames.push(chunk.to_vec());
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut last = rest.to_vec();
        last.resize(FRAME_BYTES, 0);
        frames.push(last);
    }
    frames
}

/// Root-mean-square energy of a PCM frame.
pub fn rms_energy(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let samples = pcm.chunks_exact(2);
    let n = samples.len();
    let sum: f32 = samples
        .map(|c| {
            let s = i16::from_le_bytes([c[0], c[1]]) as f32;
            s * s
        })
        .sum();
    (sum / n as f32).sqrt()
}

/// Energy threshold separating speech from line noise.
pub const SPEECH_RMS_THRESHOLD: f32 = 200.0;

/// Whether a frame carries audible speech. Switches stream silence frames
/// continuously, so inactivity tracking must not count them.
pub fn frame_has_speech(pcm: &[u8]) -> bool {
    rms_energy(pcm) > SPEECH_RMS_THRESHOLD
}

/// A stateful splitter that carries partial-frame remainders between calls.
///
/// Provider TTS responses arrive in arbitrary chunk sizes; this re-chunks
/// them into exact switch frames without padding mid-stream.
#[derive(Default)]
pub struct FrameSplitter {
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of PCM bytes; returns all complete frames now available.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let n = self.pending.len() / FRAME_BYTES;
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            let frame: Vec<u8> = self.pending.drain(..FRAME_BYTES).collect();
            frames.push(frame);
        }
        frames
    }

    /// Flush the trailing partial frame (zero-padded), if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut last = std::mem::take(&mut self.pending);
        last.resize(FRAME_BYTES, 0);
        Some(last)
    }
}
