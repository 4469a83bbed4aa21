//! Per-session speech activity detection (§A.4.2).
//!
//! State machine with two logical states, `Idle` and `Speaking`, expressed
//! here as the `speaking` flag on `VadState` (mirroring the boolean-flag
//! shape of the reference implementation rather than introducing an enum
//! with no other variants).

use crate::dialogue::error::{DialogueError, DialogueResult};
use ort::session::Session;
use ort::value::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;
use tracing::warn;

/// Window size the speech model expects, 32 ms at 16 kHz.
const BUFFER_SIZE: usize = 512;
const SAMPLE_RATE: i64 = 16_000;

/// Sample rate of the PCM this module consumes and captures, in Hz.
/// Exposed for callers (e.g. the WAV writer in `controller`) that need to
/// interpret `captured_pcm()` bytes without duplicating the constant.
pub const PCM_SAMPLE_RATE_HZ: u32 = SAMPLE_RATE as u32;
/// Bytes per millisecond of 16 kHz mono 16-bit PCM.
const BYTES_PER_MS: usize = 32;
/// Minimum PCM length before it's worth running the model / capturing directly.
const MIN_PCM_LENGTH: usize = 960;
/// Small-chunk accumulator flush timeout.
const ACCUM_TIMEOUT_MS: u128 = 300;
/// Frames before softened onset thresholds stop applying.
const INITIAL_FRAME_WINDOW: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadStatus {
    NoSpeech,
    SpeechStart,
    SpeechContinue,
    SpeechEnd,
    Error,
}

#[derive(Debug, Clone)]
pub struct VadResult {
    pub status: VadStatus,
    pub data: Option<Vec<u8>>,
}

impl VadResult {
    pub fn is_speech_active(&self) -> bool {
        matches!(self.status, VadStatus::SpeechStart | VadStatus::SpeechContinue)
    }

    pub fn is_speech_end(&self) -> bool {
        self.status == VadStatus::SpeechEnd
    }
}

/// Role-configurable thresholds (§3 Role entity, §A.4.2 defaults).
#[derive(Debug, Clone, Copy)]
pub struct VadThresholds {
    pub speech_th: f32,
    pub silence_th: f32,
    pub energy_th: f32,
    pub silence_timeout_ms: u64,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            speech_th: 0.4,
            silence_th: 0.3,
            energy_th: 0.001,
            silence_timeout_ms: 800,
        }
    }
}

/// The Silero-like speech model: deterministic given (samples, prev_state).
pub struct SpeechModel {
    session: Session,
    model_path: PathBuf,
}

impl SpeechModel {
    pub fn load(model_path: PathBuf) -> DialogueResult<Self> {
        let session = Session::builder()
            .map_err(|e| DialogueError::Vad(format!("session builder: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| DialogueError::Vad(format!("intra threads: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| DialogueError::Vad(format!("load model {}: {e}", model_path.display())))?;
        Ok(Self { session, model_path })
    }

    /// Run one inference step. `samples` MUST be exactly `BUFFER_SIZE` long.
    /// `state` is the persistent hidden state, shape (2,1,128), updated in place.
    fn infer(&mut self, samples: &[f32], state: &mut Vec<f32>) -> DialogueResult<f32> {
        let input = Value::from_array(([1usize, samples.len()], samples.to_vec()))
            .map_err(|e| DialogueError::Vad(format!("input tensor: {e}")))?;
        let state_tensor = Value::from_array(([2usize, 1usize, 128usize], state.clone()))
            .map_err(|e| DialogueError::Vad(format!("state tensor: {e}")))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))
            .map_err(|e| DialogueError::Vad(format!("sr tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![input, state_tensor, sr])
            .map_err(|e| DialogueError::Vad(format!("inference: {e}")))?;

        let (_, prob_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DialogueError::Vad(format!("extract prob: {e}")))?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let (_, new_state) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DialogueError::Vad(format!("extract state: {e}")))?;
        if new_state.len() == state.len() {
            state.copy_from_slice(new_state);
        }
        Ok(prob)
    }
}

/// Per-session VAD working state, mirroring `_VadState` of the reference
/// implementation field for field.
pub struct VadState {
    pre_buffer_ms: u64,
    speaking: bool,
    speech_time: Option<Instant>,
    silence_time: Option<Instant>,
    silence_duration_ms: u64,
    consecutive_silence_frames: u32,
    consecutive_speech_frames: u32,
    silence_frame_count: u32,
    avg_energy: f32,
    original_probs: VecDeque<f32>,
    frame_counter: u32,
    silero_state: Vec<f32>,

    pre_buffer: VecDeque<Vec<u8>>,
    pre_buffer_size: usize,
    max_pre_buffer_size: usize,

    pcm_data: Vec<Vec<u8>>,
    opus_data: Vec<Vec<u8>>,

    pcm_accumulator: Vec<u8>,
    last_accum_time: Instant,
}

impl VadState {
    pub fn new(pre_buffer_ms: u64) -> Self {
        Self {
            pre_buffer_ms,
            speaking: false,
            speech_time: None,
            silence_time: None,
            silence_duration_ms: 0,
            consecutive_silence_frames: 0,
            consecutive_speech_frames: 0,
            silence_frame_count: 0,
            avg_energy: 0.0,
            original_probs: VecDeque::with_capacity(10),
            frame_counter: 0,
            silero_state: vec![0.0; 2 * 1 * 128],
            pre_buffer: VecDeque::new(),
            pre_buffer_size: 0,
            max_pre_buffer_size: (pre_buffer_ms as usize) * BYTES_PER_MS,
            pcm_data: Vec::new(),
            opus_data: Vec::new(),
            pcm_accumulator: Vec::new(),
            last_accum_time: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.pre_buffer_ms);
    }

    fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
        if speaking {
            self.speech_time = Some(Instant::now());
            self.silence_time = None;
        } else if self.silence_time.is_none() {
            self.silence_time = Some(Instant::now());
        }
    }

    fn silence_duration(&self) -> u64 {
        match self.silence_time {
            Some(t) => t.elapsed().as_millis() as u64,
            None => 0,
        }
    }

    fn update_silence(&mut self, is_silent: bool, frame_duration_ms: u64) {
        if is_silent {
            self.consecutive_silence_frames += 1;
            self.consecutive_speech_frames = 0;
            self.silence_duration_ms += frame_duration_ms;
            if self.silence_time.is_none() {
                self.silence_time = Some(Instant::now());
            }
        } else {
            self.consecutive_speech_frames += 1;
            if self.consecutive_speech_frames >= 2 {
                self.consecutive_silence_frames = 0;
                self.silence_duration_ms = 0;
                self.silence_time = None;
                self.silence_frame_count = 0;
            }
        }
    }

    fn update_energy(&mut self, energy: f32, is_silent: bool) {
        if self.avg_energy == 0.0 {
            self.avg_energy = energy;
        } else {
            let smoothing = if is_silent { 0.85 } else { 0.95 };
            self.avg_energy = smoothing * self.avg_energy + (1.0 - smoothing) * energy;
        }
    }

    fn add_original_prob(&mut self, prob: f32) {
        self.original_probs.push_back(prob);
        if self.original_probs.len() > 10 {
            self.original_probs.pop_front();
        }
        self.frame_counter += 1;
    }

    fn add_to_pre_buffer(&mut self, data: &[u8]) {
        if self.speaking {
            return;
        }
        self.pre_buffer.push_back(data.to_vec());
        self.pre_buffer_size += data.len();
        while self.pre_buffer_size > self.max_pre_buffer_size {
            if let Some(removed) = self.pre_buffer.pop_front() {
                self.pre_buffer_size -= removed.len();
            } else {
                break;
            }
        }
    }

    fn drain_pre_buffer(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pre_buffer_size);
        for chunk in self.pre_buffer.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.pre_buffer_size = 0;
        out
    }

    fn accumulate(&mut self, pcm: &[u8]) {
        if !pcm.is_empty() {
            self.pcm_accumulator.extend_from_slice(pcm);
            self.last_accum_time = Instant::now();
        }
    }

    fn drain_accumulator(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pcm_accumulator)
    }

    fn is_accum_timed_out(&self) -> bool {
        self.last_accum_time.elapsed().as_millis() > ACCUM_TIMEOUT_MS
    }

    fn add_pcm(&mut self, pcm: &[u8]) {
        if !pcm.is_empty() {
            self.pcm_data.push(pcm.to_vec());
        }
    }

    fn add_opus(&mut self, opus: &[u8]) {
        if !opus.is_empty() {
            self.opus_data.push(opus.to_vec());
        }
    }

    pub fn captured_pcm(&self) -> &[Vec<u8>] {
        &self.pcm_data
    }

    pub fn captured_opus(&self) -> &[Vec<u8>] {
        &self.opus_data
    }
}

/// Per-session VAD segmenter bound to a shared speech model.
pub struct VadSegmenter {
    state: VadState,
    thresholds: VadThresholds,
    tail_keep_ms: u64,
}

impl VadSegmenter {
    pub fn new(pre_buffer_ms: u64, tail_keep_ms: u64, thresholds: VadThresholds) -> Self {
        Self {
            state: VadState::new(pre_buffer_ms),
            thresholds,
            tail_keep_ms,
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Process one decoded PCM chunk (already Opus-decoded by `OpusCodec`).
    pub fn process(&mut self, model: &mut SpeechModel, pcm: &[u8]) -> VadResult {
        match self.process_inner(model, pcm) {
            Ok(r) => r,
            Err(e) => {
                warn!("vad processing failed: {e}");
                VadResult { status: VadStatus::Error, data: None }
            }
        }
    }

    fn process_inner(&mut self, model: &mut SpeechModel, pcm: &[u8]) -> DialogueResult<VadResult> {
        if pcm.is_empty() {
            return Ok(VadResult { status: VadStatus::NoSpeech, data: None });
        }

        let mut samples = bytes_to_floats(pcm);
        let mut enhanced_pcm = pcm.to_vec();

        let mut energy = calc_energy(&samples);
        let mut speech_prob = self.detect_speech(model, &samples)?.min(1.0);
        self.state.add_original_prob(speech_prob);
        self.state.add_to_pre_buffer(&enhanced_pcm);

        if enhanced_pcm.len() < MIN_PCM_LENGTH && !self.state.speaking {
            self.state.accumulate(&enhanced_pcm);
            if self.state.pcm_accumulator.len() < MIN_PCM_LENGTH && !self.state.is_accum_timed_out() {
                return Ok(VadResult { status: VadStatus::NoSpeech, data: None });
            }
            enhanced_pcm = self.state.drain_accumulator();
            if enhanced_pcm.is_empty() {
                return Ok(VadResult { status: VadStatus::NoSpeech, data: None });
            }
            samples = bytes_to_floats(&enhanced_pcm);
            energy = calc_energy(&samples);
            speech_prob = self.detect_speech(model, &samples)?.min(1.0);
        }

        let frame_duration_ms = (pcm.len() / BYTES_PER_MS) as u64;
        let is_initial = self.state.frame_counter < INITIAL_FRAME_WINDOW;
        let th = self.thresholds;

        let (has_energy, is_speech) = if is_initial {
            let has_energy = energy > th.energy_th * 0.3;
            (has_energy, speech_prob > th.speech_th * 0.6 && has_energy)
        } else {
            let has_energy = energy > th.energy_th;
            (has_energy, speech_prob > th.speech_th && has_energy)
        };

        let is_very_low = energy < th.energy_th;
        let is_silence =
            speech_prob < th.silence_th || (speech_prob < th.speech_th && !has_energy) || is_very_low;

        self.state.update_energy(energy, is_silence);
        self.state.update_silence(is_silence, frame_duration_ms);

        if !self.state.speaking && is_speech {
            self.state.pcm_data.clear();
            self.state.set_speaking(true);
            self.state.silence_frame_count = 0;
            self.state.pcm_accumulator.clear();
            self.state.last_accum_time = Instant::now();
            let pre_buffer = self.state.drain_pre_buffer();
            let result = if pre_buffer.is_empty() { enhanced_pcm } else { pre_buffer };
            self.state.add_pcm(&result);
            return Ok(VadResult { status: VadStatus::SpeechStart, data: Some(result) });
        }

        if self.state.speaking && is_silence {
            let silence_duration = self.state.silence_duration();
            if silence_duration > th.silence_timeout_ms {
                self.state.set_speaking(false);
                let silence_to_remove = silence_duration as i64 - self.tail_keep_ms as i64;
                if silence_to_remove > 0 {
                    let total_silence_frames = self.state.silence_frame_count as i64;
                    let frames_to_remove = if total_silence_frames > 0 && silence_duration > 0 {
                        (((total_silence_frames * silence_to_remove) as f64 / silence_duration as f64)
                            + 0.999)
                            .floor() as i64
                    } else {
                        0
                    }
                    .min(total_silence_frames);
                    for _ in 0..frames_to_remove {
                        self.state.pcm_data.pop();
                        self.state.opus_data.pop();
                    }
                }
                self.state.silence_frame_count = 0;
                self.state.silero_state = vec![0.0; 2 * 1 * 128];
                self.state.pcm_accumulator.clear();
                self.state.last_accum_time = Instant::now();
                return Ok(VadResult { status: VadStatus::SpeechEnd, data: Some(enhanced_pcm) });
            }

            self.state.add_pcm(&enhanced_pcm);
            self.state.silence_frame_count += 1;
            return Ok(VadResult { status: VadStatus::SpeechContinue, data: Some(enhanced_pcm) });
        }

        if self.state.speaking {
            self.state.add_pcm(&enhanced_pcm);
            self.state.silence_frame_count = 0;
            return Ok(VadResult { status: VadStatus::SpeechContinue, data: Some(enhanced_pcm) });
        }

        Ok(VadResult { status: VadStatus::NoSpeech, data: None })
    }

    /// Track the Opus frame alongside the decoded PCM, for later merging
    /// into the auditing capture.
    pub fn add_opus_frame(&mut self, opus: &[u8]) {
        self.state.add_opus(opus);
    }

    pub fn captured_pcm(&self) -> &[Vec<u8>] {
        self.state.captured_pcm()
    }

    pub fn captured_opus(&self) -> &[Vec<u8>] {
        self.state.captured_opus()
    }

    fn detect_speech(&mut self, model: &mut SpeechModel, samples: &[f32]) -> DialogueResult<f32> {
        if samples.is_empty() {
            return Ok(0.0);
        }
        if samples.len() == BUFFER_SIZE {
            return model.infer(samples, &mut self.state.silero_state);
        }
        if samples.len() < BUFFER_SIZE {
            let mut padded = samples.to_vec();
            padded.resize(BUFFER_SIZE, 0.0);
            return model.infer(&padded, &mut self.state.silero_state);
        }
        let mut max_prob = 0.0f32;
        let step = BUFFER_SIZE / 2;
        let mut offset = 0;
        while offset + BUFFER_SIZE <= samples.len() {
            let chunk = &samples[offset..offset + BUFFER_SIZE];
            let prob = model.infer(chunk, &mut self.state.silero_state)?;
            max_prob = max_prob.max(prob);
            offset += step;
        }
        Ok(max_prob)
    }
}

fn bytes_to_floats(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

fn calc_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_buffer_bounded_by_configured_ms() {
        let mut state = VadState::new(10); // 10ms * 32 bytes/ms = 320 bytes
        state.add_to_pre_buffer(&vec![0u8; 200]);
        state.add_to_pre_buffer(&vec![0u8; 200]);
        assert!(state.pre_buffer_size <= 320);
    }

    #[test]
    fn silence_smoothing_uses_asymmetric_weights() {
        let mut state = VadState::new(500);
        state.update_energy(0.1, false);
        assert_eq!(state.avg_energy, 0.1);
        state.update_energy(0.2, false);
        // speech smoothing = 0.95
        assert!((state.avg_energy - (0.95 * 0.1 + 0.05 * 0.2)).abs() < 1e-6);
    }

    #[test]
    fn accumulator_flushes_after_timeout() {
        let mut state = VadState::new(500);
        state.accumulate(&[0u8; 10]);
        assert!(!state.is_accum_timed_out());
    }

    #[test]
    fn original_probs_capped_at_ten() {
        let mut state = VadState::new(500);
        for i in 0..15 {
            state.add_original_prob(i as f32 * 0.01);
        }
        assert_eq!(state.original_probs.len(), 10);
        assert_eq!(state.frame_counter, 15);
    }
}
