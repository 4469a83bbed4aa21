//! Sentence synthesis worker: drains sentences emitted by the `Sentencer`,
//! calls the session's `TtsAdapter`, and hands finished audio to the
//! `Player` in order (§A.4.6).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::dialogue::player::Player;
use crate::dialogue::sentencer::process_sentence;
use crate::dialogue::tts::TtsAdapter;

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    SEQ_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// One chunk of assistant speech queued for synthesis and playback
/// (§3 `Sentence` entity).
#[derive(Debug, Clone)]
pub struct Sentence {
    pub seq: u64,
    pub text: String,
    pub audio_path: Option<std::path::PathBuf>,
    pub should_merge: bool,
    pub assistant_time_ms: Option<i64>,
    pub retry_count: u32,
    pub is_retry: bool,
    pub created_at: Instant,
    pub begin_synthesis: Option<Instant>,
    pub end_synthesis: Option<Instant>,
    moods: Vec<String>,
    text_for_speech: Option<String>,
}

impl Sentence {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            seq: next_seq(),
            text: text.into(),
            audio_path: None,
            should_merge: true,
            assistant_time_ms: None,
            retry_count: 0,
            is_retry: false,
            created_at: Instant::now(),
            begin_synthesis: None,
            end_synthesis: None,
            moods: Vec::new(),
            text_for_speech: None,
        }
    }

    pub fn with_assistant_time(mut self, time_ms: i64) -> Self {
        self.assistant_time_ms = Some(time_ms);
        self
    }

    /// Lazily compute and cache the emoji-stripped speech text and moods.
    pub fn get_text_for_speech(&mut self) -> &str {
        if self.text_for_speech.is_none() {
            let mut moods = Vec::new();
            let speech = process_sentence(&self.text, &mut moods);
            self.moods.extend(moods);
            self.text_for_speech = Some(speech);
        }
        self.text_for_speech.as_deref().unwrap_or("")
    }

    pub fn get_moods(&mut self) -> &[String] {
        if self.moods.is_empty() {
            let _ = self.get_text_for_speech();
        }
        &self.moods
    }

    pub fn is_only_emoji(&self) -> bool {
        !self.moods.is_empty() && self.text.trim().chars().count() <= 4
    }

    pub fn set_audio(&mut self, path: std::path::PathBuf) {
        self.audio_path = Some(path);
    }

    pub fn synthesis_duration_ms(&self) -> Option<i64> {
        match (self.begin_synthesis, self.end_synthesis) {
            (Some(b), Some(e)) => Some(e.duration_since(b).as_millis() as i64),
            _ => None,
        }
    }
}

/// Config knobs threaded in from `DialogueConfig` (§6.4).
#[derive(Debug, Clone, Copy)]
pub struct SynthesisRetryPolicy {
    pub max_retry_count: u32,
    pub retry_delay_ms: u64,
}

/// Lets the `Player` ask the current turn's synthesizer whether more
/// sentences are still expected, without the two owning each other.
pub trait DialogStatus: Send + Sync {
    fn is_dialog(&self) -> bool;
    fn is_aborted(&self) -> bool;
}

/// Per-turn sentence queue + worker. One `Synthesizer` is created per
/// assistant turn and discarded once drained or aborted.
pub struct Synthesizer {
    tx: mpsc::UnboundedSender<Sentence>,
    aborted: Arc<AtomicBool>,
    is_last: Arc<AtomicBool>,
    pending_count: Arc<AtomicU64>,
}

impl Synthesizer {
    /// Spawn the worker loop. `on_retry_exhausted` is invoked (fire-and-forget)
    /// whenever a sentence is dropped after exceeding `retry_policy.max_retry_count`.
    pub fn spawn<T: TtsAdapter + 'static>(
        tts: Arc<T>,
        player: Arc<Player>,
        retry_policy: SynthesisRetryPolicy,
        emit_happy_emotion: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sentence>();
        let aborted = Arc::new(AtomicBool::new(false));
        let is_last = Arc::new(AtomicBool::new(false));
        let pending_count = Arc::new(AtomicU64::new(0));

        let worker_aborted = aborted.clone();
        let worker_pending = pending_count.clone();

        tokio::spawn(async move {
            while let Some(mut sentence) = rx.recv().await {
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                if worker_aborted.load(Ordering::SeqCst) {
                    continue;
                }
                sentence.begin_synthesis = Some(Instant::now());
                synthesize_with_retry(&tts, &player, &mut sentence, retry_policy, &worker_aborted, &emit_happy_emotion).await;
            }
        });

        Self { tx, aborted, is_last, pending_count }
    }

    pub fn cancel(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn set_last(&self) {
        self.is_last.store(true, Ordering::SeqCst);
    }

    /// True while there is still synthesis work outstanding — mirrors the
    /// reference `is_dialog`: either more sentences are expected, or some
    /// are still queued.
    pub fn is_dialog(&self) -> bool {
        !self.is_last.load(Ordering::SeqCst) || self.pending_count.load(Ordering::SeqCst) > 0
    }

    pub fn append_sentence(&self, text: impl Into<String>, assistant_time_ms: Option<i64>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        let mut sentence = Sentence::new(text);
        if let Some(t) = assistant_time_ms {
            sentence = sentence.with_assistant_time(t);
        }
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(sentence);
    }
}

impl DialogStatus for Synthesizer {
    fn is_dialog(&self) -> bool {
        Synthesizer::is_dialog(self)
    }

    fn is_aborted(&self) -> bool {
        Synthesizer::is_aborted(self)
    }
}

async fn synthesize_with_retry<T: TtsAdapter>(
    tts: &Arc<T>,
    player: &Arc<Player>,
    sentence: &mut Sentence,
    policy: SynthesisRetryPolicy,
    aborted: &Arc<AtomicBool>,
    emit_happy_emotion: &Arc<dyn Fn() + Send + Sync>,
) {
    loop {
        if aborted.load(Ordering::SeqCst) {
            return;
        }
        let text = sentence.get_text_for_speech().to_string();
        match tts.text_to_speech(&text).await {
            Ok(audio_path) => {
                sentence.end_synthesis = Some(Instant::now());
                sentence.set_audio(audio_path);
                if aborted.load(Ordering::SeqCst) {
                    return;
                }
                player.append(sentence.clone()).await;
                player.play();
                return;
            }
            Err(err) => {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }
                sentence.retry_count += 1;
                sentence.is_retry = true;
                (emit_happy_emotion)();

                if sentence.retry_count <= policy.max_retry_count {
                    warn!(seq = sentence.seq, retry = sentence.retry_count, max = policy.max_retry_count, %err, "tts retry");
                    tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)).await;
                    continue;
                }
                error!(seq = sentence.seq, %err, "tts synthesis abandoned after max retries");
                return;
            }
        }
    }
}

impl Default for SynthesisRetryPolicy {
    fn default() -> Self {
        Self { max_retry_count: 1, retry_delay_ms: 1000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_seq_increases_across_sentences() {
        let a = Sentence::new("one");
        let b = Sentence::new("two");
        assert!(b.seq > a.seq);
    }

    #[test]
    fn only_emoji_detection_matches_short_emoji_only_text() {
        let mut s = Sentence::new("\u{1F600}");
        let _ = s.get_text_for_speech();
        assert!(s.is_only_emoji());
    }

    #[test]
    fn long_text_with_emoji_is_not_only_emoji() {
        let mut s = Sentence::new("今天天气真好\u{1F600}呀呀呀呀呀");
        let _ = s.get_text_for_speech();
        assert!(!s.is_only_emoji());
    }
}
