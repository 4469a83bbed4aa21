//! Ordered playback: drains synthesized sentences in sequence order,
//! paces Opus frames against absolute wall-clock time, and merges the
//! turn's audio into one assistant recording on drain (§A.4.7).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::dialogue::opus::OpusCodec;
use crate::dialogue::synthesizer::{DialogStatus, Sentence};

pub const OPUS_FRAME_DURATION_MS: u64 = 60;
const ONLY_TEXT_SLEEP_MS: u64 = 500;
const IDLE_POLL_MS: u64 = 60;

/// Ordered by `seq` ascending (min-heap via `Reverse`) so sentences that
/// finish synthesis out of order still play in the order they were spoken.
struct QueuedSentence(Sentence);

impl PartialEq for QueuedSentence {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}
impl Eq for QueuedSentence {}
impl PartialOrd for QueuedSentence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedSentence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.seq.cmp(&other.0.seq)
    }
}

/// Outbound signals a `Player` sends to the device over its session
/// channel. Implemented by the websocket writer half.
#[async_trait::async_trait]
pub trait PlayerSink: Send + Sync {
    async fn send_sentence_start(&self, text: Option<&str>);
    async fn send_opus_frame(&self, frame: &[u8]);
    async fn send_emotion(&self, emotion: Option<&str>);
    async fn send_stop(&self);
}

/// Session-side hooks a `Player` needs but does not own.
#[async_trait::async_trait]
pub trait PlayerSessionHooks: Send + Sync {
    fn is_open(&self) -> bool;
    fn close_after_chat(&self) -> bool;
    fn clear_wakeup_response(&self);
    async fn close_session(&self);
    fn update_last_activity(&self);
    fn assistant_time_ms(&self) -> Option<i64>;
    fn assistant_audio_path(&self, time_ms: i64) -> PathBuf;
    /// Write the merged assistant audio path back onto the already-persisted
    /// turn (the message itself is stored before synthesis finishes, so the
    /// path is only known after this drain completes).
    async fn persist_assistant_audio_path(&self, time_ms: i64, path: &str);
}

pub struct Player {
    queue: Mutex<BinaryHeap<Reverse<QueuedSentence>>>,
    sink: Arc<dyn PlayerSink>,
    hooks: Arc<dyn PlayerSessionHooks>,
    codec: Arc<OpusCodec>,
    dialog_status: Mutex<Option<Arc<dyn DialogStatus>>>,
    running: AtomicBool,
    /// Set by an explicit `stop()` (abort path). The drain loop's final
    /// `stop` signal is skipped in that case — the caller already sends a
    /// fresh one (§3 invariant 4: exactly one `stop` under a *non-aborted*
    /// synthesizer; an aborted drain emits none from here).
    stopped: AtomicBool,
}

impl Player {
    pub fn new(sink: Arc<dyn PlayerSink>, hooks: Arc<dyn PlayerSessionHooks>, codec: Arc<OpusCodec>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            sink,
            hooks,
            codec,
            dialog_status: Mutex::new(None),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind (or rebind) the synthesizer whose `is_dialog`/`is_aborted`
    /// status gates when the run loop may stop.
    pub async fn set_dialog_status(&self, status: Arc<dyn DialogStatus>) {
        *self.dialog_status.lock().await = Some(status);
    }

    pub async fn append(&self, sentence: Sentence) {
        self.queue.lock().await.push(Reverse(QueuedSentence(sentence)));
    }

    async fn is_queue_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    async fn pop(&self) -> Option<Sentence> {
        self.queue.lock().await.pop().map(|Reverse(q)| q.0)
    }

    /// Start the run loop if it is not already active — matches the
    /// reference "start at most once" `ThreadPlayer.play()` guard.
    pub fn play(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let player = self.clone();
        tokio::spawn(async move {
            player.run().await;
            player.running.store(false, Ordering::SeqCst);
        });
    }

    /// Abort path: drain the queue without a final `stop` signal. The
    /// caller sends its own fresh `tts stop` frame (§3 invariant 4).
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut queue = self.queue.lock().await;
        queue.clear();
    }

    async fn run(self: &Arc<Self>) {
        let start_ts = Instant::now();
        let mut play_position_ms: i64 = -(OPUS_FRAME_DURATION_MS as i64) * 2;
        let mut merge_paths: Vec<PathBuf> = Vec::new();

        loop {
            let still_dialog = {
                let guard = self.dialog_status.lock().await;
                match guard.as_ref() {
                    Some(status) => status.is_dialog() && !status.is_aborted(),
                    None => false,
                }
            };
            if self.is_queue_empty().await && !still_dialog {
                break;
            }
            let Some(mut sentence) = self.pop().await else {
                tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)).await;
                continue;
            };

            let text_for_speech = sentence.get_text_for_speech().to_string();

            let Some(audio_path) = sentence.audio_path.clone() else {
                if !text_for_speech.is_empty() {
                    if sentence.is_only_emoji() {
                        self.sink.send_emotion(None).await;
                    } else {
                        self.sink.send_sentence_start(Some(&text_for_speech)).await;
                        self.sink.send_emotion(None).await;
                    }
                    tokio::time::sleep(Duration::from_millis(ONLY_TEXT_SLEEP_MS)).await;
                }
                continue;
            };

            self.sink.send_sentence_start(Some(&text_for_speech)).await;
            self.sink.send_emotion(None).await;

            if sentence.should_merge {
                merge_paths.push(audio_path.clone());
            }

            let opus_frames = match read_pcm_as_opus(&self.codec, &audio_path).await {
                Ok(frames) => frames,
                Err(err) => {
                    error!(seq = sentence.seq, %err, "failed to read sentence audio for playback");
                    continue;
                }
            };
            if opus_frames.is_empty() {
                continue;
            }

            for frame in &opus_frames {
                if !self.hooks.is_open() {
                    break;
                }
                let aborted = {
                    let guard = self.dialog_status.lock().await;
                    guard.as_ref().map(|s| s.is_aborted()).unwrap_or(false)
                };
                if aborted {
                    break;
                }
                self.hooks.update_last_activity();
                let target = start_ts + Duration::from_millis(play_position_ms.max(0) as u64);
                let now = Instant::now();
                if target > now {
                    tokio::time::sleep(target - now).await;
                }
                self.sink.send_opus_frame(frame).await;
                play_position_ms += OPUS_FRAME_DURATION_MS as i64;
            }
            play_position_ms += OPUS_FRAME_DURATION_MS as i64 * 5;
        }

        if self.stopped.load(Ordering::SeqCst) {
            // Aborted: the caller already issued its own `tts stop` frame.
            return;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        self.sink.send_stop().await;
        if self.hooks.close_after_chat() {
            self.hooks.close_session().await;
        }
        self.hooks.clear_wakeup_response();
        self.save_assistant_response(&mut merge_paths).await;
    }

    async fn save_assistant_response(&self, merge_paths: &mut Vec<PathBuf>) {
        let Some(time_ms) = self.hooks.assistant_time_ms() else { return };
        if merge_paths.is_empty() {
            return;
        }
        let dest = self.hooks.assistant_audio_path(time_ms);
        if let Err(err) = merge_audio_files(&dest, merge_paths).await {
            error!(%err, "failed to merge assistant audio");
            return;
        }
        merge_paths.clear();
        debug!(path = %dest.display(), "assistant audio merged");
        self.hooks.persist_assistant_audio_path(time_ms, &dest.display().to_string()).await;
    }
}

async fn read_pcm_as_opus(codec: &Arc<OpusCodec>, path: &std::path::Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let pcm = tokio::fs::read(path).await?;
    Ok(codec.encode_stream(&pcm, false))
}

async fn merge_audio_files(dest: &std::path::Path, sources: &[PathBuf]) -> anyhow::Result<()> {
    if sources.is_empty() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if sources.len() == 1 {
        let data = tokio::fs::read(&sources[0]).await?;
        tokio::fs::write(dest, data).await?;
        return Ok(());
    }
    let mut merged = Vec::new();
    for src in sources {
        merged.extend(tokio::fs::read(src).await?);
    }
    tokio::fs::write(dest, merged).await?;
    for src in sources {
        let _ = tokio::fs::remove_file(src).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_sentence_orders_by_seq() {
        let a = QueuedSentence(Sentence::new("a"));
        let b = QueuedSentence(Sentence::new("b"));
        assert!(a < b);
    }

    #[tokio::test]
    async fn pop_returns_lowest_seq_first() {
        struct NoopSink;
        #[async_trait::async_trait]
        impl PlayerSink for NoopSink {
            async fn send_sentence_start(&self, _text: Option<&str>) {}
            async fn send_opus_frame(&self, _frame: &[u8]) {}
            async fn send_emotion(&self, _emotion: Option<&str>) {}
            async fn send_stop(&self) {}
        }
        struct NoopHooks;
        #[async_trait::async_trait]
        impl PlayerSessionHooks for NoopHooks {
            fn is_open(&self) -> bool {
                true
            }
            fn close_after_chat(&self) -> bool {
                false
            }
            fn clear_wakeup_response(&self) {}
            async fn close_session(&self) {}
            fn update_last_activity(&self) {}
            fn assistant_time_ms(&self) -> Option<i64> {
                None
            }
            fn assistant_audio_path(&self, _time_ms: i64) -> PathBuf {
                PathBuf::new()
            }
            async fn persist_assistant_audio_path(&self, _time_ms: i64, _path: &str) {}
        }

        let codec = Arc::new(OpusCodec::new().unwrap());
        let player = Player::new(Arc::new(NoopSink), Arc::new(NoopHooks), codec);
        let second = Sentence::new("second");
        let first = Sentence::new("first");
        player.append(second).await;
        player.append(first).await;
        let popped = player.pop().await.unwrap();
        assert_eq!(popped.text, "first");
    }
}
