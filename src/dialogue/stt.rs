//! STT provider contract: batch and streaming recognition, with a cached
//! per-(provider, configId) factory (§A.4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::dialogue::vad::PCM_SAMPLE_RATE_HZ;

/// Offline recognizer subprocess timeout (§5 Timeouts).
const OFFLINE_STT_TIMEOUT: Duration = Duration::from_secs(30);
/// The first subprocess call sometimes races a model cold start; retry once.
const OFFLINE_STT_ATTEMPTS: u32 = 2;

/// One provider's speech recognizer. Implementations wrap a local model
/// (Vosk-like offline recognizer) or a remote streaming/batch HTTP API.
#[async_trait]
pub trait SttAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Recognize a complete utterance of 16kHz mono PCM bytes.
    async fn recognize(&self, pcm: &[u8]) -> anyhow::Result<String>;

    /// Recognize a live stream of PCM chunks, returning the final
    /// transcript once the stream closes. The default implementation
    /// buffers everything and falls back to `recognize` — providers that
    /// truly stream override this for lower latency.
    async fn stream_recognize(&self, mut chunks: mpsc::Receiver<Vec<u8>>) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            buffer.extend(chunk);
        }
        self.recognize(&buffer).await
    }
}

/// Offline default recognizer — always available, used when no remote STT
/// config is bound to the session's role. Shells out to a local recognizer
/// script the same way the teacher's `faster-whisper` adapter does: WAV in
/// memory, base64 over stdin, JSON `{"text"}`/`{"error"}` back over stdout.
pub struct OfflineSttAdapter {
    model_path: Option<PathBuf>,
    script_path: PathBuf,
    timeout: Duration,
}

impl OfflineSttAdapter {
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self { model_path, script_path: PathBuf::from("/usr/local/bin/vosk-recognize.py"), timeout: OFFLINE_STT_TIMEOUT }
    }

    async fn run_recognizer(&self, audio_b64: &str, model_path: &Path) -> anyhow::Result<String> {
        let mut child = tokio::process::Command::new("python3")
            .arg(&self.script_path)
            .arg("-")
            .arg(model_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn offline stt recognizer process")?;

        let mut stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("recognizer process has no stdin"))?;
        let payload = audio_b64.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("offline stt recognizer timed out after {}s", self.timeout.as_secs()))?
            .context("failed to wait for offline stt recognizer")?;

        if !output.status.success() {
            anyhow::bail!("offline stt recognizer exited with error: {}", String::from_utf8_lossy(&output.stderr));
        }

        let result: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("failed to parse offline stt recognizer output")?;
        if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
            if !error.is_empty() {
                anyhow::bail!("offline stt recognizer error: {error}");
            }
        }

        let text = result.get("text").and_then(|t| t.as_str()).unwrap_or_default().trim().to_string();
        info!(chars = text.len(), "offline stt transcribed");
        Ok(text)
    }
}

#[async_trait]
impl SttAdapter for OfflineSttAdapter {
    fn provider_name(&self) -> &str {
        "offline"
    }

    async fn recognize(&self, pcm: &[u8]) -> anyhow::Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let Some(model_path) = self.model_path.clone() else {
            warn!("offline stt invoked without a configured model path");
            return Ok(String::new());
        };

        let wav_bytes = pcm_to_wav(pcm)?;
        let audio_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &wav_bytes);

        let mut last_err = None;
        for attempt in 0..OFFLINE_STT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.run_recognizer(&audio_b64, &model_path).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(%err, attempt, "offline stt recognition attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("offline stt recognition failed")))
    }
}

/// Encode little-endian 16-bit mono PCM bytes as WAV bytes in memory, the
/// payload the recognizer subprocess expects on stdin.
fn pcm_to_wav(pcm: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let spec = hound::WavSpec { channels: 1, sample_rate: PCM_SAMPLE_RATE_HZ, bits_per_sample: 16, sample_format: hound::SampleFormat::Int };
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// Remote HTTP-backed STT provider: one POST per utterance, batch only —
/// mirrors providers like FunASR that do not support a streaming protocol.
pub struct HttpSttAdapter {
    provider: String,
    api_url: String,
    client: reqwest::Client,
}

impl HttpSttAdapter {
    pub fn new(provider: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self { provider: provider.into(), api_url: api_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl SttAdapter for HttpSttAdapter {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn recognize(&self, pcm: &[u8]) -> anyhow::Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let part = reqwest::multipart::Part::bytes(pcm.to_vec()).file_name("audio.pcm");
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(&self.api_url)
            .multipart(form)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        let payload: serde_json::Value = response.json().await?;
        Ok(payload
            .get("text")
            .or_else(|| payload.get("result"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SttConfig {
    pub provider: Option<String>,
    pub config_id: Option<i64>,
    pub api_url: Option<String>,
}

/// Builds and caches `SttAdapter`s by `(provider, configId)`, matching
/// the reference factory's cache-key shape.
pub struct SttAdapterFactory {
    cache: Mutex<HashMap<String, Arc<dyn SttAdapter>>>,
    model_path: Option<std::path::PathBuf>,
}

impl SttAdapterFactory {
    pub fn new(model_path: Option<std::path::PathBuf>) -> Self {
        Self { cache: Mutex::new(HashMap::new()), model_path }
    }

    fn cache_key(provider: &str, config_id: Option<i64>) -> String {
        format!("{provider}:{}", config_id.unwrap_or(-1))
    }

    pub async fn default_adapter(&self) -> Arc<dyn SttAdapter> {
        Arc::new(OfflineSttAdapter::new(self.model_path.clone()))
    }

    pub async fn get(&self, config: Option<&SttConfig>) -> Arc<dyn SttAdapter> {
        let Some(config) = config else {
            return self.default_adapter().await;
        };
        let provider = config.provider.clone().unwrap_or_else(|| "offline".to_string()).to_lowercase();
        let key = Self::cache_key(&provider, config.config_id);

        if let Some(existing) = self.cache.lock().await.get(&key) {
            return existing.clone();
        }

        let adapter: Arc<dyn SttAdapter> = match provider.as_str() {
            "offline" | "vosk" => Arc::new(OfflineSttAdapter::new(self.model_path.clone())),
            other => match &config.api_url {
                Some(url) => Arc::new(HttpSttAdapter::new(other, url.clone())),
                None => {
                    error!(provider = other, "stt provider configured without apiUrl, falling back to offline");
                    Arc::new(OfflineSttAdapter::new(self.model_path.clone()))
                }
            },
        };
        self.cache.lock().await.insert(key, adapter.clone());
        adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_pcm_recognizes_to_empty_string() {
        let adapter = OfflineSttAdapter::new(None);
        let text = adapter.recognize(&[]).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn factory_caches_by_provider_and_config_id() {
        let factory = SttAdapterFactory::new(None);
        let config = SttConfig { provider: Some("funasr".into()), config_id: Some(7), api_url: Some("http://x".into()) };
        let a = factory.get(Some(&config)).await;
        let b = factory.get(Some(&config)).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn stream_recognize_default_buffers_then_recognizes() {
        let adapter = OfflineSttAdapter::new(None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![1, 2, 3]).await.unwrap();
        drop(tx);
        let text = adapter.stream_recognize(rx).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn recognize_without_model_path_is_empty_even_for_real_audio() {
        let adapter = OfflineSttAdapter::new(None);
        let pcm = vec![0u8; 3200]; // 100ms of silence at 16kHz mono 16-bit
        let text = adapter.recognize(&pcm).await.unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn pcm_to_wav_produces_a_valid_riff_header_sized_for_the_sample_count() {
        let pcm = vec![0u8; 3200];
        let wav = pcm_to_wav(&pcm).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + pcm.len());
    }
}
