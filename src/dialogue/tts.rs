//! TTS provider contract: text-to-speech producing a playable audio file,
//! with voice/pitch/speed mapped per provider and a cached factory
//! (§A.4.4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

pub const DEFAULT_PROVIDER: &str = "edge";
pub const DEFAULT_VOICE: &str = "zh-CN-XiaoyiNeural";

/// One provider's speech synthesizer.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    fn provider_name(&self) -> &str;
    fn voice_name(&self) -> &str;
    fn speed(&self) -> f32;
    fn pitch(&self) -> f32;

    /// Synthesize `text` and return the path to the generated audio file.
    async fn text_to_speech(&self, text: &str) -> anyhow::Result<PathBuf>;
}

/// HTTP-backed provider: posts text (plus voice/pitch/speed) and writes
/// the response body to `output_dir`.
pub struct HttpTtsAdapter {
    provider: String,
    api_url: String,
    voice: String,
    pitch: f32,
    speed: f32,
    output_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpTtsAdapter {
    pub fn new(provider: impl Into<String>, api_url: impl Into<String>, voice: impl Into<String>, pitch: f32, speed: f32, output_dir: PathBuf) -> Self {
        Self {
            provider: provider.into(),
            api_url: api_url.into(),
            voice: voice.into(),
            pitch,
            speed,
            output_dir,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TtsAdapter for HttpTtsAdapter {
    fn provider_name(&self) -> &str {
        &self.provider
    }
    fn voice_name(&self) -> &str {
        &self.voice
    }
    fn speed(&self) -> f32 {
        self.speed
    }
    fn pitch(&self) -> f32 {
        self.pitch
    }

    async fn text_to_speech(&self, text: &str) -> anyhow::Result<PathBuf> {
        if text.is_empty() {
            anyhow::bail!("cannot synthesize empty text");
        }
        let response = self
            .client
            .post(&self.api_url)
            .json(&serde_json::json!({
                "text": text,
                "voice": self.voice,
                "pitch": self.pitch,
                "speed": self.speed,
            }))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(format!("{}.wav", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

/// Wraps a provider adapter with the mandatory default-provider fallback
/// (§4.4: "on any failure, a wrapping factory returns the path produced by
/// a mandatory default provider — no exception propagates to the
/// Synthesizer beyond the retry budget").
struct FallbackTtsAdapter {
    primary: Arc<dyn TtsAdapter>,
    default: Arc<dyn TtsAdapter>,
}

#[async_trait]
impl TtsAdapter for FallbackTtsAdapter {
    fn provider_name(&self) -> &str {
        self.primary.provider_name()
    }
    fn voice_name(&self) -> &str {
        self.primary.voice_name()
    }
    fn speed(&self) -> f32 {
        self.primary.speed()
    }
    fn pitch(&self) -> f32 {
        self.primary.pitch()
    }

    async fn text_to_speech(&self, text: &str) -> anyhow::Result<PathBuf> {
        match self.primary.text_to_speech(text).await {
            Ok(path) => Ok(path),
            Err(err) => {
                error!(provider = self.primary.provider_name(), %err, "tts provider failed, falling back to default provider");
                self.default.text_to_speech(text).await
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TtsConfig {
    pub provider: Option<String>,
    pub config_id: Option<i64>,
    pub api_url: Option<String>,
}

/// Builds and caches `TtsAdapter`s by `(provider, configId, voice, pitch, speed)`.
pub struct TtsAdapterFactory {
    cache: Mutex<HashMap<String, Arc<dyn TtsAdapter>>>,
    output_dir: PathBuf,
}

impl TtsAdapterFactory {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { cache: Mutex::new(HashMap::new()), output_dir }
    }

    fn cache_key(provider: &str, config_id: Option<i64>, voice: &str, pitch: f32, speed: f32) -> String {
        format!("{provider}:{}:{voice}:{pitch}:{speed}", config_id.unwrap_or(-1))
    }

    /// Build (or fetch from cache) the mandatory default provider adapter.
    /// Never wrapped in a fallback itself — it IS the fallback's terminus.
    pub async fn default_adapter(&self) -> Arc<dyn TtsAdapter> {
        let key = Self::cache_key(DEFAULT_PROVIDER, None, DEFAULT_VOICE, 1.0, 1.0);
        if let Some(existing) = self.cache.lock().await.get(&key) {
            return existing.clone();
        }
        let adapter: Arc<dyn TtsAdapter> =
            Arc::new(HttpTtsAdapter::new(DEFAULT_PROVIDER, "", DEFAULT_VOICE.to_string(), 1.0, 1.0, self.output_dir.clone()));
        self.cache.lock().await.insert(key, adapter.clone());
        adapter
    }

    pub async fn get(&self, config: Option<&TtsConfig>, voice: &str, pitch: f32, speed: f32) -> Arc<dyn TtsAdapter> {
        let default_config = TtsConfig { provider: Some(DEFAULT_PROVIDER.to_string()), ..Default::default() };
        let config = config.unwrap_or(&default_config);
        let provider = config.provider.clone().unwrap_or_else(|| DEFAULT_PROVIDER.to_string()).to_lowercase();
        let key = Self::cache_key(&provider, config.config_id, voice, pitch, speed);

        if let Some(existing) = self.cache.lock().await.get(&key) {
            return existing.clone();
        }

        let primary: Arc<dyn TtsAdapter> = match &config.api_url {
            Some(url) => Arc::new(HttpTtsAdapter::new(provider.clone(), url.clone(), voice.to_string(), pitch, speed, self.output_dir.clone())),
            None => {
                error!(provider = %provider, "tts provider configured without apiUrl, falling back to default provider");
                Arc::new(HttpTtsAdapter::new(DEFAULT_PROVIDER, "", voice.to_string(), pitch, speed, self.output_dir.clone()))
            }
        };

        // The default provider is the fallback's terminus, not wrapped in
        // itself (`provider == DEFAULT_PROVIDER` short-circuits below).
        let adapter: Arc<dyn TtsAdapter> = if provider == DEFAULT_PROVIDER {
            primary
        } else {
            let default = self.default_adapter().await;
            Arc::new(FallbackTtsAdapter { primary, default })
        };
        self.cache.lock().await.insert(key, adapter.clone());
        adapter
    }

    pub async fn remove_cache(&self, provider: &str, config_id: Option<i64>) {
        let prefix = format!("{}:{}:", provider.to_lowercase(), config_id.unwrap_or(-1));
        self.cache.lock().await.retain(|k, _| !k.starts_with(&prefix));
    }
}

/// Maps a normalized `[0.5, 2.0]` UI speed/pitch slider to whatever scale
/// a provider expects natively (some providers want a percentage delta,
/// e.g. `+20%`, rather than a multiplier).
pub fn speed_to_percent_delta(speed: f32) -> i32 {
    ((speed - 1.0) * 100.0).round() as i32
}

pub fn pitch_to_percent_delta(pitch: f32) -> i32 {
    ((pitch - 1.0) * 100.0).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_caches_by_full_voice_tuple() {
        let factory = TtsAdapterFactory::new(PathBuf::from("/tmp/xiaozhi-test-audio"));
        let config = TtsConfig { provider: Some("edge".into()), config_id: None, api_url: Some("http://x".into()) };
        let a = factory.get(Some(&config), "voice-a", 1.0, 1.0).await;
        let b = factory.get(Some(&config), "voice-a", 1.0, 1.0).await;
        let c = factory.get(Some(&config), "voice-b", 1.0, 1.0).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn percent_delta_rounds_to_nearest_integer() {
        assert_eq!(speed_to_percent_delta(1.2), 20);
        assert_eq!(pitch_to_percent_delta(0.9), -10);
    }

    struct AlwaysFailsAdapter;
    #[async_trait]
    impl TtsAdapter for AlwaysFailsAdapter {
        fn provider_name(&self) -> &str {
            "always-fails"
        }
        fn voice_name(&self) -> &str {
            "n/a"
        }
        fn speed(&self) -> f32 {
            1.0
        }
        fn pitch(&self) -> f32 {
            1.0
        }
        async fn text_to_speech(&self, _text: &str) -> anyhow::Result<PathBuf> {
            anyhow::bail!("provider unreachable")
        }
    }

    struct AlwaysSucceedsAdapter(PathBuf);
    #[async_trait]
    impl TtsAdapter for AlwaysSucceedsAdapter {
        fn provider_name(&self) -> &str {
            "stand-in-default"
        }
        fn voice_name(&self) -> &str {
            "n/a"
        }
        fn speed(&self) -> f32 {
            1.0
        }
        fn pitch(&self) -> f32 {
            1.0
        }
        async fn text_to_speech(&self, _text: &str) -> anyhow::Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn fallback_adapter_uses_default_provider_when_primary_fails() {
        let expected = PathBuf::from("/tmp/default-output.wav");
        let adapter = FallbackTtsAdapter {
            primary: Arc::new(AlwaysFailsAdapter),
            default: Arc::new(AlwaysSucceedsAdapter(expected.clone())),
        };
        let path = adapter.text_to_speech("hello").await.unwrap();
        assert_eq!(path, expected);
    }

    #[tokio::test]
    async fn factory_wraps_non_default_provider_in_fallback() {
        let factory = TtsAdapterFactory::new(std::env::temp_dir());
        let config = TtsConfig { provider: Some("aliyun".into()), config_id: None, api_url: Some("http://x".into()) };
        let adapter = factory.get(Some(&config), "voice-a", 1.0, 1.0).await;
        // The wrapper still reports the primary's identity, but a failed
        // primary call must not propagate past it.
        assert_eq!(adapter.provider_name(), "aliyun");
    }
}
