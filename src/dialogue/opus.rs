//! Frame-aligned Opus⇄PCM conversion with per-session stream state (§A.4.1).
//!
//! Fixed parameters: 16 kHz, mono, 16-bit signed PCM, frame = 960 samples
//! (60 ms), encode profile = audio (voice).

use crate::dialogue::error::{DialogueError, DialogueResult};
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use std::sync::Mutex;

/// Samples per Opus frame at 16 kHz / 60 ms.
pub const FRAME_SAMPLES: usize = 960;
/// Bytes per frame of 16-bit PCM.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

pub struct OpusCodec {
    decoder: Mutex<Decoder>,
    encoder: Mutex<Encoder>,
    /// Samples carried over from the previous `encode_stream` call.
    leftover: Mutex<Vec<i16>>,
}

impl OpusCodec {
    pub fn new() -> DialogueResult<Self> {
        let decoder = Self::new_decoder()?;
        let encoder = Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Voip)
            .map_err(|e| DialogueError::Codec(format!("encoder init: {e}")))?;
        Ok(Self {
            decoder: Mutex::new(decoder),
            encoder: Mutex::new(encoder),
            leftover: Mutex::new(Vec::new()),
        })
    }

    fn new_decoder() -> DialogueResult<Decoder> {
        Decoder::new(SampleRate::Hz16000, Channels::Mono)
            .map_err(|e| DialogueError::Codec(format!("decoder init: {e}")))
    }

    /// Decode one Opus frame to 16-bit PCM bytes (little-endian).
    ///
    /// On decoder error, the decoder is reset and an empty buffer is
    /// returned — the caller drops the frame rather than propagating.
    pub fn decode(&self, opus_bytes: &[u8]) -> Vec<u8> {
        let mut decoder = self.decoder.lock().unwrap();
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        match decoder.decode(Some(opus_bytes), &mut pcm, false) {
            Ok(samples) => {
                pcm.truncate(samples);
                i16_slice_to_bytes(&pcm)
            }
            Err(e) => {
                tracing::warn!("opus decode error, resetting decoder: {e}");
                if let Ok(fresh) = Self::new_decoder() {
                    *decoder = fresh;
                }
                Vec::new()
            }
        }
    }

    /// Encode a PCM byte stream into 960-sample Opus frames.
    ///
    /// When `is_stream` is true, any trailing partial frame (<960 samples)
    /// is retained for the next call; when false, it is dropped. Invariant:
    /// total samples in == total samples out modulo the retained leftover.
    pub fn encode_stream(&self, pcm_bytes: &[u8], is_stream: bool) -> Vec<Vec<u8>> {
        let incoming = bytes_to_i16_slice(pcm_bytes);

        let mut leftover = self.leftover.lock().unwrap();
        leftover.extend_from_slice(&incoming);

        let mut frames = Vec::new();
        let mut encoder = self.encoder.lock().unwrap();
        let mut offset = 0;
        while leftover.len() - offset >= FRAME_SAMPLES {
            let chunk = &leftover[offset..offset + FRAME_SAMPLES];
            let mut out = vec![0u8; 4000];
            match encoder.encode(chunk, &mut out) {
                Ok(n) => {
                    out.truncate(n);
                    frames.push(out);
                }
                Err(e) => {
                    tracing::warn!("opus encode error, dropping frame: {e}");
                }
            }
            offset += FRAME_SAMPLES;
        }

        if is_stream {
            leftover.drain(0..offset);
        } else {
            leftover.clear();
        }

        frames
    }
}

fn bytes_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn i16_slice_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_stream_retains_leftover_samples() {
        let codec = OpusCodec::new().expect("codec init");
        // One and a half frames worth of silence.
        let pcm = vec![0u8; FRAME_BYTES + FRAME_BYTES / 2];
        let frames = codec.encode_stream(&pcm, true);
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.leftover.lock().unwrap().len(), FRAME_SAMPLES / 2);
    }

    #[test]
    fn encode_stream_drops_leftover_when_not_streaming() {
        let codec = OpusCodec::new().expect("codec init");
        let pcm = vec![0u8; FRAME_BYTES / 2];
        let frames = codec.encode_stream(&pcm, false);
        assert!(frames.is_empty());
        assert!(codec.leftover.lock().unwrap().is_empty());
    }

    #[test]
    fn decode_recovers_from_garbage_input() {
        let codec = OpusCodec::new().expect("codec init");
        let pcm = codec.decode(&[0xff, 0x00, 0x01]);
        assert!(pcm.is_empty());
    }
}
