//! Speech-recognition provider seam
//!
//! The worker only ever talks to a provider through [`SpeechProvider`], and
//! only through the circuit breaker.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-call details sent with every audio chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub interaction_id: String,
    pub tenant_id: String,
    /// Flush sequence number within the call
    pub seq: u64,
    pub sample_rate: u32,
}

/// Provider response for one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub is_final: bool,
}

impl Transcript {
    /// Providers answer "no speech" with empty or whitespace-only text
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Recognize one chunk of PCM16 mono audio
    async fn send_audio_chunk(&self, audio: &[u8], context: &CallContext) -> Result<Transcript>;

    /// Release any per-call state held by the provider
    async fn release(&self, _interaction_id: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn supports_heartbeat(&self) -> bool {
        false
    }

    /// Liveness check for a call's provider connection
    async fn heartbeat(&self, _interaction_id: &str) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_empty() {
        let blank = Transcript {
            text: "  \n".to_string(),
            ..Default::default()
        };
        assert!(blank.is_empty());

        let spoken = Transcript {
            text: "hello".to_string(),
            confidence: Some(0.9),
            is_final: true,
        };
        assert!(!spoken.is_empty());
    }

    #[test]
    fn test_transcript_defaults_when_fields_missing() {
        let t: Transcript = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(t.confidence, None);
        assert!(!t.is_final);
    }
}
