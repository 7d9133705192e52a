//! Wire messages exchanged over the bus
//!
//! Inbound payloads are validated here and turned into [`InboundMessage`]
//! before they reach the worker.

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::Envelope;

pub const PCM16: &str = "pcm16";

/// Audio frame published by the call ingress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub tenant_id: String,
    pub interaction_id: String,
    /// Monotonic per call; used for diagnostics, not deduplication
    pub seq: u64,
    pub timestamp_ms: i64,
    pub sample_rate: u32,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Base64-encoded PCM bytes
    pub audio: String,
}

fn default_encoding() -> String {
    PCM16.to_string()
}

impl AudioFrameMessage {
    pub fn new(
        tenant_id: &str,
        interaction_id: &str,
        seq: u64,
        sample_rate: u32,
        pcm: &[u8],
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            interaction_id: interaction_id.to_string(),
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            sample_rate,
            encoding: PCM16.to_string(),
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    /// Decode and validate the audio payload
    pub fn decode_audio(&self) -> Result<Vec<u8>, MessageError> {
        if self.encoding != PCM16 {
            return Err(MessageError::UnsupportedEncoding(self.encoding.clone()));
        }
        if self.sample_rate == 0 {
            return Err(MessageError::InvalidField {
                field: "sample_rate",
                reason: "must be greater than 0".to_string(),
            });
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.audio.as_bytes())
            .map_err(|e| MessageError::InvalidAudio(e.to_string()))?;

        if bytes.is_empty() {
            return Err(MessageError::EmptyAudio);
        }
        if bytes.len() % 2 != 0 {
            return Err(MessageError::InvalidAudio(format!(
                "odd byte count {} for 16-bit samples",
                bytes.len()
            )));
        }

        Ok(bytes)
    }
}

/// Signals that no more frames are expected for a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEndMessage {
    pub interaction_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub provider_call_id: Option<String>,
}

/// Transcript emitted downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub interaction_id: String,
    pub tenant_id: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: TranscriptKind,
    pub text: String,
    pub confidence: Option<f32>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Partial,
    Final,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message on unexpected topic {0}")]
    UnknownTopic(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unsupported audio encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("Audio payload is empty")]
    EmptyAudio,
}

/// A validated inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AudioFrame(AudioFrameMessage),
    CallEnd(CallEndMessage),
}

impl InboundMessage {
    /// Parse an envelope according to the topic it arrived on
    pub fn parse(
        topic: &str,
        envelope: &Envelope,
        audio_topic: &str,
        call_end_topic: &str,
    ) -> Result<Self, MessageError> {
        if topic == audio_topic {
            let frame: AudioFrameMessage = envelope
                .decode()
                .map_err(|e| MessageError::InvalidPayload(e.to_string()))?;
            if frame.interaction_id.is_empty() {
                return Err(MessageError::InvalidField {
                    field: "interaction_id",
                    reason: "empty".to_string(),
                });
            }
            Ok(InboundMessage::AudioFrame(frame))
        } else if topic == call_end_topic {
            let end: CallEndMessage = envelope
                .decode()
                .map_err(|e| MessageError::InvalidPayload(e.to_string()))?;
            if end.interaction_id.is_empty() {
                return Err(MessageError::InvalidField {
                    field: "interaction_id",
                    reason: "empty".to_string(),
                });
            }
            Ok(InboundMessage::CallEnd(end))
        } else {
            Err(MessageError::UnknownTopic(topic.to_string()))
        }
    }
}
