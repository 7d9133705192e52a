use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::client::NatsClient;
use crate::messages::PCM16;
use crate::provider::{CallContext, SpeechProvider, Transcript};

/// Request body sent to the recognition service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub interaction_id: String,
    pub tenant_id: String,
    pub seq: u64,
    pub sample_rate: u32,
    pub encoding: String,
    /// Base64-encoded PCM bytes
    pub audio: String,
}

impl SpeechRequest {
    pub fn new(audio: &[u8], context: &CallContext) -> Self {
        Self {
            interaction_id: context.interaction_id.clone(),
            tenant_id: context.tenant_id.clone(),
            seq: context.seq,
            sample_rate: context.sample_rate,
            encoding: PCM16.to_string(),
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallRef {
    interaction_id: String,
}

#[derive(Debug, Deserialize)]
struct Pong {}

/// Speech provider reached over NATS request/reply
///
/// Chunks go to `subject`, releases to `<subject>.release` and heartbeats
/// to `<subject>.ping`.
pub struct NatsSpeechProvider {
    client: NatsClient,
    subject: String,
    timeout: Duration,
}

impl NatsSpeechProvider {
    pub fn new(client: NatsClient, subject: &str, timeout: Duration) -> Self {
        Self {
            client,
            subject: subject.to_string(),
            timeout,
        }
    }

    fn release_subject(&self) -> String {
        format!("{}.release", self.subject)
    }

    fn ping_subject(&self) -> String {
        format!("{}.ping", self.subject)
    }
}

#[async_trait]
impl SpeechProvider for NatsSpeechProvider {
    async fn send_audio_chunk(&self, audio: &[u8], context: &CallContext) -> Result<Transcript> {
        let request = SpeechRequest::new(audio, context);
        let transcript: Transcript = self
            .client
            .request_json(&self.subject, &request, self.timeout)
            .await?;

        debug!(
            "Provider replied for {}#{} ({} chars, final={})",
            context.interaction_id,
            context.seq,
            transcript.text.len(),
            transcript.is_final
        );
        Ok(transcript)
    }

    async fn release(&self, interaction_id: &str) -> Result<()> {
        self.client
            .publish_json(
                &self.release_subject(),
                &CallRef {
                    interaction_id: interaction_id.to_string(),
                },
            )
            .await
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn supports_heartbeat(&self) -> bool {
        true
    }

    async fn heartbeat(&self, interaction_id: &str) -> Result<()> {
        let _: Pong = self
            .client
            .request_json(
                &self.ping_subject(),
                &CallRef {
                    interaction_id: interaction_id.to_string(),
                },
                self.timeout,
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
