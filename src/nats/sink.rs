use anyhow::Result;
use async_trait::async_trait;

use super::client::NatsClient;
use crate::messages::{TranscriptKind, TranscriptMessage};
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::sink::TranscriptSink;

pub const PARTIAL_SUBJECT: &str = "stt.text.partial";
pub const FINAL_SUBJECT: &str = "stt.text.final";

/// Publishes transcripts to `stt.text.partial` / `stt.text.final`
pub struct NatsTranscriptSink {
    client: NatsClient,
    retry: RetryPolicy,
}

impl NatsTranscriptSink {
    pub fn new(client: NatsClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn subject_for(kind: TranscriptKind) -> &'static str {
        match kind {
            TranscriptKind::Partial => PARTIAL_SUBJECT,
            TranscriptKind::Final => FINAL_SUBJECT,
        }
    }
}

#[async_trait]
impl TranscriptSink for NatsTranscriptSink {
    async fn emit(&self, transcript: &TranscriptMessage) -> Result<()> {
        let subject = Self::subject_for(transcript.kind);
        retry_with_backoff(
            &self.retry,
            "transcript publish",
            |_| true,
            || self.client.publish_json(subject, transcript),
        )
        .await
    }

    fn name(&self) -> &str {
        "nats"
    }
}
