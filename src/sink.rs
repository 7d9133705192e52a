//! Downstream destinations for transcripts

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::bus::{BusError, Envelope, MessageBus};
use crate::messages::TranscriptMessage;
use crate::resilience::{retry_with_backoff, RetryPolicy};

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn emit(&self, transcript: &TranscriptMessage) -> Result<()>;

    fn name(&self) -> &str;
}

/// Publishes transcripts back onto the message bus
pub struct BusTranscriptSink {
    bus: Arc<dyn MessageBus>,
    topic: String,
    retry: RetryPolicy,
}

impl BusTranscriptSink {
    pub fn new(bus: Arc<dyn MessageBus>, topic: &str, retry: RetryPolicy) -> Self {
        Self {
            bus,
            topic: topic.to_string(),
            retry,
        }
    }
}

#[async_trait]
impl TranscriptSink for BusTranscriptSink {
    async fn emit(&self, transcript: &TranscriptMessage) -> Result<()> {
        let envelope = Envelope::wrap(&self.topic, transcript)?;

        let id = retry_with_backoff(
            &self.retry,
            "transcript publish",
            |e: &BusError| e.is_retryable(),
            || self.bus.publish(&self.topic, &envelope),
        )
        .await?;

        debug!(
            "Published transcript {}#{} to {} as {}",
            transcript.interaction_id, transcript.seq, self.topic, id
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "bus"
    }
}
