//! NATS-backed provider and transcript sink

pub mod client;
pub mod provider;
pub mod sink;

pub use client::NatsClient;
pub use provider::{NatsSpeechProvider, SpeechRequest};
pub use sink::NatsTranscriptSink;
