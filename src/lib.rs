pub mod bus;
pub mod config;
pub mod health;
pub mod http;
pub mod messages;
pub mod nats;
pub mod provider;
pub mod resilience;
pub mod sink;
pub mod worker;

pub use bus::{create_bus, ConnectionPool, Envelope, MessageBus};
pub use config::Config;
pub use health::ConnectionHealthMonitor;
pub use http::{create_router, AppState};
pub use messages::{AudioFrameMessage, CallEndMessage, TranscriptMessage};
pub use provider::{CallContext, SpeechProvider, Transcript};
pub use resilience::CircuitBreaker;
pub use sink::TranscriptSink;
pub use worker::{AudioWorker, WorkerConfig};
