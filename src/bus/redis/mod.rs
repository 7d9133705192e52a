mod adapter;
mod client;
pub mod wire;

pub use adapter::{RedisStreamBus, StreamBusConfig, DATA_FIELD};
pub use client::{classify, RedisConnector, RedisStreamClient};
