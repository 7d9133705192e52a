//! Message bus abstraction and its broker backends
//!
//! - [`MessageBus`]: publish / subscribe / ack / close contract
//! - [`redis::RedisStreamBus`]: Redis Streams consumer groups over a shared [`ConnectionPool`]
//! - `kafka::KafkaBus`: partitioned-log backend (cargo feature `kafka`)
//! - [`create_bus`]: picks the backend from configuration

mod adapter;
mod envelope;
mod error;
pub mod factory;
pub mod pool;
pub mod redis;
pub mod stream;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use adapter::{
    BusMetrics, BusMetricsSnapshot, Delivery, FnHandler, MessageBus, MessageHandler,
    SubscriptionHandle,
};
pub use envelope::Envelope;
pub use error::{BusError, BusResult};
pub use factory::create_bus;
pub use pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
pub use stream::{
    Connector, GroupStatus, PendingEntry, StreamBatch, StreamClient, StreamEntry, StreamError,
};
