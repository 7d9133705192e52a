use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::wire;
use crate::bus::stream::{
    Connector, GroupStatus, PendingEntry, StreamBatch, StreamClient, StreamError,
};

/// Redis Streams client over a single multiplexed connection
///
/// Redis answers a connection's commands in order, so an `XREADGROUP ...
/// BLOCK` parks everything queued behind it. The stream adapter issues
/// blocking reads only on a connection leased for that one reader.
pub struct RedisStreamClient {
    conn: MultiplexedConnection,
}

impl RedisStreamClient {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

/// Map a Redis error onto the adapter's recovery classes
pub fn classify(err: &RedisError) -> StreamError {
    let text = err.to_string();
    if text.to_ascii_lowercase().contains("max number of clients") {
        StreamError::ResourceExhausted(text)
    } else if err.is_connection_refusal() || err.is_connection_dropped() {
        StreamError::ConnectionRefused(text)
    } else {
        StreamError::Other(text)
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: usize,
    ) -> Result<String, StreamError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (key, value) in fields {
            cmd.arg(*key).arg(*value);
        }

        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await.map_err(|e| classify(&e))?;
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<GroupStatus, StreamError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!("Created consumer group {} on {} at {}", group, stream, start_id);
                Ok(GroupStatus::Created)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists on {}", group, stream);
                Ok(GroupStatus::AlreadyExists)
            }
            Err(e) => Err(classify(&e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<StreamBatch, StreamError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let mut conn = self.conn.clone();
        let reply: Value = cmd.query_async(&mut conn).await.map_err(|e| classify(&e))?;
        Ok(wire::parse_read_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;

        let (entries, _skipped) = wire::parse_pending(reply);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<StreamBatch, StreamError> {
        if ids.is_empty() {
            return Ok(StreamBatch::default());
        }

        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;
        Ok(wire::parse_entries(reply))
    }
}

/// Opens multiplexed Redis connections for the pool
#[derive(Debug, Default, Clone)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn StreamClient>, StreamError> {
        let client = redis::Client::open(url).map_err(|e| classify(&e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify(&e))?;
        Ok(Arc::new(RedisStreamClient::new(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_classifies_connection_limit() {
        let err = RedisError::from((
            ErrorKind::ResponseError,
            "An error was signalled by the server",
            "ERR max number of clients reached".to_string(),
        ));
        assert!(matches!(classify(&err), StreamError::ResourceExhausted(_)));
    }

    #[test]
    fn test_classifies_refused_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RedisError::from(io);
        assert!(matches!(classify(&err), StreamError::ConnectionRefused(_)));
    }

    #[test]
    fn test_other_errors_are_transient() {
        let err = RedisError::from((ErrorKind::TypeError, "unexpected reply type"));
        assert!(matches!(classify(&err), StreamError::Other(_)));
    }
}
