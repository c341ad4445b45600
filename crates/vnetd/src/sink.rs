//! Downstream sinks for published records.
//!
//! A sink receives fully namespaced lines one at a time, in queue order.
//! Write failures are returned to the forwarder, which logs them; no sink
//! retries on its own beyond what the Redis connection manager does.

use crate::error::SinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Separator between field and value in a scalar record.
pub const FIELD_SEPARATOR: &str = ": ";

/// Destination for namespaced records.
#[async_trait]
pub trait Sink: Send {
    async fn print(&mut self, line: &str) -> Result<(), SinkError>;
}

/// Splits `"<field>: <value>"`.
pub fn split_record(line: &str) -> Result<(&str, &str), SinkError> {
    line.split_once(FIELD_SEPARATOR)
        .ok_or_else(|| SinkError::Malformed(line.to_string()))
}

fn redis_url(addr: &str, db: i64) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}/{}", addr, db)
    }
}

async fn connect(url: String) -> Result<ConnectionManager, SinkError> {
    let client = Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Stores scalar records as fields of one Redis hash.
pub struct RedisSink {
    conn: ConnectionManager,
    hash: String,
}

impl RedisSink {
    #[instrument(skip_all, fields(host, port, db))]
    pub async fn connect(host: &str, port: u16, db: i64, hash: &str) -> Result<Self, SinkError> {
        debug!(host, port, db, "Connecting to Redis");
        let conn = connect(redis_url(&format!("{}:{}", host, port), db)).await?;
        info!(hash, "Redis sink connected");
        Ok(Self {
            conn,
            hash: hash.to_string(),
        })
    }
}

#[async_trait]
impl Sink for RedisSink {
    async fn print(&mut self, line: &str) -> Result<(), SinkError> {
        let (field, value) = split_record(line)?;
        let _: () = self.conn.hset(&self.hash, field, value).await?;
        Ok(())
    }
}

/// Publishes high-frequency lines on a Redis channel of the configured
/// broker, reconnecting whenever the broker address changes.
pub struct BrokerSink {
    broker: watch::Receiver<String>,
    channel: String,
    conn: Option<ConnectionManager>,
}

impl BrokerSink {
    pub fn new(broker: watch::Receiver<String>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
            conn: None,
        }
    }

    async fn refresh(&mut self) -> Result<(), SinkError> {
        if !self.broker.has_changed().unwrap_or(false) {
            return Ok(());
        }
        let addr = self.broker.borrow_and_update().clone();
        self.conn = None;
        if addr.is_empty() {
            info!("hf broker cleared");
            return Ok(());
        }
        info!(broker = %addr, "Connecting to hf broker");
        self.conn = Some(connect(redis_url(&addr, 0)).await?);
        Ok(())
    }
}

#[async_trait]
impl Sink for BrokerSink {
    async fn print(&mut self, line: &str) -> Result<(), SinkError> {
        self.refresh().await?;
        match self.conn.as_mut() {
            Some(conn) => {
                let _: () = conn.publish(&self.channel, line).await?;
                Ok(())
            }
            None => {
                debug!(line, "no hf broker, dropped");
                Ok(())
            }
        }
    }
}

/// Writes records to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn print(&mut self, line: &str) -> Result<(), SinkError> {
        info!(target: "vnetd::record", "{}", line);
        Ok(())
    }
}

/// Collects records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the collected lines.
    pub fn lines(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.lines)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn print(&mut self, line: &str) -> Result<(), SinkError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
