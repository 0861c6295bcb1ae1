use std::time::Duration;

use async_trait::async_trait;

use crate::{command::OutboundCommand, update::InboundRecord, Result};

/// Where a delivery came from, for logs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// One delivery from the inbound topic.
#[derive(Debug)]
pub enum Delivery {
    Record {
        position: RecordPosition,
        record: InboundRecord,
    },
    /// The broker delivered something that is not a valid inbound record.
    /// It is already consumed; the caller only logs it.
    Malformed {
        position: RecordPosition,
        reason: String,
    },
}

/// Hexagonal port for the inbound queue.
///
/// Every `Err` returned here is broker-level and ends the worker.
#[async_trait]
pub trait UpdateSource: Send {
    /// Wait for the next delivery. Never returns "end of stream".
    async fn next_delivery(&mut self) -> Result<Delivery>;

    /// Leave the consumer group and release the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Hexagonal port for the outbound queue.
#[async_trait]
pub trait ResponseSink: Send {
    /// Publish one command and wait for the broker acknowledgement.
    ///
    /// `Error::Delivery` is per-message; `Error::Broker` ends the worker.
    async fn publish(&mut self, key: &str, cmd: &OutboundCommand) -> Result<()>;

    /// Flush in-flight publishes (bounded by `timeout`) and release the connection.
    async fn close(&mut self, timeout: Duration) -> Result<()>;
}

/// Lifecycle signals for the sidecar. Implementations absorb their own failures.
#[async_trait]
pub trait SidecarNotifier: Send + Sync {
    async fn notify_start(&self);
    async fn notify_end(&self, duration: Duration);
}
