use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::Message,
};

use tgw_core::{
    config::Config,
    ports::{Delivery, RecordPosition, UpdateSource},
    update::InboundRecord,
    Result,
};

use crate::{base_client_config, broker_err, is_fatal};

/// Pause after a recoverable receive error before polling again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consumer-group subscription to the inbound topic.
///
/// Offsets are stored as records are yielded and committed in the
/// background (at-least-once).
pub struct KafkaUpdateSource {
    consumer: Option<StreamConsumer>,
}

impl KafkaUpdateSource {
    pub fn connect(cfg: &Config) -> Result<Self> {
        let mut config = base_client_config(cfg);
        config
            .set("group.id", &cfg.consumer_group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", cfg.auto_offset_reset.as_str());

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| broker_err("failed to create consumer", e))?;
        consumer
            .subscribe(&[cfg.incoming_topic.as_str()])
            .map_err(|e| broker_err("failed to subscribe", e))?;

        tracing::info!(
            topic = %cfg.incoming_topic,
            group = %cfg.consumer_group,
            "kafka consumer subscribed"
        );
        Ok(Self {
            consumer: Some(consumer),
        })
    }
}

/// Recoverable receive errors are logged and yield `Ok`; librdkafka
/// reconnects on its own. Fatal ones end the worker.
pub(crate) fn check_receive_error(e: KafkaError) -> Result<()> {
    if is_fatal(&e) {
        return Err(broker_err("failed to receive", e));
    }
    tracing::warn!(error = %e, "kafka receive error, retrying");
    Ok(())
}

/// Turn a raw payload into a delivery. Anything that is not a JSON record
/// object becomes `Delivery::Malformed`.
pub(crate) fn decode(position: RecordPosition, payload: Option<&[u8]>) -> Delivery {
    let Some(bytes) = payload else {
        return Delivery::Malformed {
            position,
            reason: "record has no payload".to_string(),
        };
    };

    match InboundRecord::from_slice(bytes) {
        Ok(record) => Delivery::Record { position, record },
        Err(e) => Delivery::Malformed {
            position,
            reason: e.to_string(),
        },
    }
}

#[async_trait]
impl UpdateSource for KafkaUpdateSource {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Err(tgw_core::Error::Broker("consumer is closed".to_string()));
        };

        let msg = loop {
            match consumer.recv().await {
                Ok(msg) => break msg,
                Err(e) => {
                    check_receive_error(e)?;
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        };

        let position = RecordPosition {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
        };
        Ok(decode(position, msg.payload()))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };

        // Nothing consumed yet means nothing to commit; that is not an error.
        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            tracing::debug!(error = %e, "final offset commit skipped");
        }
        consumer.unsubscribe();

        // Dropping leaves the group and may block while librdkafka flushes.
        tokio::task::spawn_blocking(move || drop(consumer))
            .await
            .map_err(|e| tgw_core::Error::Broker(format!("consumer close task failed: {e}")))?;
        tracing::info!("kafka consumer closed");
        Ok(())
    }
}
