use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
};

use tgw_core::{command::OutboundCommand, config::Config, ports::ResponseSink, Error, Result};

use crate::{base_client_config, broker_err, is_fatal};

/// Publisher for the outbound topic. Each publish waits for `acks=all`.
pub struct KafkaResponseSink {
    producer: Option<FutureProducer>,
    topic: String,
    publish_timeout: Duration,
}

impl KafkaResponseSink {
    pub fn connect(cfg: &Config) -> Result<Self> {
        let mut config = base_client_config(cfg);
        config
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                cfg.publish_timeout.as_millis().to_string(),
            );

        let producer: FutureProducer = config
            .create()
            .map_err(|e| broker_err("failed to create producer", e))?;

        tracing::info!(topic = %cfg.outgoing_topic, "kafka producer ready");
        Ok(Self {
            producer: Some(producer),
            topic: cfg.outgoing_topic.clone(),
            publish_timeout: cfg.publish_timeout,
        })
    }
}

#[async_trait]
impl ResponseSink for KafkaResponseSink {
    async fn publish(&mut self, key: &str, cmd: &OutboundCommand) -> Result<()> {
        let Some(producer) = self.producer.as_ref() else {
            return Err(Error::Broker("producer is closed".to_string()));
        };
        let payload = cmd.to_json()?;

        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);
        match producer
            .send(record, Timeout::After(self.publish_timeout))
            .await
        {
            Ok(delivery) => {
                tracing::debug!(topic = %self.topic, ?delivery, "publish acknowledged");
                Ok(())
            }
            Err((e, _)) if is_fatal(&e) => Err(broker_err("producer failed", e)),
            Err((e, _)) => Err(Error::Delivery(format!("publish to {} failed: {e}", self.topic))),
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };

        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::Broker(format!("producer close task failed: {e}")))?;
        flushed.map_err(|e| broker_err("failed to flush producer", e))?;

        tracing::info!("kafka producer closed");
        Ok(())
    }
}
