//! Kafka adapter (rdkafka).
//!
//! Implements the `tgw-core` UpdateSource / ResponseSink ports over a
//! consumer-group subscription and an `acks=all` producer.

use rdkafka::{
    error::{KafkaError, RDKafkaErrorCode},
    ClientConfig,
};

use tgw_core::{config::Config, errors::Error};

pub mod consumer;
pub mod producer;

pub use consumer::KafkaUpdateSource;
pub use producer::KafkaResponseSink;

/// Settings shared by the consumer and the producer.
fn base_client_config(cfg: &Config) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", cfg.bootstrap_servers())
        .set("client.id", format!("tgw-{}", cfg.bot_id));
    config
}

/// Only librdkafka's fatal state is unrecoverable; transport failures and
/// "all brokers down" clear once a broker is reachable again.
fn is_fatal(e: &KafkaError) -> bool {
    e.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

fn broker_err(context: &str, e: KafkaError) -> Error {
    Error::Broker(format!("{context}: {e}"))
}
