use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

pub const DEFAULT_KAFKA_BROKERS: &str = "localhost:9092";
pub const DEFAULT_SIDECAR_URL: &str = "http://localhost:8081";

/// Where a consumer group without committed offsets starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Typed, immutable worker configuration.
///
/// Built once at startup and handed to each component; nothing below the
/// binary reads the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Bot identity
    pub bot_id: String,
    pub bot_token: String,

    // Kafka
    pub kafka_brokers: Vec<String>,
    pub incoming_topic: String,
    pub outgoing_topic: String,
    pub consumer_group: String,
    pub auto_offset_reset: OffsetReset,
    pub publish_timeout: Duration,

    // Sidecar
    pub sidecar_url: String,
    pub sidecar_timeout: Duration,

    // Lifecycle
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load from the process environment (plus `.env` if present).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    ///
    /// Required variables are checked in a fixed order and the first missing
    /// one is reported.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);
        let require = |key: &str| {
            get(key).ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
        };

        let bot_id = require("BOT_ID")?;
        let bot_token = require("BOT_TOKEN")?;
        let incoming_topic = require("KAFKA_INCOMING_TOPIC")?;
        let outgoing_topic = require("KAFKA_OUTGOING_TOPIC")?;
        let consumer_group = get("KAFKA_CONSUMER_GROUP")
            .or_else(|| get("CONSUMER_GROUP"))
            .ok_or_else(|| {
                Error::Config("KAFKA_CONSUMER_GROUP environment variable is required".to_string())
            })?;

        let kafka_brokers =
            parse_csv(&get("KAFKA_BROKERS").unwrap_or_else(|| DEFAULT_KAFKA_BROKERS.to_string()));
        if kafka_brokers.is_empty() {
            return Err(Error::Config(
                "KAFKA_BROKERS must list at least one broker".to_string(),
            ));
        }

        let auto_offset_reset = match get("KAFKA_AUTO_OFFSET_RESET")
            .map(|s| s.trim().to_lowercase())
            .as_deref()
        {
            None | Some("earliest") => OffsetReset::Earliest,
            Some("latest") => OffsetReset::Latest,
            Some(other) => {
                return Err(Error::Config(format!(
                    "KAFKA_AUTO_OFFSET_RESET must be 'earliest' or 'latest', got '{other}'"
                )))
            }
        };

        let sidecar_url = get("SIDECAR_URL")
            .unwrap_or_else(|| DEFAULT_SIDECAR_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let millis = |key: &str, default: u64| -> Result<Duration> {
            match get(key) {
                None => Ok(Duration::from_millis(default)),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| Error::Config(format!("{key} must be a whole number of ms"))),
            }
        };

        Ok(Self {
            bot_id,
            bot_token,
            kafka_brokers,
            incoming_topic,
            outgoing_topic,
            consumer_group,
            auto_offset_reset,
            publish_timeout: millis("KAFKA_PUBLISH_TIMEOUT_MS", 5_000)?,
            sidecar_url,
            sidecar_timeout: millis("SIDECAR_TIMEOUT_MS", 1_000)?,
            shutdown_timeout: millis("SHUTDOWN_TIMEOUT_MS", 10_000)?,
        })
    }

    /// Brokers in the comma-separated form Kafka clients expect.
    pub fn bootstrap_servers(&self) -> String {
        self.kafka_brokers.join(",")
    }

    /// Startup banner lines. Never includes the bot token.
    pub fn summary(&self) -> Vec<String> {
        vec![
            format!("Starting echo bot worker for {}", self.bot_id),
            format!("Kafka brokers: {}", self.bootstrap_servers()),
            format!("Incoming topic: {}", self.incoming_topic),
            format!("Outgoing topic: {}", self.outgoing_topic),
            format!("Consumer group: {}", self.consumer_group),
            format!("Sidecar URL: {}", self.sidecar_url),
        ]
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
