//! Inbound records as published by the gateway onto the per-bot topic.
//!
//! The record envelope is decoded strictly (it must be a JSON object), but the
//! Telegram update inside it is kept loose and only classified when handled,
//! so a single odd update never poisons the stream.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    domain::{CallbackId, ChatId, MessageId, UpdateId},
    Error, Result,
};

/// One record from the inbound topic.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundRecord {
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub update: RawUpdate,
}

impl InboundRecord {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Telegram update as received, before classification.
///
/// `update_id` is only used for logging, so any JSON value is accepted.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawUpdate {
    #[serde(default)]
    pub update_id: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub callback_query: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl RawUpdate {
    /// Top-level keys present on the update, for "unhandled" logging.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if self.update_id.is_some() {
            keys.push("update_id".to_string());
        }
        if self.message.is_some() {
            keys.push("message".to_string());
        }
        if self.callback_query.is_some() {
            keys.push("callback_query".to_string());
        }
        keys.extend(self.rest.keys().cloned());
        keys
    }
}

/// A classified update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundUpdate {
    pub update_id: Option<UpdateId>,
    pub payload: UpdatePayload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdatePayload {
    TextMessage {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
    },
    CallbackQuery {
        callback_id: CallbackId,
        data: Option<String>,
    },
    Other {
        keys: Vec<String>,
    },
}

impl InboundUpdate {
    /// Classify a raw update.
    ///
    /// A `message` carrying `text` wins over a `callback_query`; a message
    /// without text falls through to the callback check. Once a shape is
    /// selected, its required fields must be present or the update is
    /// rejected as malformed.
    pub fn classify(raw: &RawUpdate) -> Result<Self> {
        let update_id = raw
            .update_id
            .as_ref()
            .and_then(Value::as_i64)
            .map(UpdateId);

        if let Some(message) = raw.message.as_ref() {
            if let Some(text) = message.get("text") {
                return Ok(Self {
                    update_id,
                    payload: text_message(message, text)?,
                });
            }
        }

        if let Some(cq) = raw.callback_query.as_ref() {
            return Ok(Self {
                update_id,
                payload: callback_query(cq)?,
            });
        }

        Ok(Self {
            update_id,
            payload: UpdatePayload::Other { keys: raw.keys() },
        })
    }
}

fn text_message(message: &Value, text: &Value) -> Result<UpdatePayload> {
    let text = text
        .as_str()
        .ok_or_else(|| malformed("message.text is not a string"))?
        .to_string();
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("message.chat.id is missing or not an integer"))?;
    let message_id = message
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("message.message_id is missing or not an integer"))?;

    Ok(UpdatePayload::TextMessage {
        chat_id: ChatId(chat_id),
        message_id: MessageId(message_id),
        text,
    })
}

fn callback_query(cq: &Value) -> Result<UpdatePayload> {
    let callback_id = cq
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("callback_query.id is missing or not a string"))?
        .to_string();
    let data = match cq.get("data") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(malformed("callback_query.data is not a string")),
    };

    Ok(UpdatePayload::CallbackQuery {
        callback_id: CallbackId(callback_id),
        data,
    })
}

fn malformed(reason: &str) -> Error {
    Error::MalformedUpdate(reason.to_string())
}
