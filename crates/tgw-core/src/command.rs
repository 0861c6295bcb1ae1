//! Outbound Bot API commands, executed by the gateway on the worker's behalf.

use serde::Serialize;

use crate::domain::{CallbackId, ChatId, MessageId};

/// Envelope published to the outbound topic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundCommand {
    pub bot_token: String,
    pub method: &'static str,
    pub params: MethodParams,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MethodParams {
    SendMessage {
        chat_id: ChatId,
        text: String,
        reply_to_message_id: MessageId,
    },
    AnswerCallbackQuery {
        callback_query_id: CallbackId,
        text: String,
    },
}

impl OutboundCommand {
    pub const SEND_MESSAGE: &'static str = "sendMessage";
    pub const ANSWER_CALLBACK_QUERY: &'static str = "answerCallbackQuery";

    pub fn send_message(
        bot_token: impl Into<String>,
        chat_id: ChatId,
        text: impl Into<String>,
        reply_to_message_id: MessageId,
    ) -> Self {
        Self {
            bot_token: bot_token.into(),
            method: Self::SEND_MESSAGE,
            params: MethodParams::SendMessage {
                chat_id,
                text: text.into(),
                reply_to_message_id,
            },
        }
    }

    pub fn answer_callback_query(
        bot_token: impl Into<String>,
        callback_query_id: CallbackId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            bot_token: bot_token.into(),
            method: Self::ANSWER_CALLBACK_QUERY,
            params: MethodParams::AnswerCallbackQuery {
                callback_query_id,
                text: text.into(),
            },
        }
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
