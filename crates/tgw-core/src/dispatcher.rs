use crate::{
    command::OutboundCommand,
    config::Config,
    update::{InboundUpdate, RawUpdate, UpdatePayload},
    Result,
};

/// Routes one update to its echo handler.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    bot_token: String,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Self {
        Self::with_token(cfg.bot_token.clone())
    }

    pub fn with_token(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
        }
    }

    /// Build the response for `raw`, if it has a shape we answer.
    ///
    /// `Ok(None)` means the update was understood but needs no reply. An
    /// `Err` is a per-message failure for the caller to log and drop.
    pub fn dispatch(&self, raw: &RawUpdate) -> Result<Option<OutboundCommand>> {
        let update = InboundUpdate::classify(raw)?;
        let update_id = update.update_id.map(|u| u.0);
        tracing::info!(update_id, "received update");

        match update.payload {
            UpdatePayload::TextMessage {
                chat_id,
                message_id,
                text,
            } => {
                tracing::info!(chat_id = chat_id.0, %text, "processing message");
                Ok(Some(OutboundCommand::send_message(
                    self.bot_token.as_str(),
                    chat_id,
                    echo_text(&text),
                    message_id,
                )))
            }
            UpdatePayload::CallbackQuery { callback_id, data } => {
                let data = data.unwrap_or_default();
                tracing::info!(callback_id = %callback_id.0, %data, "processing callback query");
                Ok(Some(OutboundCommand::answer_callback_query(
                    self.bot_token.as_str(),
                    callback_id,
                    received_text(&data),
                )))
            }
            UpdatePayload::Other { keys } => {
                tracing::info!(update_id, ?keys, "unhandled update type");
                Ok(None)
            }
        }
    }
}

fn echo_text(text: &str) -> String {
    format!("Echo: {text}")
}

fn received_text(data: &str) -> String {
    format!("Received: {data}")
}
