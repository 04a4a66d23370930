use async_trait::async_trait;
use teloxide::prelude::{ChatId, Requester};
use teloxide::{ApiError, Bot, RequestError};

use crate::config::TelegramConfig;
use crate::errors::DeliveryError;
use crate::utils::notifier::DeliveryChannel;

// Sends the notification as a single chat message through a bot.
pub struct TelegramChannel {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> Self {
        Self { bot: Bot::new(&config.bot_token), chat_id: ChatId(config.chat_id) }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, title: &str, content: &str) -> Result<(), DeliveryError> {
        let text = format!("{title}\n\n{content}");
        match self.bot.send_message(self.chat_id, text).await {
            Ok(_) => Ok(()),
            Err(e) => Err(classify_telegram_failure(e)),
        }
    }
}

fn classify_telegram_failure(error: RequestError) -> DeliveryError {
    match error {
        // teloxide-core names the "Unauthorized" reply for a bad bot token `NotFound`.
        RequestError::Api(ApiError::NotFound) => DeliveryError::Auth(error.to_string()),
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_) => {
            DeliveryError::Transient(error.to_string())
        }
        other => DeliveryError::Rejected(other.to_string()),
    }
}
