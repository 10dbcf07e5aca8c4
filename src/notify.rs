// Telegram notifications, fire-and-forget off the trading path

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

/// Outbound operator notifications
///
/// Constructed once and injected; when no token/chat id is configured the
/// notifier is a no-op so dry runs work without Telegram credentials.
pub struct Notifier {
    client: Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        if bot_token.is_none() || chat_id.is_none() {
            tracing::warn!("Telegram credentials not set, notifications disabled");
        }

        Self {
            client,
            bot_token,
            chat_id,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            std::env::var("TELEGRAM_CHAT_ID").ok(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    /// Send a message and wait for delivery
    pub async fn send(&self, text: &str) {
        let (token, chat_id) = match (&self.bot_token, &self.chat_id) {
            (Some(t), Some(c)) => (t, c),
            _ => return,
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!("Telegram send failed: http {}", resp.status());
            }
            Err(e) => tracing::warn!("Telegram send failed: {}", e),
            _ => {}
        }
    }

    /// Dispatch without blocking the caller; a slow or failing channel
    /// never stalls order handling
    pub fn send_detached(self: &Arc<Self>, text: String) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier.send(&text).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_credentials() {
        let notifier = Notifier::new(None, None);
        assert!(!notifier.is_enabled());

        let partial = Notifier::new(Some("token".into()), None);
        assert!(!partial.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_send_is_noop() {
        // Must return without attempting any network call
        let notifier = Notifier::new(None, None);
        notifier.send("hello").await;
    }
}
