//! Telegram operator console
//!
//! Long-polls getUpdates and dispatches slash commands from the admin
//! chat. Parameter changes go through [`SharedConfig`] so every component
//! sees them on its next snapshot, and are persisted so they survive a
//! restart.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::config::SharedConfig;
use crate::db::Database;
use crate::execution::OrderLifecycleManager;
use crate::notify::Notifier;

const POLL_TIMEOUT_SECS: u64 = 30;
const MAX_LEVERAGE: u32 = 20;
const MAX_RISK_FRACTION: f64 = 0.05;

pub struct CommandListener {
    client: Client,
    bot_token: String,
    admin_chat_id: String,
    config: SharedConfig,
    manager: Arc<OrderLifecycleManager>,
    db: Option<Arc<Database>>,
    notifier: Arc<Notifier>,
}

impl CommandListener {
    pub fn new(
        bot_token: String,
        admin_chat_id: String,
        config: SharedConfig,
        manager: Arc<OrderLifecycleManager>,
        db: Option<Arc<Database>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            bot_token,
            admin_chat_id,
            config,
            manager,
            db,
            notifier,
        }
    }

    /// Build from env if both Telegram variables are set
    pub fn from_env(
        config: SharedConfig,
        manager: Arc<OrderLifecycleManager>,
        db: Option<Arc<Database>>,
        notifier: Arc<Notifier>,
    ) -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self::new(token, chat_id, config, manager, db, notifier))
    }

    /// Long-poll loop; runs for the life of the process
    pub async fn run(self) {
        let mut offset: i64 = 0;
        tracing::info!("📟 operator console listening");

        loop {
            match self.poll_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                            offset = offset.max(id + 1);
                        }
                        self.handle_update(&update).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("getUpdates failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn poll_updates(&self, offset: i64) -> reqwest::Result<Vec<Value>> {
        let url = format!("https://api.telegram.org/bot{}/getUpdates", self.bot_token);
        let body: Value = self
            .client
            .get(&url)
            .query(&[
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn handle_update(&self, update: &Value) {
        let message = match update.get("message") {
            Some(m) => m,
            None => return,
        };
        let chat_id = message
            .pointer("/chat/id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string());
        let text = match message.get("text").and_then(Value::as_str) {
            Some(t) => t.trim(),
            None => return,
        };

        // Only the admin chat may drive the bot
        if chat_id.as_deref() != Some(self.admin_chat_id.as_str()) {
            tracing::warn!("ignoring command from non-admin chat {:?}", chat_id);
            return;
        }
        if !text.starts_with('/') {
            return;
        }

        tracing::info!("operator command: {}", text);
        let reply = self.dispatch(text).await;
        self.notifier.send(&reply).await;
    }

    /// Execute one slash command and produce the reply text
    pub async fn dispatch(&self, text: &str) -> String {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("");
        let arg = parts.next();

        match command {
            "/status" => self.status_text().await,
            "/pause" => {
                self.config.update(|c| c.is_paused = true);
                self.persist("is_paused", "true").await;
                "⏸ paused: no new entries, open positions still supervised".to_string()
            }
            "/resume" => {
                self.config.update(|c| c.is_paused = false);
                self.persist("is_paused", "false").await;
                "▶️ resumed".to_string()
            }
            "/leverage" => match arg.and_then(|a| a.parse::<u32>().ok()) {
                Some(lev) if (1..=MAX_LEVERAGE).contains(&lev) => {
                    self.config.update(|c| c.leverage = lev);
                    self.persist("leverage", &lev.to_string()).await;
                    format!("leverage set to {}x (applies to new entries)", lev)
                }
                _ => format!("usage: /leverage <1-{}>", MAX_LEVERAGE),
            },
            "/risk" => match arg.and_then(|a| a.parse::<f64>().ok()) {
                Some(frac) if frac > 0.0 && frac <= MAX_RISK_FRACTION => {
                    self.config.update(|c| c.risk_fraction = frac);
                    self.persist("risk_fraction", &frac.to_string()).await;
                    format!("risk fraction set to {:.4}", frac)
                }
                _ => format!("usage: /risk <0.0001-{}>", MAX_RISK_FRACTION),
            },
            "/mode" => match arg {
                Some("dry") => {
                    self.config.update(|c| c.dry_run = true);
                    self.persist("dry_run", "true").await;
                    "🧪 dry-run mode: orders are virtual".to_string()
                }
                Some("live") => {
                    self.config.update(|c| c.dry_run = false);
                    self.persist("dry_run", "false").await;
                    "🔴 LIVE mode: orders hit the exchange".to_string()
                }
                _ => "usage: /mode dry|live".to_string(),
            },
            "/panic" => match self.manager.panic_close_all().await {
                Ok(n) => format!("🚨 panic complete: {} position(s) flattened, bot halted", n),
                Err(e) => format!("panic errored: {} (check positions manually)", e),
            },
            "/restart" => {
                self.manager.clear_halt();
                self.config.update(|c| c.is_paused = false);
                self.persist("is_paused", "false").await;
                "♻️ halt cleared, trading re-enabled".to_string()
            }
            _ => "commands: /status /pause /resume /leverage <n> /risk <f> /mode dry|live /panic /restart"
                .to_string(),
        }
    }

    async fn status_text(&self) -> String {
        let status = self.manager.status().await;

        let mut lines = vec![format!(
            "🤖 up {}m | {}{}{}",
            status.uptime_secs / 60,
            if status.dry_run { "dry-run" } else { "LIVE" },
            if status.paused { " | paused" } else { "" },
            if status.halted { " | HALTED" } else { "" },
        )];

        if status.open_positions.is_empty() {
            lines.push("no open positions".to_string());
        } else {
            for (symbol, side, entry, qty) in &status.open_positions {
                lines.push(format!("{} {} {} @ {:.4}", side, qty, symbol, entry));
            }
        }
        if status.pending_entries > 0 {
            lines.push(format!("{} pending entry order(s)", status.pending_entries));
        }
        for (symbol, until) in &status.cooldowns {
            lines.push(format!("⏳ {} cooldown until {}", symbol, until.format("%H:%M UTC")));
        }

        lines.join("\n")
    }

    async fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.config.set_kv(key, value) {
            tracing::error!("config update rejected for {}: {}", key, e);
            return;
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.set_param(key, value).await {
                tracing::error!("failed to persist param {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::ExchangeClient;
    use crate::models::Side;

    fn listener() -> (CommandListener, Arc<MockExchange>, SharedConfig) {
        let mock = Arc::new(MockExchange::new());
        let config = SharedConfig::new(BotConfig {
            dry_run: false,
            ..BotConfig::default()
        });
        let notifier = Arc::new(Notifier::new(None, None));
        let manager = Arc::new(OrderLifecycleManager::new(
            Arc::clone(&mock) as Arc<dyn ExchangeClient>,
            config.clone(),
            None,
            Arc::clone(&notifier),
        ));
        let listener = CommandListener::new(
            "token".to_string(),
            "42".to_string(),
            config.clone(),
            manager,
            None,
            notifier,
        );
        (listener, mock, config)
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_config() {
        let (listener, _, config) = listener();

        listener.dispatch("/pause").await;
        assert!(config.snapshot().is_paused);

        listener.dispatch("/resume").await;
        assert!(!config.snapshot().is_paused);
    }

    #[tokio::test]
    async fn test_leverage_validated() {
        let (listener, _, config) = listener();

        listener.dispatch("/leverage 7").await;
        assert_eq!(config.snapshot().leverage, 7);

        // out of range and garbage leave config untouched
        listener.dispatch("/leverage 125").await;
        listener.dispatch("/leverage abc").await;
        assert_eq!(config.snapshot().leverage, 7);
    }

    #[tokio::test]
    async fn test_risk_fraction_bounds() {
        let (listener, _, config) = listener();
        let before = config.snapshot().risk_fraction;

        listener.dispatch("/risk 0.01").await;
        assert_eq!(config.snapshot().risk_fraction, 0.01);

        listener.dispatch("/risk 0.5").await;
        assert_eq!(config.snapshot().risk_fraction, 0.01);

        listener.dispatch("/risk -1").await;
        assert_eq!(config.snapshot().risk_fraction, 0.01);
        let _ = before;
    }

    #[tokio::test]
    async fn test_mode_switch() {
        let (listener, _, config) = listener();

        listener.dispatch("/mode dry").await;
        assert!(config.snapshot().dry_run);

        listener.dispatch("/mode live").await;
        assert!(!config.snapshot().dry_run);

        let reply = listener.dispatch("/mode sideways").await;
        assert!(reply.contains("usage"));
    }

    #[tokio::test]
    async fn test_panic_flattens_and_restart_clears_halt() {
        let (listener, mock, _) = listener();

        mock.set_ticker("SOL/USDT:USDT", 100.0);
        assert!(listener
            .manager
            .place_entry("SOL/USDT:USDT", Side::Long, 1.0, 2.0, "test")
            .await
            .unwrap());

        let reply = listener.dispatch("/panic").await;
        assert!(reply.contains("1 position"));
        assert!(listener.manager.is_halted());

        listener.dispatch("/restart").await;
        assert!(!listener.manager.is_halted());
    }

    #[tokio::test]
    async fn test_status_reports_positions() {
        let (listener, mock, _) = listener();

        mock.set_ticker("SOL/USDT:USDT", 100.0);
        listener
            .manager
            .place_entry("SOL/USDT:USDT", Side::Long, 1.0, 2.0, "test")
            .await
            .unwrap();

        let text = listener.dispatch("/status").await;
        assert!(text.contains("SOL/USDT:USDT"));
        assert!(text.contains("LIVE"));
    }

    #[tokio::test]
    async fn test_unknown_command_shows_help() {
        let (listener, _, _) = listener();
        let reply = listener.dispatch("/frobnicate").await;
        assert!(reply.contains("/status"));
    }
}
