use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::models::{TradeAction, TradeRecord};
use crate::Result;

/// Postgres persistence: append-only trade log plus the operator
/// parameter store
///
/// Trades are the durable audit trail; bot_params holds the last
/// operator-set configuration so it survives restarts.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to Postgres and ensure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        tracing::info!("Connected to Postgres");
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                action TEXT NOT NULL,
                symbol TEXT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                quantity DOUBLE PRECISION NOT NULL,
                realized_pnl DOUBLE PRECISION,
                reason TEXT NOT NULL DEFAULT '',
                dry_run BOOLEAN NOT NULL DEFAULT FALSE,
                params_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_params (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Startup connectivity check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Append one trade record (audit trail, never updated)
    pub async fn insert_trade(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, timestamp, action, symbol, price, quantity,
                realized_pnl, reason, dry_run, params_json
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.timestamp)
        .bind(record.action.as_str())
        .bind(&record.symbol)
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.realized_pnl)
        .bind(&record.reason)
        .bind(record.dry_run)
        .bind(&record.params_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Recorded {} {} @ {} to trade log",
            record.action.as_str(),
            record.symbol,
            record.price
        );

        Ok(())
    }

    /// Most recent trades, newest first
    pub async fn load_recent_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, action, symbol, price, quantity,
                   realized_pnl, reason, dry_run, params_json
            FROM trades
            ORDER BY timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let timestamp: DateTime<Utc> = row.get("timestamp");
            let action_str: String = row.get("action");
            let symbol: String = row.get("symbol");
            let price: f64 = row.get("price");
            let quantity: f64 = row.get("quantity");
            let realized_pnl: Option<f64> = row.get("realized_pnl");
            let reason: String = row.get("reason");
            let dry_run: bool = row.get("dry_run");
            let params_json: Option<String> = row.get("params_json");

            let action = match action_str.as_str() {
                "LONG" => TradeAction::Long,
                "SHORT" => TradeAction::Short,
                "CANCELED" => TradeAction::Canceled,
                "CLOSED" => TradeAction::Closed,
                "MANUAL" => TradeAction::Manual,
                "PANIC" => TradeAction::Panic,
                other => return Err(format!("invalid trade action in db: {}", other).into()),
            };

            trades.push(TradeRecord {
                id,
                timestamp,
                action,
                symbol,
                price,
                quantity,
                realized_pnl,
                reason,
                dry_run,
                params_json,
            });
        }

        Ok(trades)
    }

    /// Realized PnL summed over the trailing window
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(realized_pnl), 0) AS pnl FROM trades WHERE timestamp >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<f64, _>("pnl"))
    }

    /// Persist one operator-set parameter
    pub async fn set_param(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_params (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All persisted parameters, applied over env defaults at startup
    pub async fn load_params(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM bot_params")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }
}
