use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::JtError;
use crate::standardized_types::accounts::{Account, AccountAuthStatus, BrokerCredentials};
use crate::standardized_types::broker_enum::Brokerage;
use crate::standardized_types::copy_trading::{ContractMapping, CopyTradeLog, FollowerAccount, LeaderAccount};
use crate::standardized_types::enums::{
    CopyStatus, DirectionFilter, Environment, ExitReason, OrderSide, PositionSide, TradeStatus,
};
use crate::standardized_types::strategies::{Strategy, Trader, TraderOverrides};
use crate::standardized_types::trades::{PositionAggregate, Trade};
use crate::store::schema::*;

pub(crate) fn parse_decimal(field: &str, value: &str) -> Result<Decimal, JtError> {
    Decimal::from_str(value)
        .map_err(|_| JtError::IntegrityViolation(format!("bad decimal in {}: {}", field, value)))
}

pub(crate) fn parse_enum<T: FromStr>(field: &str, value: &str) -> Result<T, JtError> {
    T::from_str(value)
        .map_err(|_| JtError::IntegrityViolation(format!("bad value in {}: {}", field, value)))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(field: &str, value: &str) -> Result<T, JtError> {
    serde_json::from_str(value)
        .map_err(|e| JtError::IntegrityViolation(format!("bad json in {}: {}", field, e)))
}

pub(crate) fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = accounts)]
pub struct AccountRow {
    pub id: i64,
    pub user_id: i64,
    pub brokerage: String,
    pub environment: String,
    pub credentials: String,
    pub subaccount_id: String,
    pub enabled: bool,
    pub needs_reauth: bool,
    pub reauth_reason: Option<String>,
    pub created_at: NaiveDateTime,
}

impl TryFrom<AccountRow> for Account {
    type Error = JtError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            user_id: row.user_id,
            brokerage: parse_enum::<Brokerage>("accounts.brokerage", &row.brokerage)?,
            environment: parse_enum::<Environment>("accounts.environment", &row.environment)?,
            credentials: parse_json::<BrokerCredentials>("accounts.credentials", &row.credentials)?,
            subaccount_id: row.subaccount_id,
            enabled: row.enabled,
            needs_reauth: row.needs_reauth,
        })
    }
}

impl AccountRow {
    pub fn auth_status(&self) -> Result<AccountAuthStatus, JtError> {
        let credentials =
            parse_json::<BrokerCredentials>("accounts.credentials", &self.credentials)?;
        Ok(AccountAuthStatus {
            account_id: self.id,
            brokerage: parse_enum::<Brokerage>("accounts.brokerage", &self.brokerage)?,
            subaccount_id: self.subaccount_id.clone(),
            needs_reauth: self.needs_reauth,
            reauth_reason: self.reauth_reason.clone(),
            token_expires_at: credentials.token_expires_at(),
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = accounts)]
pub struct NewAccountRow {
    pub user_id: i64,
    pub brokerage: String,
    pub environment: String,
    pub credentials: String,
    pub subaccount_id: String,
    pub enabled: bool,
    pub needs_reauth: bool,
    pub reauth_reason: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = strategies)]
pub struct StrategyRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub symbol: String,
    pub enabled: bool,
    pub initial_size: String,
    pub add_size: String,
    pub tp_plan: String,
    pub sl_plan: String,
    pub add_down_plan: String,
    pub break_even_plan: String,
    pub windows: String,
    pub auto_flat_after_cutoff: bool,
    pub direction: String,
    pub inverse: bool,
    pub signal_delay: i64,
    pub signal_cooldown_secs: i64,
    pub max_signals_per_session: i64,
    pub max_daily_loss: String,
    pub max_contracts: String,
    pub time_zone: String,
    pub webhook_token: String,
    pub created_at: NaiveDateTime,
}

impl TryFrom<StrategyRow> for Strategy {
    type Error = JtError;

    fn try_from(row: StrategyRow) -> Result<Self, Self::Error> {
        Ok(Strategy {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            symbol: row.symbol,
            enabled: row.enabled,
            initial_size: parse_decimal("strategies.initial_size", &row.initial_size)?,
            add_size: parse_decimal("strategies.add_size", &row.add_size)?,
            take_profit: parse_json("strategies.tp_plan", &row.tp_plan)?,
            stop_loss: parse_json("strategies.sl_plan", &row.sl_plan)?,
            add_down: parse_json("strategies.add_down_plan", &row.add_down_plan)?,
            break_even: parse_json("strategies.break_even_plan", &row.break_even_plan)?,
            windows: parse_json("strategies.windows", &row.windows)?,
            auto_flat_after_cutoff: row.auto_flat_after_cutoff,
            direction: parse_enum::<DirectionFilter>("strategies.direction", &row.direction)?,
            inverse: row.inverse,
            signal_delay: row.signal_delay,
            signal_cooldown_secs: row.signal_cooldown_secs,
            max_signals_per_session: row.max_signals_per_session,
            max_daily_loss: parse_decimal("strategies.max_daily_loss", &row.max_daily_loss)?,
            max_contracts: parse_decimal("strategies.max_contracts", &row.max_contracts)?,
            time_zone: row.time_zone,
            webhook_token: row.webhook_token,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = strategies)]
pub struct NewStrategyRow {
    pub user_id: i64,
    pub name: String,
    pub symbol: String,
    pub enabled: bool,
    pub initial_size: String,
    pub add_size: String,
    pub tp_plan: String,
    pub sl_plan: String,
    pub add_down_plan: String,
    pub break_even_plan: String,
    pub windows: String,
    pub auto_flat_after_cutoff: bool,
    pub direction: String,
    pub inverse: bool,
    pub signal_delay: i64,
    pub signal_cooldown_secs: i64,
    pub max_signals_per_session: i64,
    pub max_daily_loss: String,
    pub max_contracts: String,
    pub time_zone: String,
    pub webhook_token: String,
    pub created_at: NaiveDateTime,
}

impl NewStrategyRow {
    pub fn from_domain(strategy: &Strategy, now: NaiveDateTime) -> Result<Self, JtError> {
        Ok(Self {
            user_id: strategy.user_id,
            name: strategy.name.clone(),
            symbol: strategy.symbol.clone(),
            enabled: strategy.enabled,
            initial_size: strategy.initial_size.to_string(),
            add_size: strategy.add_size.to_string(),
            tp_plan: encode_json("strategies.tp_plan", &strategy.take_profit)?,
            sl_plan: encode_json("strategies.sl_plan", &strategy.stop_loss)?,
            add_down_plan: encode_json("strategies.add_down_plan", &strategy.add_down)?,
            break_even_plan: encode_json("strategies.break_even_plan", &strategy.break_even)?,
            windows: encode_json("strategies.windows", &strategy.windows)?,
            auto_flat_after_cutoff: strategy.auto_flat_after_cutoff,
            direction: strategy.direction.to_string(),
            inverse: strategy.inverse,
            signal_delay: strategy.signal_delay,
            signal_cooldown_secs: strategy.signal_cooldown_secs,
            max_signals_per_session: strategy.max_signals_per_session,
            max_daily_loss: strategy.max_daily_loss.to_string(),
            max_contracts: strategy.max_contracts.to_string(),
            time_zone: strategy.time_zone.clone(),
            webhook_token: strategy.webhook_token.clone(),
            created_at: now,
        })
    }
}

pub(crate) fn encode_json<T: serde::Serialize>(field: &str, value: &T) -> Result<String, JtError> {
    serde_json::to_string(value)
        .map_err(|e| JtError::Internal(format!("encode {}: {}", field, e)))
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = traders)]
pub struct TraderRow {
    pub id: i64,
    pub user_id: i64,
    pub strategy_id: i64,
    pub account_id: i64,
    pub enabled: bool,
    pub multiplier: String,
    pub overrides: String,
    pub created_at: NaiveDateTime,
}

impl TryFrom<TraderRow> for Trader {
    type Error = JtError;

    fn try_from(row: TraderRow) -> Result<Self, Self::Error> {
        Ok(Trader {
            id: row.id,
            user_id: row.user_id,
            strategy_id: row.strategy_id,
            account_id: row.account_id,
            enabled: row.enabled,
            multiplier: parse_decimal("traders.multiplier", &row.multiplier)?,
            overrides: parse_json::<TraderOverrides>("traders.overrides", &row.overrides)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = traders)]
pub struct NewTraderRow {
    pub user_id: i64,
    pub strategy_id: i64,
    pub account_id: i64,
    pub enabled: bool,
    pub multiplier: String,
    pub overrides: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = signals)]
pub struct NewSignalRow {
    pub strategy_id: Option<i64>,
    pub action: String,
    pub raw_body: String,
    pub dedup_key: String,
    pub accepted: bool,
    pub received_at: NaiveDateTime,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = trades)]
pub struct TradeRow {
    pub id: i64,
    pub strategy_id: i64,
    pub trader_id: i64,
    pub account_id: i64,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub entry_price: String,
    pub entry_time: NaiveDateTime,
    pub exit_price: Option<String>,
    pub exit_time: Option<NaiveDateTime>,
    pub status: String,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<String>,
    pub client_order_id: String,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub break_even_applied: bool,
}

impl TryFrom<TradeRow> for Trade {
    type Error = JtError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: row.id,
            strategy_id: row.strategy_id,
            trader_id: row.trader_id,
            account_id: row.account_id,
            signal_id: row.signal_id,
            symbol: row.symbol,
            side: parse_enum::<PositionSide>("trades.side", &row.side)?,
            quantity: parse_decimal("trades.quantity", &row.quantity)?,
            entry_price: parse_decimal("trades.entry_price", &row.entry_price)?,
            entry_time: to_utc(row.entry_time),
            exit_price: row
                .exit_price
                .as_deref()
                .map(|v| parse_decimal("trades.exit_price", v))
                .transpose()?,
            exit_time: row.exit_time.map(to_utc),
            status: parse_enum::<TradeStatus>("trades.status", &row.status)?,
            exit_reason: row
                .exit_reason
                .as_deref()
                .map(|v| parse_enum::<ExitReason>("trades.exit_reason", v))
                .transpose()?,
            realized_pnl: row
                .realized_pnl
                .as_deref()
                .map(|v| parse_decimal("trades.realized_pnl", v))
                .transpose()?,
            client_order_id: row.client_order_id,
            tp_order_id: row.tp_order_id,
            sl_order_id: row.sl_order_id,
            break_even_applied: row.break_even_applied,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = trades)]
pub struct NewTradeRow {
    pub strategy_id: i64,
    pub trader_id: i64,
    pub account_id: i64,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub entry_price: String,
    pub entry_time: NaiveDateTime,
    pub status: String,
    pub client_order_id: String,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub break_even_applied: bool,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = positions)]
pub struct PositionRow {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub average_price: String,
    pub entries: String,
    pub open_pnl: String,
    pub worst_pnl: String,
    pub best_pnl: String,
    pub open: bool,
    pub opened_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<PositionRow> for PositionAggregate {
    type Error = JtError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(PositionAggregate {
            strategy_id: row.strategy_id,
            symbol: row.symbol,
            side: parse_enum::<PositionSide>("positions.side", &row.side)?,
            quantity: parse_decimal("positions.quantity", &row.quantity)?,
            average_price: parse_decimal("positions.average_price", &row.average_price)?,
            entries: parse_json("positions.entries", &row.entries)?,
            open_pnl: parse_decimal("positions.open_pnl", &row.open_pnl)?,
            worst_pnl: parse_decimal("positions.worst_pnl", &row.worst_pnl)?,
            best_pnl: parse_decimal("positions.best_pnl", &row.best_pnl)?,
            open: row.open,
            opened_at: to_utc(row.opened_at),
            updated_at: to_utc(row.updated_at),
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = positions)]
pub struct NewPositionRow {
    pub strategy_id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub average_price: String,
    pub entries: String,
    pub open_pnl: String,
    pub worst_pnl: String,
    pub best_pnl: String,
    pub open: bool,
    pub opened_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = leader_accounts)]
pub struct LeaderAccountRow {
    pub id: i64,
    pub account_id: i64,
    pub auto_copy_enabled: bool,
}

impl From<LeaderAccountRow> for LeaderAccount {
    fn from(row: LeaderAccountRow) -> Self {
        LeaderAccount {
            id: row.id,
            account_id: row.account_id,
            auto_copy_enabled: row.auto_copy_enabled,
        }
    }
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = follower_accounts)]
pub struct FollowerAccountRow {
    pub id: i64,
    pub leader_account_id: i64,
    pub account_id: i64,
    pub multiplier: String,
    pub max_position_size: String,
    pub copy_tp: bool,
    pub copy_sl: bool,
    pub enabled: bool,
}

impl TryFrom<FollowerAccountRow> for FollowerAccount {
    type Error = JtError;

    fn try_from(row: FollowerAccountRow) -> Result<Self, Self::Error> {
        Ok(FollowerAccount {
            id: row.id,
            leader_account_id: row.leader_account_id,
            account_id: row.account_id,
            multiplier: parse_decimal("follower_accounts.multiplier", &row.multiplier)?,
            max_position_size: parse_decimal(
                "follower_accounts.max_position_size",
                &row.max_position_size,
            )?,
            copy_tp: row.copy_tp,
            copy_sl: row.copy_sl,
            enabled: row.enabled,
        })
    }
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = copy_trade_logs)]
pub struct CopyTradeLogRow {
    pub id: i64,
    pub leader_account_id: i64,
    pub follower_account_id: i64,
    pub symbol: String,
    pub side: String,
    pub leader_quantity: String,
    pub follower_quantity: String,
    pub leader_price: Option<String>,
    pub follower_price: Option<String>,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
}

impl TryFrom<CopyTradeLogRow> for CopyTradeLog {
    type Error = JtError;

    fn try_from(row: CopyTradeLogRow) -> Result<Self, Self::Error> {
        Ok(CopyTradeLog {
            id: row.id,
            leader_account_id: row.leader_account_id,
            follower_account_id: row.follower_account_id,
            symbol: row.symbol,
            side: parse_enum::<OrderSide>("copy_trade_logs.side", &row.side)?,
            leader_quantity: parse_decimal("copy_trade_logs.leader_quantity", &row.leader_quantity)?,
            follower_quantity: parse_decimal(
                "copy_trade_logs.follower_quantity",
                &row.follower_quantity,
            )?,
            leader_price: row
                .leader_price
                .as_deref()
                .map(|v| parse_decimal("copy_trade_logs.leader_price", v))
                .transpose()?,
            follower_price: row
                .follower_price
                .as_deref()
                .map(|v| parse_decimal("copy_trade_logs.follower_price", v))
                .transpose()?,
            status: parse_enum::<CopyStatus>("copy_trade_logs.status", &row.status)?,
            latency_ms: row.latency_ms,
            error: row.error,
            created_at: to_utc(row.created_at),
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = copy_trade_logs)]
pub struct NewCopyTradeLogRow {
    pub leader_account_id: i64,
    pub follower_account_id: i64,
    pub symbol: String,
    pub side: String,
    pub leader_quantity: String,
    pub follower_quantity: String,
    pub leader_price: Option<String>,
    pub follower_price: Option<String>,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = contract_mappings)]
pub struct ContractMappingRow {
    pub id: i64,
    pub source_symbol: String,
    pub target_symbol: String,
    pub qty_multiplier: String,
}

impl TryFrom<ContractMappingRow> for ContractMapping {
    type Error = JtError;

    fn try_from(row: ContractMappingRow) -> Result<Self, Self::Error> {
        Ok(ContractMapping {
            id: row.id,
            source_symbol: row.source_symbol,
            target_symbol: row.target_symbol,
            qty_multiplier: parse_decimal("contract_mappings.qty_multiplier", &row.qty_multiplier)?,
        })
    }
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = execution_failures)]
pub struct ExecutionFailureRow {
    pub id: i64,
    pub strategy_id: Option<i64>,
    pub trader_id: Option<i64>,
    pub account_id: Option<i64>,
    pub symbol: String,
    pub action: String,
    pub error_kind: String,
    pub detail: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = execution_failures)]
pub struct NewExecutionFailureRow {
    pub strategy_id: Option<i64>,
    pub trader_id: Option<i64>,
    pub account_id: Option<i64>,
    pub symbol: String,
    pub action: String,
    pub error_kind: String,
    pub detail: String,
    pub created_at: NaiveDateTime,
}
