use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::JtError;
use crate::standardized_types::accounts::{Account, AccountAuthStatus, AccountId, BrokerCredentials};
use crate::standardized_types::broker_enum::Brokerage;
use crate::standardized_types::copy_trading::{
    ContractMapping, CopyTradeLog, FollowerAccount, LeaderAccount,
};
use crate::standardized_types::enums::{CopyStatus, ExitReason, PositionSide, TradeStatus};
use crate::standardized_types::orders::{ClientOrderId, OrderId};
use crate::standardized_types::signals::SignalId;
use crate::standardized_types::strategies::{Strategy, StrategyId, Trader, TraderId};
use crate::standardized_types::trades::{PositionAggregate, Trade, TradeId};
use crate::standardized_types::{Price, SymbolName, Volume};

pub mod migrations;
pub mod models;
pub mod schema;

use models::*;
use schema::*;

/// One connection type covering both supported back-ends: the embedded
/// single-file store for development and the networked store for
/// production. Queries are written once against this enum; diesel handles
/// per-back-end placeholder and literal encodings.
#[derive(diesel::MultiConnection)]
pub enum AnyConnection {
    Sqlite(diesel::SqliteConnection),
    Postgres(diesel::PgConnection),
}

type DbPool = Pool<ConnectionManager<AnyConnection>>;

impl From<diesel::result::Error> for JtError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => JtError::NotFound("row not found".to_string()),
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                JtError::IntegrityViolation(info.message().to_string())
            }
            diesel::result::Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                JtError::IntegrityViolation(info.message().to_string())
            }
            other => JtError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Input shape for opening a trade record; the store assigns the id.
#[derive(Clone, Debug)]
pub struct NewTrade {
    pub strategy_id: StrategyId,
    pub trader_id: TraderId,
    pub account_id: AccountId,
    pub signal_id: Option<SignalId>,
    pub symbol: SymbolName,
    pub side: PositionSide,
    pub quantity: Volume,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub client_order_id: ClientOrderId,
    pub tp_order_id: Option<OrderId>,
    pub sl_order_id: Option<OrderId>,
}

/// Structured execution failure, keyed for the monitoring surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub id: i64,
    pub strategy_id: Option<StrategyId>,
    pub trader_id: Option<TraderId>,
    pub account_id: Option<AccountId>,
    pub symbol: SymbolName,
    pub action: String,
    pub error_kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewExecutionFailure {
    pub strategy_id: Option<StrategyId>,
    pub trader_id: Option<TraderId>,
    pub account_id: Option<AccountId>,
    pub symbol: SymbolName,
    pub action: String,
    pub error_kind: String,
    pub detail: String,
}

/// Transactional persistence facade. Cheap to clone; all methods hop onto
/// the blocking pool so callers never stall the async runtime on I/O.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

fn last_insert_id(conn: &mut AnyConnection) -> Result<i64, JtError> {
    #[derive(QueryableByName)]
    struct LastId {
        #[diesel(sql_type = diesel::sql_types::BigInt)]
        id: i64,
    }

    // The one query that differs by back-end.
    let row: LastId = match conn {
        AnyConnection::Sqlite(c) => {
            diesel::sql_query("SELECT last_insert_rowid() AS id").get_result(c)?
        }
        AnyConnection::Postgres(c) => diesel::sql_query("SELECT lastval() AS id").get_result(c)?,
    };
    Ok(row.id)
}

impl Store {
    pub fn connect(database_url: &str) -> Result<Self, JtError> {
        let manager = ConnectionManager::<AnyConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| JtError::StoreUnavailable(format!("pool: {}", e)))?;
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, JtError>
    where
        T: Send + 'static,
        F: FnOnce(&mut AnyConnection) -> Result<T, JtError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| JtError::StoreUnavailable(format!("checkout: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| JtError::Internal(format!("store task join: {}", e)))?
    }

    pub async fn run_migrations(&self) -> Result<(), JtError> {
        self.with_conn(|conn| migrations::run_migrations(conn)).await
    }

    // ---- strategies / traders -------------------------------------------

    pub async fn create_strategy(&self, strategy: Strategy) -> Result<StrategyId, JtError> {
        self.with_conn(move |conn| {
            let row = NewStrategyRow::from_domain(&strategy, Utc::now().naive_utc())?;
            diesel::insert_into(strategies::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    pub async fn get_strategy(&self, id: StrategyId) -> Result<Strategy, JtError> {
        self.with_conn(move |conn| {
            let row: StrategyRow = strategies::table.find(id).first(conn)?;
            row.try_into()
        })
        .await
    }

    pub async fn get_strategy_by_webhook_token(
        &self,
        token: &str,
    ) -> Result<Option<Strategy>, JtError> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let row: Option<StrategyRow> = strategies::table
                .filter(strategies::webhook_token.eq(&token))
                .first(conn)
                .optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    pub async fn list_enabled_strategies(&self) -> Result<Vec<Strategy>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<StrategyRow> = strategies::table
                .filter(strategies::enabled.eq(true))
                .load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    pub async fn create_trader(
        &self,
        trader: Trader,
    ) -> Result<TraderId, JtError> {
        self.with_conn(move |conn| {
            let row = NewTraderRow {
                user_id: trader.user_id,
                strategy_id: trader.strategy_id,
                account_id: trader.account_id,
                enabled: trader.enabled,
                multiplier: trader.multiplier.to_string(),
                overrides: encode_json("traders.overrides", &trader.overrides)?,
                created_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(traders::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    pub async fn get_trader(&self, id: TraderId) -> Result<Trader, JtError> {
        self.with_conn(move |conn| {
            let row: TraderRow = traders::table.find(id).first(conn)?;
            row.try_into()
        })
        .await
    }

    pub async fn list_traders_for_strategy(
        &self,
        strategy_id: StrategyId,
        enabled_only: bool,
    ) -> Result<Vec<Trader>, JtError> {
        self.with_conn(move |conn| {
            let mut query = traders::table
                .filter(traders::strategy_id.eq(strategy_id))
                .into_boxed();
            if enabled_only {
                query = query.filter(traders::enabled.eq(true));
            }
            let rows: Vec<TraderRow> = query.load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    pub async fn list_enabled_traders(&self) -> Result<Vec<Trader>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<TraderRow> =
                traders::table.filter(traders::enabled.eq(true)).load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    // ---- accounts --------------------------------------------------------

    pub async fn create_account(&self, account: Account) -> Result<AccountId, JtError> {
        self.with_conn(move |conn| {
            let row = NewAccountRow {
                user_id: account.user_id,
                brokerage: account.brokerage.to_string(),
                environment: account.environment.to_string(),
                credentials: encode_json("accounts.credentials", &account.credentials)?,
                subaccount_id: account.subaccount_id.clone(),
                enabled: account.enabled,
                needs_reauth: account.needs_reauth,
                reauth_reason: None,
                created_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(accounts::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    /// Account with its credential blob, ready for broker calls.
    pub async fn get_account(&self, id: AccountId) -> Result<Account, JtError> {
        self.with_conn(move |conn| {
            let row: AccountRow = accounts::table.find(id).first(conn)?;
            row.try_into()
        })
        .await
    }

    pub async fn get_account_by_subaccount(
        &self,
        brokerage: Brokerage,
        subaccount_id: &str,
    ) -> Result<Option<Account>, JtError> {
        let subaccount_id = subaccount_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<AccountRow> = accounts::table
                .filter(accounts::brokerage.eq(brokerage.to_string()))
                .filter(accounts::subaccount_id.eq(&subaccount_id))
                .first(conn)
                .optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    pub async fn list_enabled_accounts(&self) -> Result<Vec<Account>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<AccountRow> =
                accounts::table.filter(accounts::enabled.eq(true)).load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    pub async fn update_account_credentials(
        &self,
        id: AccountId,
        credentials: BrokerCredentials,
    ) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            let encoded = encode_json("accounts.credentials", &credentials)?;
            diesel::update(accounts::table.find(id))
                .set((
                    accounts::credentials.eq(encoded),
                    accounts::needs_reauth.eq(false),
                    accounts::reauth_reason.eq(None::<String>),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Removes the account from the auto-trading pool until a human
    /// re-authenticates it.
    pub async fn mark_account_needs_reauth(
        &self,
        id: AccountId,
        reason: &str,
    ) -> Result<(), JtError> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            diesel::update(accounts::table.find(id))
                .set((
                    accounts::needs_reauth.eq(true),
                    accounts::reauth_reason.eq(Some(reason)),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn list_auth_statuses(&self) -> Result<Vec<AccountAuthStatus>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<AccountRow> = accounts::table.load(conn)?;
            rows.iter().map(AccountRow::auth_status).collect()
        })
        .await
    }

    // ---- signals ---------------------------------------------------------

    /// Persist a raw signal. `strategy_id` is `None` for unknown-token
    /// hits, which are still retained for audit.
    pub async fn record_signal(
        &self,
        strategy_id: Option<StrategyId>,
        action: &str,
        raw_body: &str,
        dedup_key: &str,
        received_at: DateTime<Utc>,
    ) -> Result<SignalId, JtError> {
        let row = NewSignalRow {
            strategy_id,
            action: action.to_string(),
            raw_body: raw_body.to_string(),
            dedup_key: dedup_key.to_string(),
            accepted: false,
            received_at: received_at.naive_utc(),
        };
        self.with_conn(move |conn| {
            diesel::insert_into(signals::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    pub async fn mark_signal_accepted(&self, id: SignalId) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(signals::table.find(id))
                .set(signals::accepted.eq(true))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// True when the same dedup key was already recorded at or after
    /// `since`, excluding the row `except` (the signal being processed).
    pub async fn recent_signal_with_key(
        &self,
        dedup_key: &str,
        since: DateTime<Utc>,
        except: SignalId,
    ) -> Result<bool, JtError> {
        let dedup_key = dedup_key.to_string();
        self.with_conn(move |conn| {
            let count: i64 = signals::table
                .filter(signals::dedup_key.eq(&dedup_key))
                .filter(signals::received_at.ge(since.naive_utc()))
                .filter(signals::id.ne(except))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn count_accepted_signals_since(
        &self,
        strategy_id: StrategyId,
        since: DateTime<Utc>,
    ) -> Result<i64, JtError> {
        self.with_conn(move |conn| {
            let count: i64 = signals::table
                .filter(signals::strategy_id.eq(Some(strategy_id)))
                .filter(signals::accepted.eq(true))
                .filter(signals::received_at.ge(since.naive_utc()))
                .count()
                .get_result(conn)?;
            Ok(count)
        })
        .await
    }

    pub async fn last_accepted_signal_at(
        &self,
        strategy_id: StrategyId,
    ) -> Result<Option<DateTime<Utc>>, JtError> {
        self.with_conn(move |conn| {
            let newest: Option<chrono::NaiveDateTime> = signals::table
                .filter(signals::strategy_id.eq(Some(strategy_id)))
                .filter(signals::accepted.eq(true))
                .select(diesel::dsl::max(signals::received_at))
                .first(conn)?;
            Ok(newest.map(to_utc))
        })
        .await
    }

    // ---- trades ----------------------------------------------------------

    pub async fn open_trade(&self, new_trade: NewTrade) -> Result<TradeId, JtError> {
        self.with_conn(move |conn| {
            let row = NewTradeRow {
                strategy_id: new_trade.strategy_id,
                trader_id: new_trade.trader_id,
                account_id: new_trade.account_id,
                signal_id: new_trade.signal_id,
                symbol: new_trade.symbol.clone(),
                side: new_trade.side.to_string(),
                quantity: new_trade.quantity.to_string(),
                entry_price: new_trade.entry_price.to_string(),
                entry_time: new_trade.entry_time.naive_utc(),
                status: TradeStatus::Open.to_string(),
                client_order_id: new_trade.client_order_id.clone(),
                tp_order_id: new_trade.tp_order_id.clone(),
                sl_order_id: new_trade.sl_order_id.clone(),
                break_even_applied: false,
            };
            diesel::insert_into(trades::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    pub async fn close_trade(
        &self,
        id: TradeId,
        exit_price: Option<Price>,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
        realized_pnl: Option<Decimal>,
    ) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(trades::table.find(id))
                .set((
                    trades::status.eq(TradeStatus::Closed.to_string()),
                    trades::exit_price.eq(exit_price.map(|p| p.to_string())),
                    trades::exit_time.eq(Some(exit_time.naive_utc())),
                    trades::exit_reason.eq(Some(reason.to_string())),
                    trades::realized_pnl.eq(realized_pnl.map(|p| p.to_string())),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn get_open_trade(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> Result<Option<Trade>, JtError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let row: Option<TradeRow> = trades::table
                .filter(trades::account_id.eq(account_id))
                .filter(trades::symbol.eq(&symbol))
                .filter(trades::status.eq(TradeStatus::Open.to_string()))
                .order(trades::entry_time.desc())
                .first(conn)
                .optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    pub async fn list_open_trades_for_strategy(
        &self,
        strategy_id: StrategyId,
    ) -> Result<Vec<Trade>, JtError> {
        self.with_conn(move |conn| {
            let rows: Vec<TradeRow> = trades::table
                .filter(trades::strategy_id.eq(strategy_id))
                .filter(trades::status.eq(TradeStatus::Open.to_string()))
                .load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    pub async fn list_open_trades(&self) -> Result<Vec<Trade>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<TradeRow> = trades::table
                .filter(trades::status.eq(TradeStatus::Open.to_string()))
                .load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    pub async fn list_stale_open_trades(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Trade>, JtError> {
        self.with_conn(move |conn| {
            let rows: Vec<TradeRow> = trades::table
                .filter(trades::status.eq(TradeStatus::Open.to_string()))
                .filter(trades::entry_time.lt(older_than.naive_utc()))
                .load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    /// Match a fill back to the open trade it belongs to: by its resting
    /// exit order ids, or by the entry's client-order-id.
    pub async fn find_open_trade_for_order(
        &self,
        account_id: AccountId,
        order_id: &str,
        client_order_id: Option<&str>,
    ) -> Result<Option<Trade>, JtError> {
        let order_id = order_id.to_string();
        let client_order_id = client_order_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut query = trades::table
                .filter(trades::account_id.eq(account_id))
                .filter(trades::status.eq(TradeStatus::Open.to_string()))
                .filter(
                    trades::tp_order_id
                        .eq(Some(order_id.clone()))
                        .or(trades::sl_order_id.eq(Some(order_id.clone()))),
                )
                .into_boxed();
            if let Some(coid) = client_order_id {
                query = trades::table
                    .filter(trades::account_id.eq(account_id))
                    .filter(trades::status.eq(TradeStatus::Open.to_string()))
                    .filter(
                        trades::tp_order_id
                            .eq(Some(order_id.clone()))
                            .or(trades::sl_order_id.eq(Some(order_id)))
                            .or(trades::client_order_id.eq(coid)),
                    )
                    .into_boxed();
            }
            let row: Option<TradeRow> = query.first(conn).optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    /// Broker-verified quantity wins over the stored one; callers log the
    /// drift before adjusting.
    pub async fn update_trade_quantity(&self, id: TradeId, quantity: Volume) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(trades::table.find(id))
                .set(trades::quantity.eq(quantity.to_string()))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn set_trade_exit_orders(
        &self,
        id: TradeId,
        tp_order_id: Option<OrderId>,
        sl_order_id: Option<OrderId>,
    ) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(trades::table.find(id))
                .set((
                    trades::tp_order_id.eq(tp_order_id),
                    trades::sl_order_id.eq(sl_order_id),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn set_trade_break_even_applied(&self, id: TradeId) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(trades::table.find(id))
                .set(trades::break_even_applied.eq(true))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Sum of realized P&L for a trader's closed trades since `since`.
    /// Losses come back negative.
    pub async fn realized_pnl_since(
        &self,
        trader_id: TraderId,
        since: DateTime<Utc>,
    ) -> Result<Decimal, JtError> {
        self.with_conn(move |conn| {
            let rows: Vec<Option<String>> = trades::table
                .filter(trades::trader_id.eq(trader_id))
                .filter(trades::status.eq(TradeStatus::Closed.to_string()))
                .filter(trades::exit_time.ge(since.naive_utc()))
                .select(trades::realized_pnl)
                .load(conn)?;
            let mut total = Decimal::ZERO;
            for value in rows.into_iter().flatten() {
                total += parse_decimal("trades.realized_pnl", &value)?;
            }
            Ok(total)
        })
        .await
    }

    // ---- positions -------------------------------------------------------

    pub async fn upsert_position(&self, position: PositionAggregate) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            let existing: Option<PositionRow> = positions::table
                .filter(positions::strategy_id.eq(position.strategy_id))
                .filter(positions::symbol.eq(&position.symbol))
                .filter(positions::open.eq(true))
                .first(conn)
                .optional()?;

            let entries = encode_json("positions.entries", &position.entries)?;
            match existing {
                Some(row) => {
                    diesel::update(positions::table.find(row.id))
                        .set((
                            positions::side.eq(position.side.to_string()),
                            positions::quantity.eq(position.quantity.to_string()),
                            positions::average_price.eq(position.average_price.to_string()),
                            positions::entries.eq(entries),
                            positions::open_pnl.eq(position.open_pnl.to_string()),
                            positions::worst_pnl.eq(position.worst_pnl.to_string()),
                            positions::best_pnl.eq(position.best_pnl.to_string()),
                            positions::open.eq(position.open),
                            positions::updated_at.eq(position.updated_at.naive_utc()),
                        ))
                        .execute(conn)?;
                }
                None => {
                    let row = NewPositionRow {
                        strategy_id: position.strategy_id,
                        symbol: position.symbol.clone(),
                        side: position.side.to_string(),
                        quantity: position.quantity.to_string(),
                        average_price: position.average_price.to_string(),
                        entries,
                        open_pnl: position.open_pnl.to_string(),
                        worst_pnl: position.worst_pnl.to_string(),
                        best_pnl: position.best_pnl.to_string(),
                        open: position.open,
                        opened_at: position.opened_at.naive_utc(),
                        updated_at: position.updated_at.naive_utc(),
                    };
                    diesel::insert_into(positions::table).values(&row).execute(conn)?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn get_open_position(
        &self,
        strategy_id: StrategyId,
        symbol: &str,
    ) -> Result<Option<PositionAggregate>, JtError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let row: Option<PositionRow> = positions::table
                .filter(positions::strategy_id.eq(strategy_id))
                .filter(positions::symbol.eq(&symbol))
                .filter(positions::open.eq(true))
                .first(conn)
                .optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    pub async fn close_position(
        &self,
        strategy_id: StrategyId,
        symbol: &str,
    ) -> Result<(), JtError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            diesel::update(
                positions::table
                    .filter(positions::strategy_id.eq(strategy_id))
                    .filter(positions::symbol.eq(&symbol)),
            )
            .set((
                positions::open.eq(false),
                positions::quantity.eq("0"),
                positions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    // ---- copy trading ----------------------------------------------------

    /// Registers a leader. Fails with `IntegrityViolation` when the account
    /// already follows someone: leader-or-follower, never both.
    pub async fn add_leader_account(
        &self,
        account_id: AccountId,
        auto_copy_enabled: bool,
    ) -> Result<i64, JtError> {
        self.with_conn(move |conn| {
            conn.transaction::<i64, JtError, _>(|conn| {
                let follows: i64 = follower_accounts::table
                    .filter(follower_accounts::account_id.eq(account_id))
                    .count()
                    .get_result(conn)?;
                if follows > 0 {
                    return Err(JtError::IntegrityViolation(format!(
                        "account {} is already a follower",
                        account_id
                    )));
                }
                diesel::insert_into(leader_accounts::table)
                    .values((
                        leader_accounts::account_id.eq(account_id),
                        leader_accounts::auto_copy_enabled.eq(auto_copy_enabled),
                    ))
                    .execute(conn)?;
                last_insert_id(conn)
            })
        })
        .await
    }

    /// Registers a follower under a leader. Fails when the follower account
    /// is itself a leader.
    pub async fn add_follower_account(
        &self,
        leader_account_id: AccountId,
        account_id: AccountId,
        multiplier: Decimal,
        max_position_size: Volume,
        copy_tp: bool,
        copy_sl: bool,
    ) -> Result<i64, JtError> {
        self.with_conn(move |conn| {
            conn.transaction::<i64, JtError, _>(|conn| {
                let leads: i64 = leader_accounts::table
                    .filter(leader_accounts::account_id.eq(account_id))
                    .count()
                    .get_result(conn)?;
                if leads > 0 {
                    return Err(JtError::IntegrityViolation(format!(
                        "account {} is already a leader",
                        account_id
                    )));
                }
                diesel::insert_into(follower_accounts::table)
                    .values((
                        follower_accounts::leader_account_id.eq(leader_account_id),
                        follower_accounts::account_id.eq(account_id),
                        follower_accounts::multiplier.eq(multiplier.to_string()),
                        follower_accounts::max_position_size.eq(max_position_size.to_string()),
                        follower_accounts::copy_tp.eq(copy_tp),
                        follower_accounts::copy_sl.eq(copy_sl),
                        follower_accounts::enabled.eq(true),
                    ))
                    .execute(conn)?;
                last_insert_id(conn)
            })
        })
        .await
    }

    pub async fn list_leader_accounts(&self) -> Result<Vec<LeaderAccount>, JtError> {
        self.with_conn(|conn| {
            let rows: Vec<LeaderAccountRow> = leader_accounts::table.load(conn)?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
        .await
    }

    pub async fn get_leader_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Option<LeaderAccount>, JtError> {
        self.with_conn(move |conn| {
            let row: Option<LeaderAccountRow> = leader_accounts::table
                .filter(leader_accounts::account_id.eq(account_id))
                .first(conn)
                .optional()?;
            Ok(row.map(Into::into))
        })
        .await
    }

    pub async fn list_followers_for(
        &self,
        leader_account_id: AccountId,
        enabled_only: bool,
    ) -> Result<Vec<FollowerAccount>, JtError> {
        self.with_conn(move |conn| {
            let mut query = follower_accounts::table
                .filter(follower_accounts::leader_account_id.eq(leader_account_id))
                .into_boxed();
            if enabled_only {
                query = query.filter(follower_accounts::enabled.eq(true));
            }
            let rows: Vec<FollowerAccountRow> = query.load(conn)?;
            rows.into_iter().map(TryInto::try_into).collect()
        })
        .await
    }

    /// Pipeline separation: a signal-driven trader must not fire on an
    /// account that also follows a leader.
    pub async fn account_has_follower_role(&self, account_id: AccountId) -> Result<bool, JtError> {
        self.with_conn(move |conn| {
            let count: i64 = follower_accounts::table
                .filter(follower_accounts::account_id.eq(account_id))
                .filter(follower_accounts::enabled.eq(true))
                .count()
                .get_result(conn)?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn append_copy_log(&self, log: CopyTradeLog) -> Result<i64, JtError> {
        self.with_conn(move |conn| {
            let row = NewCopyTradeLogRow {
                leader_account_id: log.leader_account_id,
                follower_account_id: log.follower_account_id,
                symbol: log.symbol.clone(),
                side: log.side.to_string(),
                leader_quantity: log.leader_quantity.to_string(),
                follower_quantity: log.follower_quantity.to_string(),
                leader_price: log.leader_price.map(|p| p.to_string()),
                follower_price: log.follower_price.map(|p| p.to_string()),
                status: log.status.to_string(),
                latency_ms: log.latency_ms,
                error: log.error.clone(),
                created_at: log.created_at.naive_utc(),
            };
            diesel::insert_into(copy_trade_logs::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
        .await
    }

    pub async fn update_copy_log(
        &self,
        id: i64,
        status: CopyStatus,
        latency_ms: Option<i64>,
        error: Option<String>,
    ) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            diesel::update(copy_trade_logs::table.find(id))
                .set((
                    copy_trade_logs::status.eq(status.to_string()),
                    copy_trade_logs::latency_ms.eq(latency_ms),
                    copy_trade_logs::error.eq(error),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn get_contract_mapping(
        &self,
        source_symbol: &str,
    ) -> Result<Option<ContractMapping>, JtError> {
        let source_symbol = source_symbol.to_string();
        self.with_conn(move |conn| {
            let row: Option<ContractMappingRow> = contract_mappings::table
                .filter(contract_mappings::source_symbol.eq(&source_symbol))
                .first(conn)
                .optional()?;
            row.map(TryInto::try_into).transpose()
        })
        .await
    }

    // ---- execution failures ---------------------------------------------

    pub async fn append_execution_failure(
        &self,
        failure: NewExecutionFailure,
    ) -> Result<(), JtError> {
        self.with_conn(move |conn| {
            let row = NewExecutionFailureRow {
                strategy_id: failure.strategy_id,
                trader_id: failure.trader_id,
                account_id: failure.account_id,
                symbol: failure.symbol.clone(),
                action: failure.action.clone(),
                error_kind: failure.error_kind.clone(),
                detail: failure.detail.clone(),
                created_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(execution_failures::table).values(&row).execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn list_execution_failures(
        &self,
        limit: i64,
    ) -> Result<Vec<ExecutionFailure>, JtError> {
        self.with_conn(move |conn| {
            let rows: Vec<ExecutionFailureRow> = execution_failures::table
                .order(execution_failures::created_at.desc())
                .limit(limit.clamp(1, 500))
                .load(conn)?;
            Ok(rows
                .into_iter()
                .map(|row| ExecutionFailure {
                    id: row.id,
                    strategy_id: row.strategy_id,
                    trader_id: row.trader_id,
                    account_id: row.account_id,
                    symbol: row.symbol,
                    action: row.action,
                    error_kind: row.error_kind,
                    detail: row.detail,
                    created_at: to_utc(row.created_at),
                })
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standardized_types::accounts::BrokerCredentials;
    use crate::standardized_types::enums::{DirectionFilter, Environment};
    use crate::standardized_types::strategies::{TraderOverrides};
    use rust_decimal_macros::dec;

    async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jt_test.db");
        let store = Store::connect(path.to_str().unwrap()).unwrap();
        store.run_migrations().await.unwrap();
        (store, dir)
    }

    fn sample_strategy() -> Strategy {
        use crate::standardized_types::strategies::*;
        Strategy {
            id: 0,
            user_id: 1,
            name: "mnq scalp".to_string(),
            symbol: "MNQH6".to_string(),
            enabled: true,
            initial_size: dec!(1),
            add_size: dec!(1),
            take_profit: Default::default(),
            stop_loss: Default::default(),
            add_down: Default::default(),
            break_even: Default::default(),
            windows: Vec::new(),
            auto_flat_after_cutoff: false,
            direction: DirectionFilter::Both,
            inverse: false,
            signal_delay: 0,
            signal_cooldown_secs: 30,
            max_signals_per_session: 0,
            max_daily_loss: Decimal::ZERO,
            max_contracts: Decimal::ZERO,
            time_zone: "America/Chicago".to_string(),
            webhook_token: Strategy::new_webhook_token(),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (store, _dir) = temp_store().await;
        // A second (and third) pass must be a no-op, not an error.
        store.run_migrations().await.unwrap();
        store.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn webhook_token_lookup_round_trips() {
        let (store, _dir) = temp_store().await;
        let strategy = sample_strategy();
        let token = strategy.webhook_token.clone();
        let id = store.create_strategy(strategy).await.unwrap();

        let found = store.get_strategy_by_webhook_token(&token).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.signal_cooldown_secs, 30);
        assert!(store
            .get_strategy_by_webhook_token("not-a-token")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn traders_filter_by_enabled() {
        let (store, _dir) = temp_store().await;
        let strategy_id = store.create_strategy(sample_strategy()).await.unwrap();

        for enabled in [true, false] {
            store
                .create_trader(Trader {
                    id: 0,
                    user_id: 1,
                    strategy_id,
                    account_id: 5,
                    enabled,
                    multiplier: dec!(1),
                    overrides: TraderOverrides::default(),
                })
                .await
                .unwrap();
        }

        assert_eq!(
            store.list_traders_for_strategy(strategy_id, true).await.unwrap().len(),
            1
        );
        assert_eq!(
            store.list_traders_for_strategy(strategy_id, false).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn trade_lifecycle_open_close() {
        let (store, _dir) = temp_store().await;
        let id = store
            .open_trade(NewTrade {
                strategy_id: 1,
                trader_id: 1,
                account_id: 2,
                signal_id: None,
                symbol: "MNQH6".to_string(),
                side: PositionSide::Long,
                quantity: dec!(1),
                entry_price: dec!(21500.00),
                entry_time: Utc::now(),
                client_order_id: "JT_SIG_test".to_string(),
                tp_order_id: Some("tp-1".to_string()),
                sl_order_id: None,
            })
            .await
            .unwrap();

        let open = store.get_open_trade(2, "MNQH6").await.unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.quantity, dec!(1));
        assert_eq!(open.tp_order_id.as_deref(), Some("tp-1"));

        store
            .close_trade(id, Some(dec!(21505.00)), Utc::now(), ExitReason::TakeProfit, Some(dec!(10)))
            .await
            .unwrap();
        assert!(store.get_open_trade(2, "MNQH6").await.unwrap().is_none());

        let pnl = store
            .realized_pnl_since(1, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pnl, dec!(10));
    }

    #[tokio::test]
    async fn leader_and_follower_roles_are_exclusive() {
        let (store, _dir) = temp_store().await;
        store.add_leader_account(10, true).await.unwrap();
        store
            .add_follower_account(10, 20, dec!(1), Decimal::ZERO, true, true)
            .await
            .unwrap();

        // Account 10 leads, so it may not follow anyone.
        let err = store
            .add_follower_account(99, 10, dec!(1), Decimal::ZERO, true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, JtError::IntegrityViolation(_)));

        // Account 20 follows, so it may not lead.
        let err = store.add_leader_account(20, true).await.unwrap_err();
        assert!(matches!(err, JtError::IntegrityViolation(_)));

        assert!(store.account_has_follower_role(20).await.unwrap());
        assert!(!store.account_has_follower_role(10).await.unwrap());
    }

    #[tokio::test]
    async fn signal_dedup_window_query() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let first = store
            .record_signal(Some(1), "buy", "{}", "k1", now)
            .await
            .unwrap();

        let second = store
            .record_signal(Some(1), "buy", "{}", "k1", now)
            .await
            .unwrap();

        // The second signal sees the first inside the window...
        assert!(store
            .recent_signal_with_key("k1", now - chrono::Duration::seconds(30), second)
            .await
            .unwrap());
        // ...but the first saw nothing before it.
        assert!(!store
            .recent_signal_with_key("k1", now - chrono::Duration::seconds(30), first)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn needs_reauth_round_trip() {
        let (store, _dir) = temp_store().await;
        let account_id = store
            .create_account(Account {
                id: 0,
                user_id: 1,
                brokerage: Brokerage::Tradovate,
                environment: Environment::Demo,
                credentials: BrokerCredentials::OAuthToken {
                    username: "kaito".to_string(),
                    password: "pw".to_string(),
                    access_token: "tok".to_string(),
                    expires_at: Utc::now(),
                },
                subaccount_id: "DEMO1".to_string(),
                enabled: true,
                needs_reauth: false,
            })
            .await
            .unwrap();

        store
            .mark_account_needs_reauth(account_id, "refresh failed twice")
            .await
            .unwrap();
        let account = store.get_account(account_id).await.unwrap();
        assert!(account.needs_reauth);
        assert!(!account.is_tradable());

        let statuses = store.list_auth_statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].reauth_reason.as_deref(),
            Some("refresh failed twice")
        );
    }

    #[tokio::test]
    async fn execution_failures_capped_and_ordered() {
        let (store, _dir) = temp_store().await;
        for i in 0..5 {
            store
                .append_execution_failure(NewExecutionFailure {
                    strategy_id: Some(1),
                    trader_id: Some(1),
                    account_id: Some(2),
                    symbol: "MNQH6".to_string(),
                    action: "entry".to_string(),
                    error_kind: "broker_rejected".to_string(),
                    detail: format!("attempt {}", i),
                })
                .await
                .unwrap();
        }
        let failures = store.list_execution_failures(3).await.unwrap();
        assert_eq!(failures.len(), 3);
    }
}
