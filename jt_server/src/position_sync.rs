use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::helpers::decimal_calculators::{round_to_tick_size, ticks_to_points};
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::{ExitReason, OrderSide, PositionSide};
use jt_standard_lib::standardized_types::orders::OrderOrigin;
use jt_standard_lib::standardized_types::stream_events::StreamEvent;
use jt_standard_lib::standardized_types::trades::{PositionAggregate, Trade};
use jt_standard_lib::standardized_types::{Price, SymbolName};
use jt_standard_lib::store::Store;

use crate::brokers::{with_broker_retry, BrokerRegistry};
use crate::streaming::StreamListener;

/// Per-account balance snapshot from the stream, for the monitoring
/// surface and breach checks.
#[derive(Clone, Debug, Serialize)]
pub struct BalanceSnapshot {
    pub cash_value: Decimal,
    pub realized_pnl_day: Decimal,
    pub as_of: DateTime<Utc>,
}

/// The hub listener that keeps the store consistent with the broker in
/// real time: fills close trade records, position messages maintain the
/// derived aggregates, balances feed breach monitoring, and the
/// break-even plan moves stops. Callbacks only clone-and-spawn; all real
/// work happens off the hub's read path.
pub struct PositionSyncListener {
    inner: Arc<PositionSyncInner>,
}

struct PositionSyncInner {
    store: Store,
    brokers: Arc<BrokerRegistry>,
    brokerage: Brokerage,
    balances: Arc<DashMap<String, BalanceSnapshot>>,
}

impl PositionSyncListener {
    pub fn new(
        store: Store,
        brokers: Arc<BrokerRegistry>,
        brokerage: Brokerage,
        balances: Arc<DashMap<String, BalanceSnapshot>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(PositionSyncInner { store, brokers, brokerage, balances }),
        })
    }
}

impl StreamListener for PositionSyncListener {
    fn on_event(&self, event: &StreamEvent) {
        let inner = self.inner.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.handle(event).await {
                warn!(error = %e, "position sync event failed");
            }
        });
    }
}

impl PositionSyncInner {
    async fn handle(&self, event: StreamEvent) -> Result<(), JtError> {
        match event {
            StreamEvent::Fill { account, side, quantity, price, order_id, client_order_id, time, .. } => {
                self.handle_fill(&account, side, quantity, price, &order_id, client_order_id.as_deref(), time)
                    .await
            }
            StreamEvent::PositionUpdate { account, symbol, quantity, average_price, time } => {
                self.handle_position(&account, &symbol, quantity, average_price, time).await
            }
            StreamEvent::Balance { account, cash_value, realized_pnl_day, time } => {
                self.balances.insert(
                    account,
                    BalanceSnapshot { cash_value, realized_pnl_day, as_of: time },
                );
                Ok(())
            }
            StreamEvent::OrderUpdate { .. } | StreamEvent::Unknown { .. } => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_fill(
        &self,
        subaccount: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Price,
        order_id: &str,
        client_order_id: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<(), JtError> {
        let Some(account) = self
            .store
            .get_account_by_subaccount(self.brokerage, subaccount)
            .await?
        else {
            debug!(subaccount, "fill for an account we do not manage");
            return Ok(());
        };

        let Some(trade) = self
            .store
            .find_open_trade_for_order(account.id, order_id, client_order_id)
            .await?
        else {
            return Ok(());
        };

        // Exit order fills close the record with their real reason.
        if trade.tp_order_id.as_deref() == Some(order_id) {
            info!(trade_id = trade.id, %price, "take profit filled");
            self.close_with(&account, &trade, price, time, ExitReason::TakeProfit).await?;
            return Ok(());
        }
        if trade.sl_order_id.as_deref() == Some(order_id) {
            info!(trade_id = trade.id, %price, "stop loss filled");
            self.close_with(&account, &trade, price, time, ExitReason::StopLoss).await?;
            return Ok(());
        }

        // Entry/add fill: fold into the derived aggregate and give the
        // break-even plan a look at the new mark.
        self.fold_into_position(&trade, side, quantity, price, time).await?;
        self.maybe_move_stop_to_break_even(&account, &trade, price).await
    }

    async fn close_with(
        &self,
        account: &jt_standard_lib::standardized_types::accounts::Account,
        trade: &Trade,
        exit_price: Price,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<(), JtError> {
        let realized = self.realized_pnl(account, trade, exit_price).await;
        self.store
            .close_trade(trade.id, Some(exit_price), time, reason, realized)
            .await?;
        self.store.close_position(trade.strategy_id, &trade.symbol).await?;
        Ok(())
    }

    async fn realized_pnl(
        &self,
        account: &jt_standard_lib::standardized_types::accounts::Account,
        trade: &Trade,
        exit_price: Price,
    ) -> Option<Decimal> {
        let adapter = self.brokers.client_for(account.brokerage).ok()?;
        let contract = adapter.resolve_contract(account, &trade.symbol).await.ok()?;
        let points = (exit_price - trade.entry_price) * trade.side.sign();
        if contract.tick_size > Decimal::ZERO {
            Some(points / contract.tick_size * contract.tick_value * trade.quantity)
        } else {
            Some(points * trade.quantity)
        }
    }

    async fn fold_into_position(
        &self,
        trade: &Trade,
        side: OrderSide,
        quantity: Decimal,
        price: Price,
        time: DateTime<Utc>,
    ) -> Result<(), JtError> {
        let existing = self
            .store
            .get_open_position(trade.strategy_id, &trade.symbol)
            .await?;

        let mut position = match existing {
            Some(mut position) => {
                let grows = position.side.entry_order_side() == Some(side);
                if grows {
                    position.apply_add(price, quantity, time);
                } else {
                    position.apply_trim(quantity, time);
                }
                position
            }
            // First fill opens the aggregate; it already contains this
            // entry, so nothing further is folded in.
            None => PositionAggregate::open_with(
                trade.strategy_id,
                trade.symbol.clone(),
                trade.side,
                price,
                quantity,
                time,
            ),
        };
        position.mark(price, time);
        self.store.upsert_position(position).await
    }

    /// Position messages carry broker symbols (often contract ids) while
    /// records carry strategy symbols; fall back to a root match when the
    /// direct lookup misses.
    async fn open_trade_for(
        &self,
        account_id: jt_standard_lib::standardized_types::accounts::AccountId,
        broker_symbol: &str,
    ) -> Result<Option<Trade>, JtError> {
        if let Some(trade) = self.store.get_open_trade(account_id, broker_symbol).await? {
            return Ok(Some(trade));
        }
        let trades = self.store.list_open_trades().await?;
        Ok(trades
            .into_iter()
            .filter(|t| t.account_id == account_id)
            .find(|t| symbols_relate(&t.symbol, broker_symbol)))
    }

    async fn handle_position(
        &self,
        subaccount: &str,
        broker_symbol: &SymbolName,
        quantity: Decimal,
        average_price: Price,
        time: DateTime<Utc>,
    ) -> Result<(), JtError> {
        let Some(account) = self
            .store
            .get_account_by_subaccount(self.brokerage, subaccount)
            .await?
        else {
            return Ok(());
        };

        // Any open trade on the account whose broker went flat is closed;
        // quantity drift is adopted with a log line.
        if quantity != Decimal::ZERO {
            if let Some(trade) = self.open_trade_for(account.id, broker_symbol).await? {
                if trade.quantity != quantity.abs() {
                    warn!(
                        trade_id = trade.id,
                        stored = %trade.quantity,
                        broker = %quantity.abs(),
                        "position drift, adopting broker quantity"
                    );
                    self.store.update_trade_quantity(trade.id, quantity.abs()).await?;
                }
                let mut position = self
                    .store
                    .get_open_position(trade.strategy_id, &trade.symbol)
                    .await?
                    .unwrap_or_else(|| {
                        PositionAggregate::open_with(
                            trade.strategy_id,
                            trade.symbol.clone(),
                            PositionSide::of_quantity(quantity),
                            average_price,
                            quantity.abs(),
                            time,
                        )
                    });
                position.quantity = quantity.abs();
                position.side = PositionSide::of_quantity(quantity);
                position.average_price = average_price;
                position.updated_at = time;
                self.store.upsert_position(position).await?;
            }
            return Ok(());
        }

        // Broker is flat: any open record on this account+symbol is over.
        if let Some(trade) = self.open_trade_for(account.id, broker_symbol).await? {
            info!(trade_id = trade.id, "broker flat, closing record");
            self.store
                .close_trade(trade.id, None, time, ExitReason::BrokerFlat, None)
                .await?;
            self.store.close_position(trade.strategy_id, &trade.symbol).await?;
        }
        Ok(())
    }

    /// Break-even management: once price has moved `trigger` in the
    /// trade's favor, the stop is cancel-and-replaced at entry plus the
    /// configured offset. At most once per trade.
    async fn maybe_move_stop_to_break_even(
        &self,
        account: &jt_standard_lib::standardized_types::accounts::Account,
        trade: &Trade,
        mark: Price,
    ) -> Result<(), JtError> {
        if trade.break_even_applied {
            return Ok(());
        }
        let Some(trader) = self.store.get_trader(trade.trader_id).await.ok() else {
            return Ok(());
        };
        let strategy = self.store.get_strategy(trade.strategy_id).await?;
        let cfg = trader.effective(&strategy);
        if !cfg.break_even.enabled {
            return Ok(());
        }

        let adapter = self.brokers.client_for(account.brokerage)?;
        let contract = adapter.resolve_contract(account, &trade.symbol).await?;
        let trigger_points = match cfg.break_even.unit {
            jt_standard_lib::standardized_types::enums::DistanceUnit::Ticks => {
                ticks_to_points(cfg.break_even.trigger_distance, contract.tick_size)
            }
            jt_standard_lib::standardized_types::enums::DistanceUnit::Points => {
                cfg.break_even.trigger_distance
            }
            jt_standard_lib::standardized_types::enums::DistanceUnit::Percent => {
                trade.entry_price * cfg.break_even.trigger_distance / Decimal::from(100)
            }
        };

        let favorable = (mark - trade.entry_price) * trade.side.sign();
        if favorable < trigger_points {
            return Ok(());
        }

        let offset = ticks_to_points(cfg.break_even.offset_ticks, contract.tick_size);
        let new_stop = round_to_tick_size(
            trade.entry_price + offset * trade.side.sign(),
            contract.tick_size,
        );

        // Cancel-and-replace; the modify endpoint is not trusted for
        // bracket-managed exits.
        if let Some(old_stop) = &trade.sl_order_id {
            with_broker_retry("cancel_stop", || adapter.cancel_order(account, old_stop)).await?;
        }
        let exit_side = match trade.side {
            PositionSide::Long => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let coid = OrderOrigin::Signal.new_client_order_id();
        let new_id = with_broker_retry("place_breakeven_stop", || {
            adapter.place_stop(account, &trade.symbol, exit_side, trade.quantity, new_stop, &coid)
        })
        .await?;

        info!(trade_id = trade.id, %new_stop, "stop moved to break even");
        self.store
            .set_trade_exit_orders(trade.id, trade.tp_order_id.clone(), Some(new_id))
            .await?;
        self.store.set_trade_break_even_applied(trade.id).await?;
        Ok(())
    }
}

/// A record symbol relates to a broker symbol when the futures root of the
/// record code appears in the broker's identifier: `MNQH6` relates to both
/// `MNQH6` and `CON.F.US.MNQ.H26`.
fn symbols_relate(record_symbol: &str, broker_symbol: &str) -> bool {
    if record_symbol.eq_ignore_ascii_case(broker_symbol) {
        return true;
    }
    let without_year = record_symbol.trim_end_matches(|c: char| c.is_ascii_digit());
    let root = if without_year.len() < record_symbol.len() && without_year.len() > 1 {
        &record_symbol[..without_year.len() - 1]
    } else {
        without_year
    };
    if root.is_empty() {
        return false;
    }
    let root = root.to_ascii_uppercase();
    broker_symbol
        .to_ascii_uppercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|segment| segment == root)
}
