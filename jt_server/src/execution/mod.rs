use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tracing::{info, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::helpers::decimal_calculators::round_quantity;
use jt_standard_lib::standardized_types::accounts::Account;
use jt_standard_lib::standardized_types::enums::{ExitReason, OrderSide, PositionSide, SignalAction};
use jt_standard_lib::standardized_types::orders::{
    ContractSpec, OrderId, OrderOrigin,
};
use jt_standard_lib::standardized_types::signals::SignalId;
use jt_standard_lib::standardized_types::strategies::{EffectiveConfig, Strategy, Trader};
use jt_standard_lib::standardized_types::trades::Trade;
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};
use jt_standard_lib::store::{NewExecutionFailure, NewTrade, Store};

use crate::brokers::{with_broker_retry, BrokerClient, BrokerRegistry};
use crate::credential_keeper::CredentialKeeper;

pub mod bracket;
pub mod decision;

use bracket::{build_bracket, take_profit_prices};
use decision::{plan_transition, TransitionPlan};

/// One unit of work for the execution pool: a trader, its resolved
/// configuration, and the signal intent.
#[derive(Clone, Debug)]
pub struct ExecutionTask {
    pub trader: Trader,
    pub strategy: Strategy,
    pub effective: EffectiveConfig,
    /// Already direction-adjusted for inverse strategies by the router.
    pub action: SignalAction,
    pub signal_id: Option<SignalId>,
    pub signal_price: Option<Price>,
    /// Raw contract count from the signal body, pre-multiplier.
    pub signal_contracts: Option<Volume>,
    pub origin: OrderOrigin,
}

/// Exit orders mirrored from a leader, already priced absolutely. Used by
/// the copy path on fresh entries and reversal re-entries only.
#[derive(Clone, Debug)]
pub struct MirrorExits {
    /// (leader leg quantity, absolute price); follower quantities are
    /// re-allocated proportionally.
    pub take_profits: Vec<(Volume, Price)>,
    pub stop_price: Option<Price>,
}

pub struct ExecutionEngine {
    store: Store,
    brokers: Arc<BrokerRegistry>,
    keeper: Arc<CredentialKeeper>,
}

impl ExecutionEngine {
    pub fn new(store: Store, brokers: Arc<BrokerRegistry>, keeper: Arc<CredentialKeeper>) -> Arc<Self> {
        Arc::new(Self { store, brokers, keeper })
    }

    /// Entry point for the execution pool. Every failure becomes a
    /// structured record; nothing escapes as a panic.
    pub async fn execute_signal_task(&self, task: &ExecutionTask) -> Result<(), JtError> {
        let result = self.run_signal_task(task).await;
        if let Err(err) = &result {
            self.store
                .append_execution_failure(NewExecutionFailure {
                    strategy_id: Some(task.strategy.id),
                    trader_id: Some(task.trader.id),
                    account_id: Some(task.trader.account_id),
                    symbol: task.effective.symbol.clone(),
                    action: task.action.to_string(),
                    error_kind: err.kind().to_string(),
                    detail: err.to_string(),
                })
                .await
                .ok();
        }
        result
    }

    async fn run_signal_task(&self, task: &ExecutionTask) -> Result<(), JtError> {
        let account = self.store.get_account(task.trader.account_id).await?;
        if !account.is_tradable() {
            return Err(JtError::AuthExpired(format!(
                "account {} is out of the auto-trading pool",
                account.id
            )));
        }

        // One refresh-and-retry on expired auth; a second failure marks the
        // account and surfaces as a structured failure.
        match self.run_once(&account, task).await {
            Err(JtError::AuthExpired(_)) => {
                warn!(account_id = account.id, "auth expired mid-task, refreshing once");
                let refreshed = self.keeper.refresh_account(&account).await?;
                self.run_once(&refreshed, task).await
            }
            other => other,
        }
    }

    async fn run_once(&self, account: &Account, task: &ExecutionTask) -> Result<(), JtError> {
        let cfg = &task.effective;
        let adapter = self.brokers.client_for(account.brokerage)?;

        let contract = with_broker_retry("resolve_contract", || {
            adapter.resolve_contract(account, &cfg.symbol)
        })
        .await?;

        // The position snapshot is read immediately before deciding;
        // add/trim/flip all key off it.
        let (prev, _avg) = self.signed_position(adapter.as_ref(), account, &contract, &cfg.symbol).await?;
        let open_trade = self.store.get_open_trade(account.id, &cfg.symbol).await?;

        let target = match self.target_for(task, prev, open_trade.as_ref()) {
            Some(t) => t,
            None => {
                info!(
                    trader_id = task.trader.id,
                    action = %task.action,
                    prev = %prev,
                    "signal produced no transition, dropping"
                );
                return Ok(());
            }
        };

        let plan = plan_transition(prev, target, cfg.add_down.enabled);
        self.apply_plan(account, adapter.as_ref(), &contract, task, prev, open_trade, plan)
            .await
    }

    /// Compute the signed target position for this trader. `None` means the
    /// signal is a no-op for the current state and is dropped (recorded,
    /// not failed).
    fn target_for(&self, task: &ExecutionTask, prev: Decimal, open_trade: Option<&Trade>) -> Option<Decimal> {
        let cfg = &task.effective;

        // A contract count in the signal overrides configured sizes; the
        // multiplier still applies exactly once, here.
        let signal_qty =
            task.signal_contracts.map(|c| round_quantity(c * task.trader.multiplier));
        let entry_size = cfg.capped(signal_qty.unwrap_or(cfg.initial_size));
        if entry_size <= Decimal::ZERO && task.action.is_entry() {
            return None;
        }

        match task.action {
            SignalAction::Buy => self.entry_target(cfg, prev, entry_size, signal_qty, open_trade, Decimal::ONE),
            SignalAction::Sell => {
                self.entry_target(cfg, prev, entry_size, signal_qty, open_trade, -Decimal::ONE)
            }
            SignalAction::CloseLong => (prev > Decimal::ZERO).then_some(Decimal::ZERO),
            SignalAction::CloseShort => (prev < Decimal::ZERO).then_some(Decimal::ZERO),
            SignalAction::Close | SignalAction::Flat => {
                (prev != Decimal::ZERO).then_some(Decimal::ZERO)
            }
            SignalAction::Flip => {
                if prev == Decimal::ZERO {
                    // No position to reverse; the paired buy/sell signal
                    // most charting setups emit alongside a flip handles
                    // the entry case.
                    None
                } else {
                    Some(-prev.signum() * cfg.capped(prev.abs()))
                }
            }
        }
    }

    fn entry_target(
        &self,
        cfg: &EffectiveConfig,
        prev: Decimal,
        entry_size: Volume,
        signal_qty: Option<Volume>,
        open_trade: Option<&Trade>,
        direction: Decimal,
    ) -> Option<Decimal> {
        if prev == Decimal::ZERO {
            return Some(direction * entry_size);
        }
        let same_direction = prev * direction > Decimal::ZERO;
        if !same_direction {
            // A reversal re-enters the magnitude it closes, not the
            // configured initial size.
            return Some(direction * cfg.capped(prev.abs()));
        }

        // Growing an existing position. Merged adds use the configured
        // additional-entry size; with add-down disabled every repeat entry
        // is an independent position of entry size.
        let grow_by = if cfg.add_down.enabled {
            cfg.capped(signal_qty.unwrap_or(cfg.add_size))
        } else {
            entry_size
        };
        if grow_by <= Decimal::ZERO {
            return None;
        }

        if cfg.add_down.enabled && cfg.add_down.min_delay_secs > 0 {
            if let Some(trade) = open_trade {
                let elapsed = Utc::now() - trade.entry_time;
                if elapsed.num_seconds() < cfg.add_down.min_delay_secs {
                    return None;
                }
            }
        }

        let desired = prev.abs() + grow_by;
        let capped = cfg.capped(desired);
        if capped <= prev.abs() {
            // Cap already reached; never trim because of a cap.
            return None;
        }
        Some(direction * capped)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_plan(
        &self,
        account: &Account,
        adapter: &dyn BrokerClient,
        contract: &ContractSpec,
        task: &ExecutionTask,
        prev: Decimal,
        open_trade: Option<Trade>,
        plan: TransitionPlan,
    ) -> Result<(), JtError> {
        let cfg = &task.effective;
        let symbol = &cfg.symbol;

        match plan {
            TransitionPlan::NoOp => Ok(()),

            TransitionPlan::Entry { side, quantity } => {
                self.place_entry(account, adapter, contract, task, side, quantity).await?;
                Ok(())
            }

            TransitionPlan::Close { side, quantity } => {
                self.cancel_exit_orders(account, adapter, contract, symbol, false).await?;
                let coid = task.origin.new_client_order_id();
                with_broker_retry("close_market", || {
                    adapter.place_market(account, symbol, side, quantity, &coid)
                })
                .await?;
                if let Some(trade) = open_trade {
                    self.close_trade_record(&trade, task.signal_price, ExitReason::CloseSignal, contract)
                        .await?;
                }
                self.store.close_position(task.strategy.id, symbol).await.ok();
                Ok(())
            }

            TransitionPlan::AddMerge { side, delta } => {
                let coid = task.origin.new_client_order_id();
                with_broker_retry("add_market", || {
                    adapter.place_market(account, symbol, side, delta, &coid)
                })
                .await?;

                // Cancel every resting take profit and rebuild from the
                // broker-reported weighted average; the local average can
                // drift on fractional prices.
                self.cancel_exit_orders(account, adapter, contract, symbol, true).await?;
                let (now_qty, avg) =
                    self.signed_position(adapter, account, contract, symbol).await?;
                let avg = avg.ok_or_else(|| JtError::IntegrityViolation(
                    "broker reported no average entry after add".to_string(),
                ))?;

                let tp_prices = take_profit_prices(cfg, contract, side, avg, now_qty.abs())?;
                let mut first_tp: Option<OrderId> = None;
                let exit_side = side.opposite();
                for (quantity, price) in tp_prices {
                    let tp_coid = task.origin.new_client_order_id();
                    let id = with_broker_retry("replace_tp", || {
                        adapter.place_limit(account, symbol, exit_side, quantity, price, &tp_coid)
                    })
                    .await?;
                    first_tp.get_or_insert(id);
                }

                if let Some(trade) = open_trade {
                    self.store.update_trade_quantity(trade.id, now_qty.abs()).await?;
                    self.store
                        .set_trade_exit_orders(trade.id, first_tp, trade.sl_order_id.clone())
                        .await?;
                }
                Ok(())
            }

            TransitionPlan::AddFresh { side, fresh_quantity } => {
                // Rule 12: with add-down off, a repeat entry never merges.
                // The old record closes, its exits go away, and a fresh
                // independent bracket goes in.
                if let Some(trade) = &open_trade {
                    self.close_trade_record(trade, task.signal_price, ExitReason::NewEntry, contract)
                        .await?;
                }
                self.cancel_exit_orders(account, adapter, contract, symbol, false).await?;
                self.place_entry(account, adapter, contract, task, side, fresh_quantity).await?;
                Ok(())
            }

            TransitionPlan::Trim { side, delta } => {
                let coid = task.origin.new_client_order_id();
                with_broker_retry("trim_market", || {
                    adapter.place_market(account, symbol, side, delta, &coid)
                })
                .await?;
                if let Some(trade) = open_trade {
                    self.store
                        .update_trade_quantity(trade.id, (prev.abs() - delta).max(Decimal::ZERO))
                        .await?;
                }
                Ok(())
            }

            TransitionPlan::Flip { close_side, close_quantity, enter_side, enter_quantity } => {
                self.cancel_exit_orders(account, adapter, contract, symbol, false).await?;
                let coid = task.origin.new_client_order_id();
                with_broker_retry("flip_close", || {
                    adapter.place_market(account, symbol, close_side, close_quantity, &coid)
                })
                .await?;
                if let Some(trade) = open_trade {
                    self.close_trade_record(&trade, task.signal_price, ExitReason::Flip, contract)
                        .await?;
                }
                self.place_entry(account, adapter, contract, task, enter_side, enter_quantity)
                    .await?;
                Ok(())
            }
        }
    }

    async fn place_entry(
        &self,
        account: &Account,
        adapter: &dyn BrokerClient,
        contract: &ContractSpec,
        task: &ExecutionTask,
        side: OrderSide,
        quantity: Volume,
    ) -> Result<(), JtError> {
        let cfg = &task.effective;
        let client_order_id = task.origin.new_client_order_id();
        let spec = build_bracket(
            cfg,
            contract,
            side,
            quantity,
            task.signal_price,
            client_order_id.clone(),
        )?;

        let ids = with_broker_retry("place_bracket", || adapter.place_bracket(account, &spec)).await?;

        // Prefer the broker-reported fill for the record; fall back to the
        // signal price when the read lags the fill.
        let (_, avg) = self.signed_position(adapter, account, contract, &cfg.symbol).await?;
        let entry_price = avg.or(task.signal_price).unwrap_or(Decimal::ZERO);

        let trade_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        self.store
            .open_trade(NewTrade {
                strategy_id: task.strategy.id,
                trader_id: task.trader.id,
                account_id: account.id,
                signal_id: task.signal_id,
                symbol: cfg.symbol.clone(),
                side: trade_side,
                quantity,
                entry_price,
                entry_time: Utc::now(),
                client_order_id,
                tp_order_id: ids.tp_order_ids.first().cloned(),
                sl_order_id: ids.sl_order_id,
            })
            .await?;
        Ok(())
    }

    async fn close_trade_record(
        &self,
        trade: &Trade,
        exit_price: Option<Price>,
        reason: ExitReason,
        contract: &ContractSpec,
    ) -> Result<(), JtError> {
        let realized = exit_price.map(|exit| {
            let points = (exit - trade.entry_price) * trade.side.sign();
            if contract.tick_size > Decimal::ZERO {
                points / contract.tick_size * contract.tick_value * trade.quantity
            } else {
                points * trade.quantity
            }
        });
        self.store
            .close_trade(trade.id, exit_price, Utc::now(), reason, realized)
            .await
    }

    /// Signed net position and broker-reported average for account+symbol.
    async fn signed_position(
        &self,
        adapter: &dyn BrokerClient,
        account: &Account,
        contract: &ContractSpec,
        symbol: &SymbolName,
    ) -> Result<(Decimal, Option<Price>), JtError> {
        let positions =
            with_broker_retry("list_positions", || adapter.list_positions(account)).await?;
        Ok(positions
            .iter()
            .find(|p| {
                p.symbol == contract.contract_id || p.symbol.eq_ignore_ascii_case(symbol)
            })
            .map(|p| (p.quantity, Some(p.average_price)))
            .unwrap_or((Decimal::ZERO, None)))
    }

    /// Cancel resting exit orders for account+symbol. `only_take_profits`
    /// leaves stops in place (the merged-add path).
    pub async fn cancel_exit_orders(
        &self,
        account: &Account,
        adapter: &dyn BrokerClient,
        contract: &ContractSpec,
        symbol: &SymbolName,
        only_take_profits: bool,
    ) -> Result<(), JtError> {
        let orders =
            with_broker_retry("list_open_orders", || adapter.list_open_orders(account)).await?;
        for order in orders {
            let on_symbol = order.symbol == contract.contract_id
                || order.symbol.eq_ignore_ascii_case(symbol);
            if !on_symbol {
                continue;
            }
            let matches = if only_take_profits {
                order.is_take_profit()
            } else {
                order.is_exit_order()
            };
            if !matches {
                continue;
            }
            with_broker_retry("cancel_exit", || adapter.cancel_order(account, &order.order_id))
                .await?;
        }
        Ok(())
    }

    /// Copy-side transition: move a follower account from `prev` to
    /// `target`. Risk legs attach only when `exits` is given (fresh entries
    /// and reversal re-entries); adds and trims never re-attach them.
    pub async fn execute_copy_transition(
        &self,
        account: &Account,
        symbol: &SymbolName,
        prev: Decimal,
        target: Decimal,
        exits: Option<&MirrorExits>,
    ) -> Result<Option<Price>, JtError> {
        let adapter = self.brokers.client_for(account.brokerage)?;
        let contract = with_broker_retry("resolve_contract", || {
            adapter.resolve_contract(account, symbol)
        })
        .await?;

        // Copies always merge adds; the follower has no add-down plan of
        // its own to say otherwise.
        let plan = plan_transition(prev, target, true);

        match plan {
            TransitionPlan::NoOp => Ok(None),

            TransitionPlan::Entry { side, quantity } => {
                self.copy_entry(account, adapter.as_ref(), &contract, symbol, side, quantity, exits)
                    .await
            }

            TransitionPlan::Close { side, quantity } => {
                self.cancel_exit_orders(account, adapter.as_ref(), &contract, symbol, false).await?;
                let coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_close", || {
                    adapter.place_market(account, symbol, side, quantity, &coid)
                })
                .await?;
                Ok(None)
            }

            TransitionPlan::AddMerge { side, delta } | TransitionPlan::AddFresh { side, fresh_quantity: delta } => {
                let coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_add", || {
                    adapter.place_market(account, symbol, side, delta, &coid)
                })
                .await?;
                Ok(None)
            }

            TransitionPlan::Trim { side, delta } => {
                let coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_trim", || {
                    adapter.place_market(account, symbol, side, delta, &coid)
                })
                .await?;
                Ok(None)
            }

            TransitionPlan::Flip { close_side, close_quantity, enter_side, enter_quantity } => {
                self.cancel_exit_orders(account, adapter.as_ref(), &contract, symbol, false).await?;
                let coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_flip_close", || {
                    adapter.place_market(account, symbol, close_side, close_quantity, &coid)
                })
                .await?;
                self.copy_entry(
                    account,
                    adapter.as_ref(),
                    &contract,
                    symbol,
                    enter_side,
                    enter_quantity,
                    exits,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_entry(
        &self,
        account: &Account,
        adapter: &dyn BrokerClient,
        contract: &ContractSpec,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        exits: Option<&MirrorExits>,
    ) -> Result<Option<Price>, JtError> {
        let coid = OrderOrigin::Copy.new_client_order_id();
        with_broker_retry("copy_entry", || {
            adapter.place_market(account, symbol, side, quantity, &coid)
        })
        .await?;

        let (_, avg) = self.signed_position(adapter, account, contract, symbol).await?;

        if let Some(exits) = exits {
            let exit_side = side.opposite();
            let leader_total: Volume = exits.take_profits.iter().map(|(q, _)| *q).sum();
            let mut remaining = quantity;
            for (i, (leader_qty, price)) in exits.take_profits.iter().enumerate() {
                if remaining <= Decimal::ZERO {
                    break;
                }
                let is_last = i == exits.take_profits.len() - 1;
                let follower_qty = if is_last || leader_total <= Decimal::ZERO {
                    remaining
                } else {
                    round_quantity(quantity * leader_qty / leader_total)
                        .min(remaining)
                        .max(Decimal::ZERO)
                };
                if follower_qty <= Decimal::ZERO {
                    continue;
                }
                let tp_coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_tp", || {
                    adapter.place_limit(account, symbol, exit_side, follower_qty, *price, &tp_coid)
                })
                .await?;
                remaining -= follower_qty;
            }

            if let Some(stop_price) = exits.stop_price {
                let sl_coid = OrderOrigin::Copy.new_client_order_id();
                with_broker_retry("copy_sl", || {
                    adapter.place_stop(account, symbol, exit_side, quantity, stop_price, &sl_coid)
                })
                .await?;
            }
        }

        Ok(avg)
    }

    /// Emergency flatten: cancel everything on the symbol and close at
    /// market, then close any open records for the account.
    pub async fn flatten_account_symbol(
        &self,
        account: &Account,
        symbol: &SymbolName,
    ) -> Result<(), JtError> {
        let adapter = self.brokers.client_for(account.brokerage)?;
        with_broker_retry("flatten", || adapter.flatten(account, symbol)).await?;
        if let Some(trade) = self.store.get_open_trade(account.id, symbol).await? {
            self.store
                .close_trade(trade.id, None, Utc::now(), ExitReason::Manual, None)
                .await?;
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn brokers(&self) -> &Arc<BrokerRegistry> {
        &self.brokers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::sim::SimBroker;
    use jt_standard_lib::settings::ServerSettings;
    use jt_standard_lib::standardized_types::accounts::BrokerCredentials;
    use jt_standard_lib::standardized_types::broker_enum::Brokerage;
    use jt_standard_lib::standardized_types::enums::*;
    use jt_standard_lib::standardized_types::orders::{BrokerOrderType, SIGNAL_ORDER_PREFIX};
    use jt_standard_lib::standardized_types::strategies::*;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: Arc<ExecutionEngine>,
        sim: Arc<SimBroker>,
        store: Store,
        account: Account,
        strategy: Strategy,
        trader: Trader,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::connect(dir.path().join("jt.db").to_str().unwrap()).unwrap();
        store.run_migrations().await.unwrap();

        let sim = Arc::new(
            SimBroker::new().with_contract("MNQH6", dec!(0.25), dec!(0.50)),
        );
        sim.set_mark("MNQH6", dec!(21500.00));

        let mut registry = BrokerRegistry::new();
        registry.register(sim.clone());
        let brokers = Arc::new(registry);

        let account_id = store
            .create_account(Account {
                id: 0,
                user_id: 1,
                brokerage: Brokerage::Sim,
                environment: Environment::Demo,
                credentials: BrokerCredentials::None,
                subaccount_id: "SIM-1".to_string(),
                enabled: true,
                needs_reauth: false,
            })
            .await
            .unwrap();
        let account = store.get_account(account_id).await.unwrap();

        let keeper = CredentialKeeper::new(store.clone(), brokers.clone(), &ServerSettings::default());
        let engine = ExecutionEngine::new(store.clone(), brokers, keeper);

        let strategy = Strategy {
            id: 1,
            user_id: 1,
            name: "mnq scalp".to_string(),
            symbol: "MNQH6".to_string(),
            enabled: true,
            initial_size: dec!(1),
            add_size: dec!(1),
            take_profit: TakeProfitPlan {
                distance_unit: DistanceUnit::Ticks,
                trim_unit: TrimUnit::Percent,
                legs: vec![TakeProfitLegPlan { distance: dec!(20), trim: dec!(100) }],
            },
            stop_loss: StopLossPlan {
                enabled: true,
                distance: dec!(50),
                unit: DistanceUnit::Ticks,
                kind: StopKind::Fixed,
                trail_trigger: Decimal::ZERO,
                trail_frequency: Decimal::ZERO,
            },
            add_down: AddDownPlan::default(),
            break_even: BreakEvenPlan::default(),
            windows: Vec::new(),
            auto_flat_after_cutoff: false,
            direction: DirectionFilter::Both,
            inverse: false,
            signal_delay: 0,
            signal_cooldown_secs: 0,
            max_signals_per_session: 0,
            max_daily_loss: Decimal::ZERO,
            max_contracts: Decimal::ZERO,
            time_zone: "America/Chicago".to_string(),
            webhook_token: Strategy::new_webhook_token(),
        };
        let trader = Trader {
            id: 1,
            user_id: 1,
            strategy_id: 1,
            account_id,
            enabled: true,
            multiplier: dec!(1),
            overrides: TraderOverrides::default(),
        };

        Harness { engine, sim, store, account, strategy, trader, _dir: dir }
    }

    fn task(h: &Harness, action: SignalAction, price: Option<Price>) -> ExecutionTask {
        ExecutionTask {
            trader: h.trader.clone(),
            strategy: h.strategy.clone(),
            effective: h.trader.effective(&h.strategy),
            action,
            signal_id: None,
            signal_price: price,
            signal_contracts: None,
            origin: OrderOrigin::Signal,
        }
    }

    #[tokio::test]
    async fn fresh_entry_places_bracket_with_aligned_exits() {
        let h = harness().await;
        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(1));

        let working = h.sim.working_orders("SIM-1", "MNQH6");
        let tp = working.iter().find(|o| o.order_type == BrokerOrderType::Limit).unwrap();
        let sl = working.iter().find(|o| o.order_type == BrokerOrderType::Stop).unwrap();
        assert_eq!(tp.limit_price, Some(dec!(21505.00)));
        assert_eq!(sl.stop_price, Some(dec!(21487.50)));

        let trade = h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().unwrap();
        assert_eq!(trade.side, PositionSide::Long);
        assert_eq!(trade.quantity, dec!(1));
        assert!(trade.client_order_id.starts_with(SIGNAL_ORDER_PREFIX));
        assert!(trade.tp_order_id.is_some());
    }

    #[tokio::test]
    async fn dca_add_replaces_tp_from_broker_average() {
        let mut h = harness().await;
        h.strategy.add_down = AddDownPlan {
            enabled: true,
            size: dec!(1),
            trigger_distance: dec!(40),
            unit: DistanceUnit::Ticks,
            min_delay_secs: 0,
        };

        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap();
        let first_tp = h
            .sim
            .working_orders("SIM-1", "MNQH6")
            .into_iter()
            .find(|o| o.order_type == BrokerOrderType::Limit)
            .unwrap();

        h.sim.set_mark("MNQH6", dec!(21480.00));
        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21480.00))))
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(2));

        let working = h.sim.working_orders("SIM-1", "MNQH6");
        let tps: Vec<_> = working
            .iter()
            .filter(|o| o.order_type == BrokerOrderType::Limit)
            .collect();
        // Exactly one fresh TP, priced off the broker-reported 21490
        // average, not a locally synthesized one.
        assert_eq!(tps.len(), 1);
        assert_ne!(tps[0].order_id, first_tp.order_id);
        assert_eq!(tps[0].limit_price, Some(dec!(21495.00)));
        assert_eq!(tps[0].quantity, dec!(2));
        // The stop stayed put.
        assert!(working.iter().any(|o| o.order_type == BrokerOrderType::Stop));

        let trade = h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().unwrap();
        assert_eq!(trade.quantity, dec!(2));
    }

    #[tokio::test]
    async fn dca_off_repeat_entry_is_fresh_bracket() {
        let h = harness().await;

        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap();
        let first = h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().unwrap();

        h.sim.set_mark("MNQH6", dec!(21480.00));
        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21480.00))))
            .await
            .unwrap();

        // Old record closed as superseded, broker position merged to 2.
        let reopened = h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().unwrap();
        assert_ne!(reopened.id, first.id);
        assert_eq!(reopened.quantity, dec!(1));
        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(2));

        // Fresh TP/SL computed from 21480.
        let working = h.sim.working_orders("SIM-1", "MNQH6");
        let tp = working.iter().find(|o| o.order_type == BrokerOrderType::Limit).unwrap();
        assert_eq!(tp.limit_price, Some(dec!(21485.00)));
    }

    #[tokio::test]
    async fn sell_on_long_reverses_full_quantity() {
        let h = harness().await;
        h.sim.set_position("SIM-1", "MNQH6", dec!(3), dec!(21500.00));

        h.engine
            .execute_signal_task(&task(&h, SignalAction::Sell, Some(dec!(21450.00))))
            .await
            .unwrap();

        // Closed 3 long, entered 3 short.
        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(-3));
        let working = h.sim.working_orders("SIM-1", "MNQH6");
        assert!(working.iter().any(|o| o.order_type == BrokerOrderType::Limit));
        assert!(working.iter().any(|o| o.order_type == BrokerOrderType::Stop));

        let trade = h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().unwrap();
        assert_eq!(trade.side, PositionSide::Short);
        assert_eq!(trade.quantity, dec!(3));
    }

    #[tokio::test]
    async fn close_signal_cancels_exits_and_flattens() {
        let h = harness().await;
        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap();

        h.engine
            .execute_signal_task(&task(&h, SignalAction::Close, Some(dec!(21510.00))))
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(0));
        assert!(h.sim.working_orders("SIM-1", "MNQH6").is_empty());
        assert!(h.store.get_open_trade(h.account.id, "MNQH6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_long_on_short_position_is_dropped() {
        let h = harness().await;
        h.sim.set_position("SIM-1", "MNQH6", dec!(-2), dec!(21500.00));

        h.engine
            .execute_signal_task(&task(&h, SignalAction::CloseLong, None))
            .await
            .unwrap();

        // Nothing placed, position untouched.
        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(-2));
        assert!(h.sim.placements.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn contract_cap_bounds_signal_quantity() {
        let mut h = harness().await;
        h.strategy.max_contracts = dec!(2);

        let mut t = task(&h, SignalAction::Buy, Some(dec!(21500.00)));
        t.effective = h.trader.effective(&h.strategy);
        t.signal_contracts = Some(dec!(5));
        h.engine.execute_signal_task(&t).await.unwrap();

        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(2));
    }

    #[tokio::test]
    async fn auth_expiry_refreshes_once_and_retries() {
        let h = harness().await;
        h.sim.fail_next(JtError::AuthExpired("token rejected".to_string()));

        h.engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("SIM-1", "MNQH6"), dec!(1));
    }

    #[tokio::test]
    async fn broker_rejection_lands_in_failure_log() {
        let h = harness().await;
        h.sim.fail_next(JtError::BrokerRejected { reason: "margin".to_string() });

        let err = h
            .engine
            .execute_signal_task(&task(&h, SignalAction::Buy, Some(dec!(21500.00))))
            .await
            .unwrap_err();
        assert!(matches!(err, JtError::BrokerRejected { .. }));

        let failures = h.store.list_execution_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_kind, "broker_rejected");
        assert_eq!(failures[0].symbol, "MNQH6");
    }
}
