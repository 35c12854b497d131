use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::settings::ServerSettings;
use jt_standard_lib::standardized_types::accounts::{Account, AccountId};
use jt_standard_lib::standardized_types::copy_trading::{CopyTradeLog, FollowerAccount};
use jt_standard_lib::standardized_types::enums::{CopyStatus, OrderSide};
use jt_standard_lib::standardized_types::orders::is_copy_order;
use jt_standard_lib::standardized_types::stream_events::StreamEvent;
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};
use jt_standard_lib::store::Store;

use crate::brokers::{with_broker_retry, BrokerRegistry};
use crate::execution::{ExecutionEngine, MirrorExits};
use crate::streaming::StreamListener;

/// A fill armed this (account, symbol) for propagation; the numbers come
/// from the position message that follows it.
#[derive(Clone, Debug)]
struct ArmedFill {
    at: Instant,
    side: OrderSide,
    price: Price,
}

/// Observes leader fills via the hub and propagates position deltas (not
/// raw fills) to every follower, in parallel, with loop prevention.
pub struct CopyEngine {
    store: Store,
    engine: Arc<ExecutionEngine>,
    brokers: Arc<BrokerRegistry>,
    /// Last seen leader net position per (subaccount, symbol).
    leader_positions: DashMap<(String, SymbolName), Decimal>,
    /// Fills awaiting their position message.
    armed: DashMap<(String, SymbolName), ArmedFill>,
    /// Replay suppression across the session-rollover window, when the
    /// broker re-emits the day's events.
    processed_fills: DashMap<String, Instant>,
    replay_window: Duration,
}

impl CopyEngine {
    pub fn new(
        store: Store,
        engine: Arc<ExecutionEngine>,
        brokers: Arc<BrokerRegistry>,
        settings: &ServerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            brokers,
            leader_positions: DashMap::new(),
            armed: DashMap::new(),
            processed_fills: DashMap::new(),
            replay_window: Duration::from_secs(settings.copy_fill_replay_window_secs),
        })
    }

    /// Build the hub listener for one leader account.
    pub fn listener_for(self: &Arc<Self>, leader: Account) -> Arc<LeaderFillListener> {
        Arc::new(LeaderFillListener { copy: self.clone(), leader })
    }

    /// Handle a leader fill: loop prevention, replay dedup, then arm the
    /// (account, symbol) pair for the position message that follows.
    pub fn handle_fill(
        &self,
        subaccount: &str,
        symbol: &SymbolName,
        side: OrderSide,
        price: Price,
        fill_id: &str,
        client_order_id: Option<&str>,
    ) -> bool {
        // Fills whose parent order is a propagated copy are never
        // re-copied.
        if let Some(coid) = client_order_id {
            if is_copy_order(coid) {
                debug!(fill_id, "copy-origin fill discarded");
                return false;
            }
        }

        let now = Instant::now();
        self.processed_fills
            .retain(|_, seen| now.duration_since(*seen) < self.replay_window);
        if self.processed_fills.contains_key(fill_id) {
            debug!(fill_id, "replayed fill discarded");
            return false;
        }
        self.processed_fills.insert(fill_id.to_string(), now);

        self.armed.insert(
            (subaccount.to_string(), symbol.clone()),
            ArmedFill { at: now, side, price },
        );
        true
    }

    /// Handle a leader position message. Returns the (prev, current) pair
    /// when an armed fill makes this a propagation trigger.
    pub fn handle_position(
        &self,
        subaccount: &str,
        symbol: &SymbolName,
        quantity: Decimal,
    ) -> Option<(Decimal, Decimal, ArmContext)> {
        let key = (subaccount.to_string(), symbol.clone());
        let prev = self
            .leader_positions
            .insert(key.clone(), quantity)
            .unwrap_or(Decimal::ZERO);

        let armed = self.armed.remove(&key)?;
        let (_, armed) = armed;
        // A stale arm (no position message for a long time) is not a
        // trigger; something else moved the book meanwhile.
        if armed.at.elapsed() > Duration::from_secs(30) {
            return None;
        }
        if prev == quantity {
            return None;
        }
        Some((prev, quantity, ArmContext { side: armed.side, price: armed.price, armed_at: armed.at }))
    }

    /// Propagate a leader transition to every enabled follower in
    /// parallel. Both the stream-driven path and manual-trade propagation
    /// converge here.
    pub async fn copy_to_followers(
        &self,
        leader: &Account,
        symbol: &SymbolName,
        leader_prev: Decimal,
        leader_target: Decimal,
        leader_price: Option<Price>,
        armed_at: Option<Instant>,
    ) -> Result<(), JtError> {
        let followers = self.store.list_followers_for(leader.id, true).await?;
        if followers.is_empty() {
            return Ok(());
        }

        // Risk legs propagate only on fresh entries from flat and on the
        // re-entry half of reversals; read the leader's resting exits once
        // for everyone.
        let fresh_entry = leader_prev == Decimal::ZERO && leader_target != Decimal::ZERO;
        let reversal = leader_prev != Decimal::ZERO
            && leader_target != Decimal::ZERO
            && leader_prev.is_sign_positive() != leader_target.is_sign_positive();
        let leader_exits = if fresh_entry || reversal {
            self.read_leader_exits(leader, symbol).await
        } else {
            None
        };

        let mapping = self.store.get_contract_mapping(symbol).await?;

        let jobs = followers.into_iter().map(|follower| {
            let leader_exits = leader_exits.clone();
            let mapping = mapping.clone();
            async move {
                self.copy_one(
                    leader,
                    &follower,
                    symbol,
                    leader_prev,
                    leader_target,
                    leader_price,
                    leader_exits,
                    mapping.as_ref().map(|m| (m.target_symbol.clone(), m.qty_multiplier)),
                    armed_at,
                )
                .await;
            }
        });
        // One slow or failing follower never blocks the others.
        join_all(jobs).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_one(
        &self,
        leader: &Account,
        follower: &FollowerAccount,
        symbol: &SymbolName,
        leader_prev: Decimal,
        leader_target: Decimal,
        leader_price: Option<Price>,
        leader_exits: Option<MirrorExits>,
        mapping: Option<(SymbolName, Decimal)>,
        armed_at: Option<Instant>,
    ) {
        let (target_symbol, qty_multiplier) =
            mapping.unwrap_or_else(|| (symbol.clone(), Decimal::ONE));

        let follower_prev = follower.scale_quantity(leader_prev * qty_multiplier);
        let follower_target = follower.scale_quantity(leader_target * qty_multiplier);

        let side = if leader_target > leader_prev { OrderSide::Buy } else { OrderSide::Sell };
        let log_id = self
            .store
            .append_copy_log(CopyTradeLog {
                id: 0,
                leader_account_id: leader.id,
                follower_account_id: follower.account_id,
                symbol: target_symbol.clone(),
                side,
                leader_quantity: (leader_target - leader_prev).abs(),
                follower_quantity: (follower_target - follower_prev).abs(),
                leader_price,
                follower_price: None,
                status: CopyStatus::Pending,
                latency_ms: None,
                error: None,
                created_at: Utc::now(),
            })
            .await
            .ok();

        let result = self
            .execute_for_follower(follower, &target_symbol, follower_prev, follower_target, leader_exits)
            .await;

        let latency_ms = armed_at.map(|t| t.elapsed().as_millis() as i64);
        if let Some(log_id) = log_id {
            let update = match &result {
                Ok(_) => self
                    .store
                    .update_copy_log(log_id, CopyStatus::Filled, latency_ms, None)
                    .await,
                Err(e) => self
                    .store
                    .update_copy_log(log_id, CopyStatus::Failed, latency_ms, Some(e.to_string()))
                    .await,
            };
            if let Err(e) = update {
                warn!(log_id, error = %e, "copy log update failed");
            }
        }

        match result {
            Ok(_) => info!(
                follower_account = follower.account_id,
                %follower_prev,
                %follower_target,
                "copy propagated"
            ),
            Err(e) => warn!(
                follower_account = follower.account_id,
                error = %e,
                "copy failed"
            ),
        }
    }

    async fn execute_for_follower(
        &self,
        follower: &FollowerAccount,
        symbol: &SymbolName,
        prev: Volume,
        target: Volume,
        leader_exits: Option<MirrorExits>,
    ) -> Result<Option<Price>, JtError> {
        let account = self.store.get_account(follower.account_id).await?;
        if !account.is_tradable() {
            return Err(JtError::AuthExpired(format!(
                "follower account {} is out of the pool",
                account.id
            )));
        }

        // Per-follower risk leg opt-outs.
        let exits = leader_exits.map(|mut exits| {
            if !follower.copy_tp {
                exits.take_profits.clear();
            }
            if !follower.copy_sl {
                exits.stop_price = None;
            }
            exits
        });
        let exits = match exits {
            Some(e) if e.take_profits.is_empty() && e.stop_price.is_none() => None,
            other => other,
        };

        self.engine
            .execute_copy_transition(&account, symbol, prev, target, exits.as_ref())
            .await
    }

    /// The leader's resting exit orders, mirrored as absolute prices.
    async fn read_leader_exits(
        &self,
        leader: &Account,
        symbol: &SymbolName,
    ) -> Option<MirrorExits> {
        let adapter = self.brokers.client_for(leader.brokerage).ok()?;
        let orders = with_broker_retry("leader_exits", || adapter.list_open_orders(leader))
            .await
            .ok()?;

        let mut take_profits = Vec::new();
        let mut stop_price = None;
        for order in orders {
            if !order.symbol.eq_ignore_ascii_case(symbol) {
                continue;
            }
            if order.is_take_profit() {
                if let Some(price) = order.limit_price {
                    take_profits.push((order.quantity, price));
                }
            } else if order.is_exit_order() {
                if stop_price.is_none() {
                    stop_price = order.stop_price;
                }
            }
        }
        if take_profits.is_empty() && stop_price.is_none() {
            None
        } else {
            Some(MirrorExits { take_profits, stop_price })
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArmContext {
    pub side: OrderSide,
    pub price: Price,
    pub armed_at: Instant,
}

/// Hub listener for one leader account. Does nothing but filter, arm, and
/// spawn; the fan-out runs off the hub's read path.
pub struct LeaderFillListener {
    copy: Arc<CopyEngine>,
    leader: Account,
}

impl StreamListener for LeaderFillListener {
    fn on_event(&self, event: &StreamEvent) {
        match event {
            StreamEvent::Fill { account, symbol, side, price, fill_id, client_order_id, .. } => {
                if account != &self.leader.subaccount_id {
                    return;
                }
                self.copy.handle_fill(
                    account,
                    symbol,
                    *side,
                    *price,
                    fill_id,
                    client_order_id.as_deref(),
                );
            }
            StreamEvent::PositionUpdate { account, symbol, quantity, .. } => {
                if account != &self.leader.subaccount_id {
                    return;
                }
                if let Some((prev, current, ctx)) =
                    self.copy.handle_position(account, symbol, *quantity)
                {
                    let copy = self.copy.clone();
                    let leader = self.leader.clone();
                    let symbol = symbol.clone();
                    tokio::spawn(async move {
                        if let Err(e) = copy
                            .copy_to_followers(
                                &leader,
                                &symbol,
                                prev,
                                current,
                                Some(ctx.price),
                                Some(ctx.armed_at),
                            )
                            .await
                        {
                            warn!(error = %e, "copy fan-out failed");
                        }
                    });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::sim::SimBroker;
    use crate::brokers::BrokerClient;
    use crate::credential_keeper::CredentialKeeper;
    use jt_standard_lib::standardized_types::accounts::BrokerCredentials;
    use jt_standard_lib::standardized_types::broker_enum::Brokerage;
    use jt_standard_lib::standardized_types::enums::Environment;
    use jt_standard_lib::standardized_types::orders::{BrokerOrderType, COPY_ORDER_PREFIX};
    use rust_decimal_macros::dec;

    struct Harness {
        copy: Arc<CopyEngine>,
        sim: Arc<SimBroker>,
        store: Store,
        leader: Account,
        _dir: tempfile::TempDir,
    }

    async fn account(store: &Store, subaccount: &str) -> Account {
        let id = store
            .create_account(Account {
                id: 0,
                user_id: 1,
                brokerage: Brokerage::Sim,
                environment: Environment::Demo,
                credentials: BrokerCredentials::None,
                subaccount_id: subaccount.to_string(),
                enabled: true,
                needs_reauth: false,
            })
            .await
            .unwrap();
        store.get_account(id).await.unwrap()
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::connect(dir.path().join("jt.db").to_str().unwrap()).unwrap();
        store.run_migrations().await.unwrap();

        let sim = Arc::new(SimBroker::new().with_contract("MNQH6", dec!(0.25), dec!(0.50)));
        sim.set_mark("MNQH6", dec!(21500.00));
        let mut registry = BrokerRegistry::new();
        registry.register(sim.clone());
        let brokers = Arc::new(registry);

        let settings = ServerSettings::default();
        let keeper = CredentialKeeper::new(store.clone(), brokers.clone(), &settings);
        let engine = ExecutionEngine::new(store.clone(), brokers.clone(), keeper);
        let copy = CopyEngine::new(store.clone(), engine, brokers, &settings);

        let leader = account(&store, "LEAD-1").await;
        store.add_leader_account(leader.id, true).await.unwrap();

        Harness { copy, sim, store, leader, _dir: dir }
    }

    async fn follower(h: &Harness, subaccount: &str, multiplier: Decimal, cap: Volume) -> Account {
        let acct = account(&h.store, subaccount).await;
        h.store
            .add_follower_account(h.leader.id, acct.id, multiplier, cap, true, true)
            .await
            .unwrap();
        acct
    }

    #[tokio::test]
    async fn copy_fills_with_the_copy_prefix_are_discarded() {
        let h = harness().await;
        let coid = format!("{}abc", COPY_ORDER_PREFIX);
        assert!(!h.copy.handle_fill("LEAD-1", &"MNQH6".to_string(), OrderSide::Buy, dec!(21500), "f1", Some(&coid)));
        // Manual and signal fills pass.
        assert!(h.copy.handle_fill("LEAD-1", &"MNQH6".to_string(), OrderSide::Buy, dec!(21500), "f2", Some("JT_SIG_x")));
        assert!(h.copy.handle_fill("LEAD-1", &"MNQH6".to_string(), OrderSide::Buy, dec!(21500), "f3", None));
    }

    #[tokio::test]
    async fn replayed_fill_ids_are_deduplicated() {
        let h = harness().await;
        let symbol = "MNQH6".to_string();
        assert!(h.copy.handle_fill("LEAD-1", &symbol, OrderSide::Buy, dec!(21500), "fill-9", None));
        assert!(!h.copy.handle_fill("LEAD-1", &symbol, OrderSide::Buy, dec!(21500), "fill-9", None));
    }

    #[tokio::test]
    async fn entry_from_flat_propagates_scaled_quantity() {
        let h = harness().await;
        follower(&h, "FOLL-1", dec!(2), Decimal::ZERO).await;
        follower(&h, "FOLL-2", dec!(3), dec!(2)).await; // capped at 2

        h.copy
            .copy_to_followers(&h.leader, &"MNQH6".to_string(), dec!(0), dec!(1), Some(dec!(21500)), None)
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("FOLL-1", "MNQH6"), dec!(2));
        assert_eq!(h.sim.position_quantity("FOLL-2", "MNQH6"), dec!(2));

        // Every order the copy path placed carries the copy prefix.
        let placements = h.sim.placements.lock().unwrap();
        assert!(!placements.is_empty());
        assert!(placements.iter().all(|p| p.client_order_id.starts_with(COPY_ORDER_PREFIX)));
    }

    #[tokio::test]
    async fn add_propagates_delta_without_closing_or_risk_legs() {
        let h = harness().await;
        let f = follower(&h, "FOLL-1", dec!(1), Decimal::ZERO).await;
        h.sim.set_position("FOLL-1", "MNQH6", dec!(1), dec!(21500));

        // Leader went 1 -> 2: the follower buys the delta only.
        h.copy
            .copy_to_followers(&h.leader, &"MNQH6".to_string(), dec!(1), dec!(2), Some(dec!(21480)), None)
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("FOLL-1", "MNQH6"), dec!(2));
        // No exits attached on adds, even with copy_tp/copy_sl on.
        assert!(h.sim.working_orders("FOLL-1", "MNQH6").is_empty());

        let placements = h.sim.placements.lock().unwrap();
        let buys: Vec<_> = placements.iter().filter(|p| p.subaccount == "FOLL-1").collect();
        assert_eq!(buys.len(), 1);
        assert_eq!(buys[0].quantity, dec!(1));
        assert_eq!(buys[0].order_type, BrokerOrderType::Market);
        drop(placements);

        let logs = h.store.list_followers_for(h.leader.id, true).await.unwrap();
        assert_eq!(logs[0].account_id, f.id);
    }

    #[tokio::test]
    async fn fresh_entry_mirrors_leader_exits() {
        let h = harness().await;
        follower(&h, "FOLL-1", dec!(1), Decimal::ZERO).await;

        // Leader holds 1 with a resting TP and stop.
        h.sim.set_position("LEAD-1", "MNQH6", dec!(1), dec!(21500));
        let leader_tp = h
            .sim
            .place_limit(&h.leader, &"MNQH6".to_string(), OrderSide::Sell, dec!(1), dec!(21505.00), "JT_SIG_tp")
            .await
            .unwrap();
        let _ = leader_tp;
        h.sim
            .place_stop(&h.leader, &"MNQH6".to_string(), OrderSide::Sell, dec!(1), dec!(21487.50), "JT_SIG_sl")
            .await
            .unwrap();

        h.copy
            .copy_to_followers(&h.leader, &"MNQH6".to_string(), dec!(0), dec!(1), Some(dec!(21500)), None)
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("FOLL-1", "MNQH6"), dec!(1));
        let working = h.sim.working_orders("FOLL-1", "MNQH6");
        assert!(working.iter().any(|o| o.order_type == BrokerOrderType::Limit
            && o.limit_price == Some(dec!(21505.00))));
        assert!(working.iter().any(|o| o.order_type == BrokerOrderType::Stop
            && o.stop_price == Some(dec!(21487.50))));
    }

    #[tokio::test]
    async fn position_message_only_triggers_when_armed() {
        let h = harness().await;
        let symbol = "MNQH6".to_string();

        // Unarmed position message: no trigger (e.g. replay or reconcile).
        assert!(h.copy.handle_position("LEAD-1", &symbol, dec!(1)).is_none());

        // Armed: the next position change triggers with correct prev.
        h.copy.handle_fill("LEAD-1", &symbol, OrderSide::Buy, dec!(21500), "f1", None);
        let (prev, current, _) = h.copy.handle_position("LEAD-1", &symbol, dec!(2)).unwrap();
        assert_eq!(prev, dec!(1));
        assert_eq!(current, dec!(2));
    }

    #[tokio::test]
    async fn one_failing_follower_does_not_block_the_rest() {
        let h = harness().await;
        // FOLL-0 will fail (account disabled); FOLL-1 succeeds.
        let bad = account(&h.store, "FOLL-0").await;
        h.store
            .add_follower_account(h.leader.id, bad.id, dec!(1), Decimal::ZERO, true, true)
            .await
            .unwrap();
        h.store.mark_account_needs_reauth(bad.id, "test").await.unwrap();
        follower(&h, "FOLL-1", dec!(1), Decimal::ZERO).await;

        h.copy
            .copy_to_followers(&h.leader, &"MNQH6".to_string(), dec!(0), dec!(1), None, None)
            .await
            .unwrap();

        assert_eq!(h.sim.position_quantity("FOLL-1", "MNQH6"), dec!(1));
        assert_eq!(h.sim.position_quantity("FOLL-0", "MNQH6"), dec!(0));
    }
}
