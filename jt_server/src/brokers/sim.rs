use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::helpers::decimal_calculators::weighted_average_price;
use jt_standard_lib::standardized_types::accounts::Account;
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::OrderSide;
use jt_standard_lib::standardized_types::orders::{
    BracketIds, BracketSpec, BrokerOrder, BrokerOrderStatus, BrokerOrderType, BrokerPosition,
    ContractSpec, OrderId, OrderUpdate,
};
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};

use crate::brokers::BrokerClient;

/// In-process brokerage for the test suites. Market orders fill instantly
/// at the current mark; exits rest as working orders until cancelled.
/// Production wiring never constructs this.
pub struct SimBroker {
    contracts: DashMap<SymbolName, ContractSpec>,
    marks: DashMap<SymbolName, Price>,
    positions: DashMap<(String, SymbolName), SimPosition>,
    working: DashMap<(String, SymbolName), Vec<BrokerOrder>>,
    next_order_id: AtomicU64,
    /// Every outbound placement, for assertions.
    pub placements: Mutex<Vec<SimPlacement>>,
    fail_next: Mutex<Option<JtError>>,
}

#[derive(Clone, Debug)]
struct SimPosition {
    entries: Vec<(Price, Volume)>,
    quantity: Volume, // signed
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimPlacement {
    pub subaccount: String,
    pub symbol: SymbolName,
    pub side: OrderSide,
    pub quantity: Volume,
    pub order_type: BrokerOrderType,
    pub price: Option<Price>,
    pub client_order_id: String,
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            contracts: DashMap::new(),
            marks: DashMap::new(),
            positions: DashMap::new(),
            working: DashMap::new(),
            next_order_id: AtomicU64::new(1),
            placements: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn with_contract(self, symbol: &str, tick_size: Price, tick_value: Price) -> Self {
        self.contracts.insert(
            symbol.to_string(),
            ContractSpec {
                contract_id: format!("SIM-{}", symbol),
                symbol: symbol.to_string(),
                tick_size,
                tick_value,
            },
        );
        self
    }

    pub fn set_mark(&self, symbol: &str, price: Price) {
        self.marks.insert(symbol.to_string(), price);
    }

    /// Seed a broker side position directly, bypassing order flow.
    pub fn set_position(&self, subaccount: &str, symbol: &str, quantity: Volume, average: Price) {
        let key = (subaccount.to_string(), symbol.to_string());
        if quantity == Decimal::ZERO {
            self.positions.remove(&key);
        } else {
            self.positions.insert(
                key,
                SimPosition { entries: vec![(average, quantity.abs())], quantity },
            );
        }
    }

    pub fn position_quantity(&self, subaccount: &str, symbol: &str) -> Volume {
        self.positions
            .get(&(subaccount.to_string(), symbol.to_string()))
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn working_orders(&self, subaccount: &str, symbol: &str) -> Vec<BrokerOrder> {
        self.working
            .get(&(subaccount.to_string(), symbol.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// The next broker call fails with this error, once.
    pub fn fail_next(&self, err: JtError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_injected_failure(&self) -> Result<(), JtError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    fn next_id(&self) -> OrderId {
        format!("sim-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    fn mark_for(&self, symbol: &str) -> Price {
        self.marks.get(symbol).map(|m| *m).unwrap_or(dec!(100))
    }

    fn apply_fill(&self, subaccount: &str, symbol: &str, side: OrderSide, quantity: Volume, price: Price) {
        let key = (subaccount.to_string(), symbol.to_string());
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let mut entry = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| SimPosition { entries: Vec::new(), quantity: Decimal::ZERO });
        let grows = entry.quantity == Decimal::ZERO
            || entry.quantity.is_sign_positive() == signed.is_sign_positive();
        if grows {
            entry.entries.push((price, quantity));
        }
        entry.quantity += signed;
        if entry.quantity == Decimal::ZERO {
            drop(entry);
            self.positions.remove(&key);
        }
    }

    fn record(&self, placement: SimPlacement) {
        self.placements.lock().unwrap().push(placement);
    }

    fn push_working(&self, subaccount: &str, symbol: &str, order: BrokerOrder) {
        self.working
            .entry((subaccount.to_string(), symbol.to_string()))
            .or_default()
            .push(order);
    }
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    fn brokerage(&self) -> Brokerage {
        Brokerage::Sim
    }

    async fn resolve_contract(
        &self,
        _account: &Account,
        symbol: &SymbolName,
    ) -> Result<ContractSpec, JtError> {
        self.contracts
            .get(symbol)
            .map(|c| c.clone())
            .ok_or_else(|| JtError::NotFound(format!("unknown contract {}", symbol)))
    }

    async fn place_market(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        self.take_injected_failure()?;
        let price = self.mark_for(symbol);
        self.apply_fill(&account.subaccount_id, symbol, side, quantity, price);
        self.record(SimPlacement {
            subaccount: account.subaccount_id.clone(),
            symbol: symbol.clone(),
            side,
            quantity,
            order_type: BrokerOrderType::Market,
            price: None,
            client_order_id: client_order_id.to_string(),
        });
        Ok(self.next_id())
    }

    async fn place_bracket(
        &self,
        account: &Account,
        bracket: &BracketSpec,
    ) -> Result<BracketIds, JtError> {
        self.take_injected_failure()?;
        let entry_price = self.mark_for(&bracket.symbol);
        self.apply_fill(
            &account.subaccount_id,
            &bracket.symbol,
            bracket.side,
            bracket.quantity,
            entry_price,
        );
        self.record(SimPlacement {
            subaccount: account.subaccount_id.clone(),
            symbol: bracket.symbol.clone(),
            side: bracket.side,
            quantity: bracket.quantity,
            order_type: BrokerOrderType::Market,
            price: None,
            client_order_id: bracket.client_order_id.clone(),
        });

        let exit_side = bracket.side.opposite();
        let direction = match bracket.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        let mut tp_order_ids = Vec::new();
        for leg in &bracket.legs {
            let id = self.next_id();
            self.push_working(
                &account.subaccount_id,
                &bracket.symbol,
                BrokerOrder {
                    order_id: id.clone(),
                    client_order_id: Some(bracket.client_order_id.clone()),
                    symbol: bracket.symbol.clone(),
                    side: exit_side,
                    quantity: leg.quantity,
                    order_type: BrokerOrderType::Limit,
                    limit_price: Some(entry_price + leg.distance_points * direction),
                    stop_price: None,
                    status: BrokerOrderStatus::Working,
                    placed_at: Some(chrono::Utc::now()),
                },
            );
            tp_order_ids.push(id);
        }

        let sl_order_id = bracket.stop.as_ref().map(|stop| {
            let id = self.next_id();
            self.push_working(
                &account.subaccount_id,
                &bracket.symbol,
                BrokerOrder {
                    order_id: id.clone(),
                    client_order_id: Some(bracket.client_order_id.clone()),
                    symbol: bracket.symbol.clone(),
                    side: exit_side,
                    quantity: bracket.quantity,
                    order_type: match stop {
                        jt_standard_lib::standardized_types::orders::StopSpec::Fixed { .. } => {
                            BrokerOrderType::Stop
                        }
                        _ => BrokerOrderType::TrailingStop,
                    },
                    limit_price: None,
                    stop_price: Some(entry_price - stop.distance_points() * direction),
                    status: BrokerOrderStatus::Working,
                    placed_at: Some(chrono::Utc::now()),
                },
            );
            id
        });

        Ok(BracketIds {
            strategy_id: self.next_id(),
            entry_order_id: Some(self.next_id()),
            tp_order_ids,
            sl_order_id,
        })
    }

    async fn place_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        self.take_injected_failure()?;
        let id = self.next_id();
        self.push_working(
            &account.subaccount_id,
            symbol,
            BrokerOrder {
                order_id: id.clone(),
                client_order_id: Some(client_order_id.to_string()),
                symbol: symbol.clone(),
                side,
                quantity,
                order_type: BrokerOrderType::Limit,
                limit_price: Some(limit_price),
                stop_price: None,
                status: BrokerOrderStatus::Working,
                placed_at: Some(chrono::Utc::now()),
            },
        );
        self.record(SimPlacement {
            subaccount: account.subaccount_id.clone(),
            symbol: symbol.clone(),
            side,
            quantity,
            order_type: BrokerOrderType::Limit,
            price: Some(limit_price),
            client_order_id: client_order_id.to_string(),
        });
        Ok(id)
    }

    async fn place_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        self.take_injected_failure()?;
        let id = self.next_id();
        self.push_working(
            &account.subaccount_id,
            symbol,
            BrokerOrder {
                order_id: id.clone(),
                client_order_id: Some(client_order_id.to_string()),
                symbol: symbol.clone(),
                side,
                quantity,
                order_type: BrokerOrderType::Stop,
                limit_price: None,
                stop_price: Some(trigger_price),
                status: BrokerOrderStatus::Working,
                placed_at: Some(chrono::Utc::now()),
            },
        );
        self.record(SimPlacement {
            subaccount: account.subaccount_id.clone(),
            symbol: symbol.clone(),
            side,
            quantity,
            order_type: BrokerOrderType::Stop,
            price: Some(trigger_price),
            client_order_id: client_order_id.to_string(),
        });
        Ok(id)
    }

    async fn place_stop_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        _limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        self.place_stop(account, symbol, side, quantity, trigger_price, client_order_id)
            .await
    }

    async fn place_trailing_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trail_points: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        self.take_injected_failure()?;
        let id = self.next_id();
        let mark = self.mark_for(symbol);
        let trigger = match side {
            OrderSide::Sell => mark - trail_points,
            OrderSide::Buy => mark + trail_points,
        };
        self.push_working(
            &account.subaccount_id,
            symbol,
            BrokerOrder {
                order_id: id.clone(),
                client_order_id: Some(client_order_id.to_string()),
                symbol: symbol.clone(),
                side,
                quantity,
                order_type: BrokerOrderType::TrailingStop,
                limit_price: None,
                stop_price: Some(trigger),
                status: BrokerOrderStatus::Working,
                placed_at: Some(chrono::Utc::now()),
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, account: &Account, order_id: &OrderId) -> Result<(), JtError> {
        self.take_injected_failure()?;
        for mut entry in self.working.iter_mut() {
            if entry.key().0 == account.subaccount_id {
                entry.value_mut().retain(|o| &o.order_id != order_id);
            }
        }
        Ok(())
    }

    async fn modify_order(
        &self,
        _account: &Account,
        _order_id: &OrderId,
        _update: OrderUpdate,
    ) -> Result<(), JtError> {
        // Deliberately acknowledges without applying, mirroring the broker
        // behavior that makes cancel-and-replace the only safe pattern.
        Ok(())
    }

    async fn list_positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, JtError> {
        self.take_injected_failure()?;
        Ok(self
            .positions
            .iter()
            .filter(|entry| entry.key().0 == account.subaccount_id)
            .map(|entry| BrokerPosition {
                symbol: entry.key().1.clone(),
                quantity: entry.value().quantity,
                average_price: weighted_average_price(&entry.value().entries),
            })
            .collect())
    }

    async fn list_open_orders(&self, account: &Account) -> Result<Vec<BrokerOrder>, JtError> {
        self.take_injected_failure()?;
        Ok(self
            .working
            .iter()
            .filter(|entry| entry.key().0 == account.subaccount_id)
            .flat_map(|entry| entry.value().clone())
            .collect())
    }

    async fn flatten(&self, account: &Account, symbol: &SymbolName) -> Result<(), JtError> {
        self.take_injected_failure()?;
        let key = (account.subaccount_id.clone(), symbol.clone());
        self.working.remove(&key);
        if let Some((_, position)) = self.positions.remove(&key) {
            let side = if position.quantity.is_sign_positive() {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            self.record(SimPlacement {
                subaccount: account.subaccount_id.clone(),
                symbol: symbol.clone(),
                side,
                quantity: position.quantity.abs(),
                order_type: BrokerOrderType::Market,
                price: None,
                client_order_id: "JT_MAN_flatten".to_string(),
            });
        }
        Ok(())
    }
}
