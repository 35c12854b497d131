use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::standardized_types::enums::OrderSide;
use jt_standard_lib::standardized_types::orders::BrokerOrderStatus;
use jt_standard_lib::standardized_types::stream_events::StreamEvent;

use super::SessionClock;

const LIVE_WS_URL: &str = "wss://live.tradovateapi.com/v1/websocket";
const DEMO_WS_URL: &str = "wss://demo.tradovateapi.com/v1/websocket";

pub fn ws_url(live: bool) -> &'static str {
    if live {
        LIVE_WS_URL
    } else {
        DEMO_WS_URL
    }
}

/// SockJS-style frames: `o` open, `h` heartbeat, `c[...]` close,
/// `a[...]` data array. Anything else is opaque.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Open,
    Heartbeat,
    Close,
    Data(Vec<Value>),
    Opaque(String),
}

pub fn parse_frame(text: &str) -> Frame {
    match text.chars().next() {
        Some('o') => Frame::Open,
        Some('h') => Frame::Heartbeat,
        Some('c') => Frame::Close,
        Some('a') => match serde_json::from_str::<Vec<Value>>(&text[1..]) {
            Ok(items) => Frame::Data(items),
            Err(_) => Frame::Opaque(text.to_string()),
        },
        _ => Frame::Opaque(text.to_string()),
    }
}

fn decimal(value: &Value, key: &str) -> Decimal {
    value
        .get(key)
        .and_then(|v| v.as_f64())
        .and_then(Decimal::from_f64_retain)
        .unwrap_or_default()
}

fn string(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn timestamp(value: &Value, key: &str) -> DateTime<Utc> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now)
}

/// One entity-update message into a typed event. Unknown entity types are
/// preserved opaquely for audit, never matched on.
pub fn map_entity(item: &Value) -> Option<StreamEvent> {
    let entity_type = item
        .get("d")
        .and_then(|d| d.get("entityType"))
        .and_then(|v| v.as_str())?;
    let entity = item.get("d").and_then(|d| d.get("entity"))?;

    let event = match entity_type {
        "fill" => StreamEvent::Fill {
            account: string(entity, "accountId"),
            symbol: string(entity, "contractId"),
            side: if string(entity, "action") == "Sell" {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            quantity: decimal(entity, "qty"),
            price: decimal(entity, "price"),
            order_id: string(entity, "orderId"),
            client_order_id: entity
                .get("clOrdId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            fill_id: string(entity, "id"),
            time: timestamp(entity, "timestamp"),
        },
        "position" => StreamEvent::PositionUpdate {
            account: string(entity, "accountId"),
            symbol: string(entity, "contractId"),
            quantity: decimal(entity, "netPos"),
            average_price: decimal(entity, "netPrice"),
            time: timestamp(entity, "timestamp"),
        },
        "order" => StreamEvent::OrderUpdate {
            account: string(entity, "accountId"),
            symbol: string(entity, "contractId"),
            order_id: string(entity, "id"),
            client_order_id: entity
                .get("clOrdId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            status: match entity.get("ordStatus").and_then(|v| v.as_str()) {
                Some("Filled") => BrokerOrderStatus::Filled,
                Some("Canceled") => BrokerOrderStatus::Cancelled,
                Some("Rejected") => BrokerOrderStatus::Rejected,
                Some("PartiallyFilled") => BrokerOrderStatus::PartiallyFilled,
                _ => BrokerOrderStatus::Working,
            },
            time: timestamp(entity, "timestamp"),
        },
        "cashBalance" => StreamEvent::Balance {
            account: string(entity, "accountId"),
            cash_value: decimal(entity, "amount"),
            realized_pnl_day: decimal(entity, "realizedPnL"),
            time: timestamp(entity, "timestamp"),
        },
        _ => StreamEvent::Unknown { raw: item.clone() },
    };
    Some(event)
}

/// Drive one socket lifetime: open frame, authorize, exactly one
/// subscription covering the union of interested accounts, then heartbeat
/// and read until the peer dies or the hub aborts us. Returns when the
/// connection is over; the hub owns backoff and reconnect.
pub async fn run(
    live: bool,
    token: &str,
    accounts: &[String],
    heartbeat_every: Duration,
    clock: Arc<SessionClock>,
    dispatch: Arc<dyn Fn(StreamEvent) + Send + Sync>,
) -> Result<(), JtError> {
    let (mut socket, _) = connect_async(ws_url(live))
        .await
        .map_err(|e| JtError::BrokerUnreachable(format!("ws connect: {}", e)))?;

    let mut authorized = false;
    let mut subscribed = false;
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                // The protocol's keepalive is a bare empty array.
                if socket.send(Message::Text("[]".to_string())).await.is_err() {
                    return Err(JtError::BrokerUnreachable("heartbeat send failed".to_string()));
                }
            }
            message = socket.next() => {
                let message = match message {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(JtError::BrokerUnreachable(format!("ws read: {}", e))),
                    None => return Ok(()),
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Ping(payload) => {
                        socket.send(Message::Pong(payload)).await.ok();
                        clock.touch_message();
                        continue;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => continue,
                };
                clock.touch_message();

                match parse_frame(&text) {
                    Frame::Open => {
                        if !authorized {
                            let auth = format!("authorize\n1\n\n{}", token);
                            socket
                                .send(Message::Text(auth))
                                .await
                                .map_err(|e| JtError::BrokerUnreachable(format!("auth send: {}", e)))?;
                        }
                    }
                    Frame::Heartbeat => {}
                    Frame::Close => return Ok(()),
                    Frame::Data(items) => {
                        for item in items {
                            // The authorize ack: {"s":200,"i":1}.
                            if !authorized
                                && item.get("i").and_then(|v| v.as_i64()) == Some(1)
                            {
                                let status = item.get("s").and_then(|v| v.as_i64()).unwrap_or(0);
                                if status != 200 {
                                    return Err(JtError::AuthExpired(format!(
                                        "stream auth rejected with status {}",
                                        status
                                    )));
                                }
                                authorized = true;
                                if !subscribed {
                                    // Conformance: one subscription per
                                    // socket lifetime, covering every
                                    // interested account at once.
                                    let body = serde_json::json!({ "users": accounts });
                                    let frame = format!("user/syncrequest\n2\n\n{}", body);
                                    socket.send(Message::Text(frame)).await.map_err(|e| {
                                        JtError::BrokerUnreachable(format!("subscribe send: {}", e))
                                    })?;
                                    subscribed = true;
                                }
                                continue;
                            }

                            match map_entity(&item) {
                                Some(event) => {
                                    if event.is_data() {
                                        clock.touch_data();
                                    }
                                    dispatch(event);
                                }
                                None => debug!("frame without entity payload"),
                            }
                        }
                    }
                    Frame::Opaque(text) => {
                        warn!(frame = %text.chars().take(80).collect::<String>(), "opaque stream frame");
                        dispatch(StreamEvent::Unknown { raw: Value::String(text) });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn frames_classify_by_leading_byte() {
        assert_eq!(parse_frame("o"), Frame::Open);
        assert_eq!(parse_frame("h"), Frame::Heartbeat);
        assert_eq!(parse_frame("c[1000,\"bye\"]"), Frame::Close);
        assert!(matches!(parse_frame("a[{\"s\":200,\"i\":1}]"), Frame::Data(_)));
        assert!(matches!(parse_frame("?junk"), Frame::Opaque(_)));
    }

    #[test]
    fn fill_entities_map_to_typed_events() {
        let item: Value = serde_json::from_str(
            r#"{"e":"props","d":{"entityType":"fill","entity":{
                "id":991,"orderId":456,"accountId":789,"contractId":101,
                "timestamp":"2026-03-02T14:30:00Z","action":"Buy","qty":2.0,
                "price":21500.25,"clOrdId":"JT_SIG_abc"}}}"#,
        )
        .unwrap();
        let event = map_entity(&item).unwrap();
        match event {
            StreamEvent::Fill { account, quantity, price, client_order_id, side, .. } => {
                assert_eq!(account, "789");
                assert_eq!(quantity, dec!(2));
                assert_eq!(price, dec!(21500.25));
                assert_eq!(client_order_id.as_deref(), Some("JT_SIG_abc"));
                assert_eq!(side, OrderSide::Buy);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn position_and_balance_entities_map() {
        let position: Value = serde_json::from_str(
            r#"{"d":{"entityType":"position","entity":{
                "accountId":789,"contractId":101,"netPos":-3.0,"netPrice":21490.5,
                "timestamp":"2026-03-02T14:31:00Z"}}}"#,
        )
        .unwrap();
        match map_entity(&position).unwrap() {
            StreamEvent::PositionUpdate { quantity, average_price, .. } => {
                assert_eq!(quantity, dec!(-3));
                assert_eq!(average_price, dec!(21490.5));
            }
            other => panic!("wrong event: {:?}", other),
        }

        let balance: Value = serde_json::from_str(
            r#"{"d":{"entityType":"cashBalance","entity":{
                "accountId":789,"amount":52000.0,"realizedPnL":-150.0}}}"#,
        )
        .unwrap();
        match map_entity(&balance).unwrap() {
            StreamEvent::Balance { cash_value, realized_pnl_day, .. } => {
                assert_eq!(cash_value, dec!(52000));
                assert_eq!(realized_pnl_day, dec!(-150));
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn unknown_entities_stay_opaque() {
        let item: Value = serde_json::from_str(
            r#"{"d":{"entityType":"marginSnapshot","entity":{"accountId":789}}}"#,
        )
        .unwrap();
        assert!(matches!(map_entity(&item).unwrap(), StreamEvent::Unknown { .. }));
    }
}
