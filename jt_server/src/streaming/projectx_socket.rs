use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::standardized_types::enums::OrderSide;
use jt_standard_lib::standardized_types::orders::BrokerOrderStatus;
use jt_standard_lib::standardized_types::stream_events::StreamEvent;

use super::SessionClock;

const LIVE_HUB_URL: &str = "wss://gateway-rtc.projectx.com/hubs/user";
const DEMO_HUB_URL: &str = "wss://gateway-rtc-demo.projectx.com/hubs/user";

/// SignalR's record separator; every frame on the wire ends with one.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub fn hub_url(live: bool, token: &str) -> String {
    let base = if live { LIVE_HUB_URL } else { DEMO_HUB_URL };
    format!("{}?access_token={}", base, urlencoding::encode(token))
}

/// Split a wire payload into its JSON records.
pub fn split_records(payload: &str) -> Vec<&str> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|r| !r.is_empty())
        .collect()
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

fn gateway_side(value: &Value) -> OrderSide {
    // 0 = bid/buy, 1 = ask/sell.
    if value.get("side").and_then(|v| v.as_i64()) == Some(1) {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

/// One SignalR invocation record into typed events. Only `type: 1`
/// invocations carry data; pings and acks are liveness only.
pub fn map_record(record: &str) -> Vec<StreamEvent> {
    let message: Value = match serde_json::from_str(record) {
        Ok(v) => v,
        Err(_) => return vec![StreamEvent::Unknown { raw: Value::String(record.to_string()) }],
    };

    if message.get("type").and_then(|v| v.as_i64()) != Some(1) {
        return Vec::new();
    }
    let target = message.get("target").and_then(|v| v.as_str()).unwrap_or_default();
    let arguments = match message.get("arguments").and_then(|v| v.as_array()) {
        Some(args) => args,
        None => return Vec::new(),
    };

    arguments
        .iter()
        .map(|data| match target {
            "GatewayUserTrade" => StreamEvent::Fill {
                account: string(data, "accountId"),
                symbol: string(data, "contractId"),
                side: gateway_side(data),
                quantity: decimal(data, "size"),
                price: decimal(data, "price"),
                order_id: string(data, "orderId"),
                client_order_id: data
                    .get("customTag")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                fill_id: string(data, "id"),
                time: timestamp(data, "creationTimestamp"),
            },
            "GatewayUserPosition" => StreamEvent::PositionUpdate {
                account: string(data, "accountId"),
                symbol: string(data, "contractId"),
                quantity: if data.get("type").and_then(|v| v.as_i64()) == Some(2) {
                    -decimal(data, "size")
                } else {
                    decimal(data, "size")
                },
                average_price: decimal(data, "averagePrice"),
                time: timestamp(data, "creationTimestamp"),
            },
            "GatewayUserOrder" => StreamEvent::OrderUpdate {
                account: string(data, "accountId"),
                symbol: string(data, "contractId"),
                order_id: string(data, "id"),
                client_order_id: data
                    .get("customTag")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                status: match data.get("status").and_then(|v| v.as_i64()) {
                    Some(2) => BrokerOrderStatus::Filled,
                    Some(3) => BrokerOrderStatus::Cancelled,
                    Some(5) => BrokerOrderStatus::Rejected,
                    _ => BrokerOrderStatus::Working,
                },
                time: timestamp(data, "updateTimestamp"),
            },
            "GatewayUserAccount" => StreamEvent::Balance {
                account: string(data, "id"),
                cash_value: decimal(data, "balance"),
                realized_pnl_day: decimal(data, "realizedDayPnl"),
                time: Utc::now(),
            },
            _ => StreamEvent::Unknown { raw: data.clone() },
        })
        .collect()
}

/// Drive one SignalR socket lifetime: handshake, one subscription
/// invocation for the whole account union, then ping and read until the
/// peer dies or the hub aborts us.
pub async fn run(
    live: bool,
    token: &str,
    accounts: &[String],
    heartbeat_every: Duration,
    clock: Arc<SessionClock>,
    dispatch: Arc<dyn Fn(StreamEvent) + Send + Sync>,
) -> Result<(), JtError> {
    let (mut socket, _) = connect_async(hub_url(live, token))
        .await
        .map_err(|e| JtError::BrokerUnreachable(format!("signalr connect: {}", e)))?;

    // Handshake, then the single subscription for this socket lifetime.
    let handshake = format!("{{\"protocol\":\"json\",\"version\":1}}{}", RECORD_SEPARATOR);
    socket
        .send(Message::Text(handshake))
        .await
        .map_err(|e| JtError::BrokerUnreachable(format!("handshake send: {}", e)))?;

    let subscribe = serde_json::json!({
        "type": 1,
        "target": "Subscribe",
        "arguments": [accounts],
    });
    socket
        .send(Message::Text(format!("{}{}", subscribe, RECORD_SEPARATOR)))
        .await
        .map_err(|e| JtError::BrokerUnreachable(format!("subscribe send: {}", e)))?;

    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ping = format!("{{\"type\":6}}{}", RECORD_SEPARATOR);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if socket.send(Message::Text(ping.clone())).await.is_err() {
                    return Err(JtError::BrokerUnreachable("ping send failed".to_string()));
                }
            }
            message = socket.next() => {
                let message = match message {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(JtError::BrokerUnreachable(format!("signalr read: {}", e))),
                    None => return Ok(()),
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Ping(payload) => {
                        socket.send(Message::Pong(payload)).await.ok();
                        clock.touch_message();
                        continue;
                    }
                    Message::Close(frame) => {
                        warn!(?frame, "signalr peer closed");
                        return Ok(());
                    }
                    _ => continue,
                };
                clock.touch_message();

                for record in split_records(&text) {
                    for event in map_record(record) {
                        if event.is_data() {
                            clock.touch_data();
                        }
                        dispatch(event);
                    }
                }
            }
        }
    }
}
