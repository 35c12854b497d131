use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::standardized_types::enums::SignalAction;
use crate::standardized_types::strategies::StrategyId;
use crate::standardized_types::{Price, SymbolName, Volume};

pub type SignalId = i64;

/// The raw payload received at a webhook, persisted before any processing
/// and retained for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub strategy_id: StrategyId,
    pub raw_body: String,
    pub dedup_key: String,
    pub accepted: bool,
    pub received_at: DateTime<Utc>,
}

/// The fields the router understands once a body parses. Unknown keys are
/// ignored; missing optional keys stay `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub action: SignalAction,
    pub ticker: Option<SymbolName>,
    pub price: Option<Price>,
    pub contracts: Option<Volume>,
    pub position: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    action: String,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    price: Option<Price>,
    #[serde(default)]
    contracts: Option<Volume>,
    #[serde(default)]
    position: Option<String>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

/// Tolerant body parsing: JSON first, then a plain-text heuristic. Returns
/// `None` for bodies we cannot make sense of; callers persist those raw and
/// drop them.
pub fn parse_signal_body(body: &str) -> Option<ParsedSignal> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(payload) = serde_json::from_str::<WirePayload>(trimmed) {
        let action = SignalAction::from_str(payload.action.trim()).ok()?;
        return Some(ParsedSignal {
            action,
            ticker: payload.ticker,
            price: payload.price,
            contracts: payload.contracts,
            position: payload.position,
            time: payload.time,
        });
    }

    parse_plain_text(trimmed)
}

/// Plain text bodies look like "buy MNQH6 21500.25" or just "closelong".
/// The first token must be an action word; a later token that parses as a
/// number is taken as the price, the first that does not as the ticker.
fn parse_plain_text(body: &str) -> Option<ParsedSignal> {
    let mut tokens = body.split_whitespace();
    let action = SignalAction::from_str(tokens.next()?).ok()?;

    let mut ticker = None;
    let mut price = None;
    for token in tokens {
        if price.is_none() {
            if let Ok(value) = token.parse::<Price>() {
                price = Some(value);
                continue;
            }
        }
        if ticker.is_none() {
            ticker = Some(token.to_string());
        }
    }

    Some(ParsedSignal {
        action,
        ticker,
        price,
        contracts: None,
        position: None,
        time: None,
    })
}

/// Deduplication key over (strategy, action, signal-supplied time). Two
/// identical signals hash identically; the router drops the second only
/// when the first was seen inside the dedup window.
pub fn dedup_key(strategy_id: StrategyId, action: SignalAction, timenow: Option<DateTime<Utc>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy_id.to_le_bytes());
    hasher.update(action.to_string().as_bytes());
    hasher.update(timenow.map(|t| t.timestamp()).unwrap_or(0).to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_json_payload_ignoring_unknown_fields() {
        let body = r#"{"action":"buy","ticker":"MNQH6","price":21500.00,"interval":"5m","comment":"long"}"#;
        let parsed = parse_signal_body(body).unwrap();
        assert_eq!(parsed.action, SignalAction::Buy);
        assert_eq!(parsed.ticker.as_deref(), Some("MNQH6"));
        assert_eq!(parsed.price, Some(dec!(21500.00)));
        assert_eq!(parsed.contracts, None);
    }

    #[test]
    fn parses_plain_text_heuristically() {
        let parsed = parse_signal_body("sell MNQH6 21480.25").unwrap();
        assert_eq!(parsed.action, SignalAction::Sell);
        assert_eq!(parsed.ticker.as_deref(), Some("MNQH6"));
        assert_eq!(parsed.price, Some(dec!(21480.25)));

        let bare = parse_signal_body("CLOSELONG").unwrap();
        assert_eq!(bare.action, SignalAction::CloseLong);
        assert_eq!(bare.ticker, None);
    }

    #[test]
    fn unparseable_bodies_return_none() {
        assert!(parse_signal_body("").is_none());
        assert!(parse_signal_body("hello world").is_none());
        assert!(parse_signal_body(r#"{"foo": 1}"#).is_none());
        assert!(parse_signal_body(r#"{"action":"hold"}"#).is_none());
    }

    #[test]
    fn dedup_key_is_stable_for_identical_signals() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();

        let k0 = dedup_key(1, SignalAction::Buy, Some(t0));
        assert_eq!(k0, dedup_key(1, SignalAction::Buy, Some(t0)));
        assert_ne!(k0, dedup_key(1, SignalAction::Buy, Some(t0 + chrono::Duration::seconds(1))));
        assert_ne!(k0, dedup_key(1, SignalAction::Sell, Some(t0)));
        assert_ne!(k0, dedup_key(2, SignalAction::Buy, Some(t0)));
        assert_eq!(dedup_key(1, SignalAction::Buy, None), dedup_key(1, SignalAction::Buy, None));
    }
}
