use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::Display;

use crate::errors::JtError;

#[derive(
    Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Debug, Hash, PartialOrd, Ord, Display,
)]
pub enum Brokerage {
    /// In-process simulated brokerage, test suites only. Never wired in
    /// production startup, so simulated fills cannot reach production rows.
    Sim,
    /// Futures REST broker, OAuth with short lived access tokens (60-90 min).
    Tradovate,
    /// Prop-firm broker, long lived API key, SignalR style streaming.
    ProjectX,
    /// Equity and options broker, HMAC signed REST, no push surface.
    Tradier,
}

impl Brokerage {
    /// Brokers without a push surface rely on the reconciler sweep for
    /// bracket fill detection.
    pub fn has_streaming(&self) -> bool {
        match self {
            Brokerage::Tradovate | Brokerage::ProjectX => true,
            Brokerage::Tradier | Brokerage::Sim => false,
        }
    }
}

impl FromStr for Brokerage {
    type Err = JtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sim" => Ok(Brokerage::Sim),
            "Tradovate" => Ok(Brokerage::Tradovate),
            "ProjectX" => Ok(Brokerage::ProjectX),
            "Tradier" => Ok(Brokerage::Tradier),
            other => Err(JtError::BadRequest(format!(
                "Invalid brokerage string: {}",
                other
            ))),
        }
    }
}
