use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::standardized_types::broker_enum::Brokerage;
use crate::standardized_types::enums::Environment;
use crate::TokenKey;

pub type AccountId = i64;
pub type UserId = i64;

/// Broker specific credential blob, stored as tagged JSON in the accounts
/// table. Multiple accounts may carry identical credentials; the streaming
/// hub coalesces them onto one session via `credential_key`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerCredentials {
    /// OAuth token set with password-grant fallback (Tradovate).
    OAuthToken {
        username: String,
        password: String,
        access_token: String,
        /// Local expiry, stored strictly shorter than the broker's real
        /// expiry (85 min against a 90 min grant).
        expires_at: DateTime<Utc>,
    },
    /// Long lived API key (ProjectX).
    ApiKey { username: String, key: String },
    /// Key + secret pair used to HMAC-sign requests (Tradier).
    HmacKey { key: String, secret: String },
    /// The simulated brokerage needs nothing.
    None,
}

impl BrokerCredentials {
    /// Whether this credential set carries a short lived token the keeper
    /// must proactively refresh.
    pub fn is_short_lived(&self) -> bool {
        matches!(self, BrokerCredentials::OAuthToken { .. })
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            BrokerCredentials::OAuthToken { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    /// Stable identity of the credential itself, independent of the tokens
    /// it currently holds. Never exposes secret material.
    fn identity(&self) -> String {
        match self {
            BrokerCredentials::OAuthToken { username, .. } => format!("oauth:{}", username),
            BrokerCredentials::ApiKey { username, .. } => format!("apikey:{}", username),
            BrokerCredentials::HmacKey { key, .. } => format!("hmac:{}", key),
            BrokerCredentials::None => "none".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub brokerage: Brokerage,
    pub environment: Environment,
    pub credentials: BrokerCredentials,
    /// The broker side account identifier orders are routed to.
    pub subaccount_id: String,
    pub enabled: bool,
    pub needs_reauth: bool,
}

impl Account {
    /// One streaming session exists per credential key, not per account.
    pub fn credential_key(&self) -> TokenKey {
        let mut hasher = Sha256::new();
        hasher.update(self.credentials.identity().as_bytes());
        let digest = hasher.finalize();
        format!(
            "{}:{}:{}",
            self.brokerage,
            self.environment,
            hex::encode(&digest[..8])
        )
    }

    /// An account leaves the auto-trading pool when disabled or waiting on
    /// re-authentication.
    pub fn is_tradable(&self) -> bool {
        self.enabled && !self.needs_reauth
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccountAuthStatus {
    pub account_id: AccountId,
    pub brokerage: Brokerage,
    pub subaccount_id: String,
    pub needs_reauth: bool,
    pub reauth_reason: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(credentials: BrokerCredentials) -> Account {
        Account {
            id: 1,
            user_id: 1,
            brokerage: Brokerage::Tradovate,
            environment: Environment::Demo,
            credentials,
            subaccount_id: "DEMO123".to_string(),
            enabled: true,
            needs_reauth: false,
        }
    }

    #[test]
    fn shared_credentials_share_a_token_key() {
        let a = account(BrokerCredentials::OAuthToken {
            username: "kaito".to_string(),
            password: "pw".to_string(),
            access_token: "tok-a".to_string(),
            expires_at: Utc::now(),
        });
        let mut b = account(BrokerCredentials::OAuthToken {
            username: "kaito".to_string(),
            password: "pw".to_string(),
            access_token: "tok-b-rotated".to_string(),
            expires_at: Utc::now(),
        });
        b.subaccount_id = "DEMO456".to_string();
        // Token rotation must not split the session.
        assert_eq!(a.credential_key(), b.credential_key());
    }

    #[test]
    fn different_users_get_distinct_token_keys() {
        let a = account(BrokerCredentials::ApiKey {
            username: "kaito".to_string(),
            key: "k1".to_string(),
        });
        let b = account(BrokerCredentials::ApiKey {
            username: "mori".to_string(),
            key: "k1".to_string(),
        });
        assert_ne!(a.credential_key(), b.credential_key());
    }
}
