use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::settings::ServerSettings;
use jt_standard_lib::standardized_types::accounts::{Account, AccountId, BrokerCredentials};
use jt_standard_lib::store::Store;

use crate::brokers::BrokerRegistry;

/// Owns every short lived broker token. Other components ask for a token
/// on demand and never cache one across task boundaries; tokens rotate
/// underneath them.
pub struct CredentialKeeper {
    store: Store,
    brokers: Arc<BrokerRegistry>,
    /// Refresh when expiry is closer than this.
    early_margin: ChronoDuration,
    sweep_interval: Duration,
}

impl CredentialKeeper {
    pub fn new(store: Store, brokers: Arc<BrokerRegistry>, settings: &ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            brokers,
            early_margin: ChronoDuration::seconds(settings.token_refresh_early_margin_secs),
            sweep_interval: Duration::from_secs(settings.token_sweep_interval_secs),
        })
    }

    /// Background sweep: every interval, proactively refresh any token that
    /// expires inside the early margin.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let keeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = interval(keeper.sweep_interval);
            loop {
                timer.tick().await;
                if let Err(e) = keeper.sweep().await {
                    error!(error = %e, "credential sweep failed");
                }
            }
        })
    }

    async fn sweep(&self) -> Result<(), JtError> {
        let accounts = self.store.list_enabled_accounts().await?;
        for account in accounts {
            if account.needs_reauth || !account.credentials.is_short_lived() {
                continue;
            }
            let expiring = match account.credentials.token_expires_at() {
                Some(at) => at - Utc::now() < self.early_margin,
                None => true,
            };
            if !expiring {
                continue;
            }
            if let Err(e) = self.refresh_account(&account).await {
                warn!(account_id = account.id, error = %e, "proactive refresh failed");
            }
        }
        Ok(())
    }

    /// Refresh one account's token: proactive renewal first, password-grant
    /// re-login second. A second failure marks the account `needs_reauth`
    /// and takes it out of the auto-trading pool; nothing retries after
    /// that until a human intervenes.
    pub async fn refresh_account(&self, account: &Account) -> Result<Account, JtError> {
        let adapter = self.brokers.client_for(account.brokerage)?;

        match adapter.refresh_credentials(account).await {
            Ok(Some(credentials)) => {
                self.store
                    .update_account_credentials(account.id, credentials.clone())
                    .await?;
                info!(account_id = account.id, "token refreshed");
                let mut updated = account.clone();
                updated.credentials = credentials;
                updated.needs_reauth = false;
                return Ok(updated);
            }
            Ok(None) => return Ok(account.clone()),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "renewal failed, trying password grant");
            }
        }

        match adapter.relogin(account).await {
            Ok(Some(credentials)) => {
                self.store
                    .update_account_credentials(account.id, credentials.clone())
                    .await?;
                info!(account_id = account.id, "re-login succeeded");
                let mut updated = account.clone();
                updated.credentials = credentials;
                updated.needs_reauth = false;
                Ok(updated)
            }
            Ok(None) => Ok(account.clone()),
            Err(e) => {
                self.store
                    .mark_account_needs_reauth(
                        account.id,
                        &format!("refresh and re-login both failed: {}", e),
                    )
                    .await?;
                Err(JtError::AuthExpired(format!(
                    "account {} needs re-authentication",
                    account.id
                )))
            }
        }
    }

    /// Current usable token material for an account, refreshing first when
    /// the stored expiry sits inside the early margin.
    pub async fn token_for(&self, account_id: AccountId) -> Result<String, JtError> {
        let account = self.store.get_account(account_id).await?;
        if account.needs_reauth {
            return Err(JtError::AuthExpired(format!(
                "account {} needs re-authentication",
                account_id
            )));
        }

        let account = match &account.credentials {
            BrokerCredentials::OAuthToken { expires_at, .. }
                if *expires_at - Utc::now() < self.early_margin =>
            {
                self.refresh_account(&account).await?
            }
            _ => account,
        };

        match &account.credentials {
            BrokerCredentials::OAuthToken { access_token, .. } => Ok(access_token.clone()),
            BrokerCredentials::ApiKey { key, .. } => Ok(key.clone()),
            BrokerCredentials::HmacKey { key, .. } => Ok(key.clone()),
            BrokerCredentials::None => Ok(String::new()),
        }
    }

    /// Drop a token ahead of its stored expiry, forcing the next
    /// `token_for` through a refresh.
    pub async fn invalidate(&self, account_id: AccountId) -> Result<(), JtError> {
        let account = self.store.get_account(account_id).await?;
        if let BrokerCredentials::OAuthToken { username, password, access_token, .. } =
            account.credentials
        {
            self.store
                .update_account_credentials(
                    account_id,
                    BrokerCredentials::OAuthToken {
                        username,
                        password,
                        access_token,
                        expires_at: Utc::now(),
                    },
                )
                .await?;
        }
        Ok(())
    }
}
