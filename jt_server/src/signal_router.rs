use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::settings::ServerSettings;
use jt_standard_lib::standardized_types::orders::OrderOrigin;
use jt_standard_lib::standardized_types::signals::{dedup_key, parse_signal_body, ParsedSignal, SignalId};
use jt_standard_lib::standardized_types::strategies::{Strategy, Trader, TraderId};
use jt_standard_lib::store::Store;

use crate::execution::ExecutionTask;

/// A parsed, persisted signal waiting for the ingest pool. Acceptance (the
/// webhook 2xx) happened already; everything after this point is
/// best-effort and recorded, never surfaced to the charting service.
#[derive(Clone, Debug)]
pub struct IngestJob {
    pub strategy: Strategy,
    pub signal_id: SignalId,
    pub parsed: ParsedSignal,
    pub received_at: DateTime<Utc>,
}

/// Outcome of the synchronous webhook path, mapped to HTTP by the API
/// layer. Transient conditions never map to 4xx.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// Persisted and handed to the ingest pool.
    Accepted(IngestJob),
    /// Persisted; body made no sense; dropped for audit only.
    Unparseable,
    UnknownToken,
    /// Strategy is permanently disabled.
    Gone,
}

pub struct SignalRouter {
    store: Store,
    dedup_window: ChronoDuration,
    /// Per-trader entry counter backing the every-Nth-signal delay.
    delay_counters: DashMap<TraderId, u64>,
}

impl SignalRouter {
    pub fn new(store: Store, settings: &ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            dedup_window: ChronoDuration::seconds(settings.webhook_dedup_window_secs),
            delay_counters: DashMap::new(),
        })
    }

    /// The synchronous webhook path: resolve the token, persist the raw
    /// body, parse. Fast enough to sit inside the response deadline; all
    /// broker work happens later on the pools.
    pub async fn accept(
        &self,
        token: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> Result<AcceptOutcome, JtError> {
        let strategy = match self.store.get_strategy_by_webhook_token(token).await? {
            Some(strategy) => strategy,
            None => {
                info!(token_prefix = token.get(..8).unwrap_or(token), "unknown webhook token");
                // Retained for audit even though nothing will execute.
                self.store
                    .record_signal(None, "unknown_token", body, "", received_at)
                    .await?;
                return Ok(AcceptOutcome::UnknownToken);
            }
        };
        if !strategy.enabled {
            return Ok(AcceptOutcome::Gone);
        }

        let parsed = parse_signal_body(body);
        let (action_label, key) = match &parsed {
            Some(p) => (
                p.action.to_string(),
                dedup_key(strategy.id, p.action, p.time),
            ),
            None => ("unparseable".to_string(), String::new()),
        };

        let signal_id = self
            .store
            .record_signal(Some(strategy.id), &action_label, body, &key, received_at)
            .await?;

        match parsed {
            Some(parsed) => Ok(AcceptOutcome::Accepted(IngestJob {
                strategy,
                signal_id,
                parsed,
                received_at,
            })),
            None => Ok(AcceptOutcome::Unparseable),
        }
    }

    /// The ingest-pool half: dedup, strategy filters, per-trader fan-out.
    /// Returns the execution tasks to enqueue; an empty list means the
    /// signal was filtered (already persisted for audit).
    pub async fn process(&self, job: IngestJob) -> Result<Vec<ExecutionTask>, JtError> {
        let strategy = &job.strategy;
        let action = job.parsed.action;
        let now = job.received_at;

        // Dedup: same (strategy, action, timenow) seen inside the window.
        let since = now - self.dedup_window;
        if self
            .store
            .recent_signal_with_key(&job.dedup_key(), since, job.signal_id)
            .await?
        {
            debug!(strategy_id = strategy.id, signal_id = job.signal_id, "duplicate signal dropped");
            return Ok(Vec::new());
        }

        // Strategy-level filters, in order, first negative match drops.
        if !strategy.enabled {
            return Ok(Vec::new());
        }
        if !strategy.direction.allows(action) {
            debug!(strategy_id = strategy.id, "direction filter dropped signal");
            return Ok(Vec::new());
        }
        if !strategy.in_trading_window(now) {
            debug!(strategy_id = strategy.id, "outside trading windows");
            return Ok(Vec::new());
        }
        if strategy.max_signals_per_session > 0 {
            let session_start = self.session_start(strategy, now);
            let count = self
                .store
                .count_accepted_signals_since(strategy.id, session_start)
                .await?;
            if count >= strategy.max_signals_per_session {
                debug!(strategy_id = strategy.id, count, "session signal cap reached");
                return Ok(Vec::new());
            }
        }
        if strategy.signal_cooldown_secs > 0 {
            if let Some(last) = self.store.last_accepted_signal_at(strategy.id).await? {
                if (now - last).num_seconds() < strategy.signal_cooldown_secs {
                    debug!(strategy_id = strategy.id, "cooldown dropped signal");
                    return Ok(Vec::new());
                }
            }
        }

        self.store.mark_signal_accepted(job.signal_id).await?;

        let traders = self
            .store
            .list_traders_for_strategy(strategy.id, true)
            .await?;

        let mut tasks = Vec::with_capacity(traders.len());
        for trader in traders {
            if let Some(task) = self.task_for_trader(&job, trader, now).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn task_for_trader(
        &self,
        job: &IngestJob,
        trader: Trader,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionTask>, JtError> {
        let strategy = &job.strategy;
        let effective = trader.effective(strategy);

        // Pipeline separation: an account that follows a leader never also
        // fires on signals.
        if self.store.account_has_follower_role(trader.account_id).await? {
            debug!(trader_id = trader.id, "skipped: account has an active follower role");
            return Ok(None);
        }

        // Inverse applies before the per-trader direction check so a
        // long-only inverse trader keeps the direction it actually trades.
        let action = if effective.inverse {
            job.parsed.action.inverted()
        } else {
            job.parsed.action
        };
        if !effective.direction.allows(action) {
            return Ok(None);
        }

        if effective.signal_delay_is_set() && action.is_entry() {
            let mut counter = self.delay_counters.entry(trader.id).or_insert(0);
            *counter += 1;
            if *counter % (effective.signal_delay as u64) != 0 {
                debug!(trader_id = trader.id, count = *counter, "signal delay swallowed entry");
                return Ok(None);
            }
        }

        if effective.max_daily_loss_is_set() {
            let day_start = self.session_start(strategy, now);
            let pnl = self.store.realized_pnl_since(trader.id, day_start).await?;
            if pnl <= -effective.max_daily_loss {
                info!(
                    trader_id = trader.id,
                    pnl = %pnl,
                    "max daily loss breached, trader paused for the session"
                );
                return Ok(None);
            }
        }

        Ok(Some(ExecutionTask {
            strategy: strategy.clone(),
            effective,
            action,
            signal_id: Some(job.signal_id),
            signal_price: job.parsed.price,
            signal_contracts: job.parsed.contracts,
            origin: OrderOrigin::Signal,
            trader,
        }))
    }

    /// Session boundary: midnight in the strategy's exchange time zone.
    fn session_start(&self, strategy: &Strategy, now: DateTime<Utc>) -> DateTime<Utc> {
        let tz = strategy.tz();
        let local = now.with_timezone(&tz);
        let midnight = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists");
        match midnight.and_local_timezone(tz) {
            chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
            _ => now - ChronoDuration::hours(24),
        }
    }
}

impl IngestJob {
    fn dedup_key(&self) -> String {
        dedup_key(self.strategy.id, self.parsed.action, self.parsed.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt_standard_lib::standardized_types::accounts::{Account, BrokerCredentials};
    use jt_standard_lib::standardized_types::broker_enum::Brokerage;
    use jt_standard_lib::standardized_types::enums::*;
    use jt_standard_lib::standardized_types::strategies::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        router: Arc<SignalRouter>,
        store: Store,
        token: String,
        strategy_id: StrategyId,
        _dir: tempfile::TempDir,
    }

    async fn harness(mutate: impl FnOnce(&mut Strategy)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::connect(dir.path().join("jt.db").to_str().unwrap()).unwrap();
        store.run_migrations().await.unwrap();

        let mut strategy = Strategy {
            id: 0,
            user_id: 1,
            name: "mnq scalp".to_string(),
            symbol: "MNQH6".to_string(),
            enabled: true,
            initial_size: dec!(1),
            add_size: dec!(1),
            take_profit: Default::default(),
            stop_loss: Default::default(),
            add_down: Default::default(),
            break_even: Default::default(),
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
        mutate(&mut strategy);
        let token = strategy.webhook_token.clone();
        let strategy_id = store.create_strategy(strategy).await.unwrap();

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
        store
            .create_trader(Trader {
                id: 0,
                user_id: 1,
                strategy_id,
                account_id,
                enabled: true,
                multiplier: dec!(1),
                overrides: TraderOverrides::default(),
            })
            .await
            .unwrap();

        let router = SignalRouter::new(store.clone(), &jt_standard_lib::settings::ServerSettings::default());
        Harness { router, store, token, strategy_id, _dir: dir }
    }

    async fn accept_job(h: &Harness, body: &str, at: DateTime<Utc>) -> IngestJob {
        match h.router.accept(&h.token, body, at).await.unwrap() {
            AcceptOutcome::Accepted(job) => job,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_token_and_disabled_strategy_map_distinctly() {
        let h = harness(|_| {}).await;
        assert!(matches!(
            h.router.accept("nope", "{}", Utc::now()).await.unwrap(),
            AcceptOutcome::UnknownToken
        ));

        let h2 = harness(|s| s.enabled = false).await;
        assert!(matches!(
            h2.router.accept(&h2.token, r#"{"action":"buy"}"#, Utc::now()).await.unwrap(),
            AcceptOutcome::Gone
        ));
    }

    #[tokio::test]
    async fn unparseable_bodies_are_persisted_then_dropped() {
        let h = harness(|_| {}).await;
        assert!(matches!(
            h.router.accept(&h.token, "gibberish body", Utc::now()).await.unwrap(),
            AcceptOutcome::Unparseable
        ));
    }

    #[tokio::test]
    async fn duplicate_inside_window_produces_one_task_batch() {
        let h = harness(|_| {}).await;
        let now = Utc::now();
        let body = r#"{"action":"buy","ticker":"MNQH6","time":"2026-03-02T14:30:00Z"}"#;

        let first = accept_job(&h, body, now).await;
        let tasks = h.router.process(first).await.unwrap();
        assert_eq!(tasks.len(), 1);

        let second = accept_job(&h, body, now + ChronoDuration::seconds(3)).await;
        let tasks = h.router.process(second).await.unwrap();
        assert!(tasks.is_empty());

        // Outside the window the same payload goes through again.
        let third = accept_job(&h, body, now + ChronoDuration::seconds(45)).await;
        let tasks = h.router.process(third).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn direction_filter_drops_wrong_side() {
        let h = harness(|s| s.direction = DirectionFilter::LongOnly).await;
        let job = accept_job(&h, r#"{"action":"sell"}"#, Utc::now()).await;
        assert!(h.router.process(job).await.unwrap().is_empty());

        let job = accept_job(&h, r#"{"action":"buy"}"#, Utc::now()).await;
        assert_eq!(h.router.process(job).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cooldown_swallows_rapid_signals() {
        let h = harness(|s| s.signal_cooldown_secs = 60).await;
        let now = Utc::now();

        let job = accept_job(&h, r#"{"action":"buy"}"#, now).await;
        assert_eq!(h.router.process(job).await.unwrap().len(), 1);

        let job = accept_job(&h, r#"{"action":"sell"}"#, now + ChronoDuration::seconds(10)).await;
        assert!(h.router.process(job).await.unwrap().is_empty());

        let job = accept_job(&h, r#"{"action":"sell"}"#, now + ChronoDuration::seconds(90)).await;
        assert_eq!(h.router.process(job).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_cap_counts_accepted_signals_only() {
        let h = harness(|s| s.max_signals_per_session = 2).await;
        let now = Utc::now();

        for i in 0..2 {
            let job = accept_job(
                &h,
                &format!(r#"{{"action":"buy","time":"2026-03-02T14:3{}:00Z"}}"#, i),
                now + ChronoDuration::seconds(i * 60),
            )
            .await;
            assert_eq!(h.router.process(job).await.unwrap().len(), 1, "signal {}", i);
        }

        let job = accept_job(
            &h,
            r#"{"action":"buy","time":"2026-03-02T14:35:00Z"}"#,
            now + ChronoDuration::seconds(300),
        )
        .await;
        assert!(h.router.process(job).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inverse_flips_entries_not_closes() {
        let h = harness(|s| s.inverse = true).await;
        let job = accept_job(&h, r#"{"action":"buy"}"#, Utc::now()).await;
        let tasks = h.router.process(job).await.unwrap();
        assert_eq!(tasks[0].action, SignalAction::Sell);

        let job = accept_job(&h, r#"{"action":"close"}"#, Utc::now() + ChronoDuration::seconds(40)).await;
        let tasks = h.router.process(job).await.unwrap();
        assert_eq!(tasks[0].action, SignalAction::Close);
    }

    #[tokio::test]
    async fn signal_delay_takes_every_nth_entry() {
        let h = harness(|s| s.signal_delay = 2).await;
        let now = Utc::now();

        let mut produced = Vec::new();
        for i in 0..4 {
            let job = accept_job(
                &h,
                &format!(r#"{{"action":"buy","time":"2026-03-02T14:0{}:00Z"}}"#, i),
                now + ChronoDuration::seconds(i * 60),
            )
            .await;
            produced.push(h.router.process(job).await.unwrap().len());
        }
        // Every second entry executes.
        assert_eq!(produced, vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn follower_accounts_never_fire_on_signals() {
        let h = harness(|_| {}).await;
        // The trader's account (id from harness) becomes a follower.
        let traders = h.store.list_traders_for_strategy(h.strategy_id, true).await.unwrap();
        h.store.add_leader_account(999, true).await.unwrap();
        h.store
            .add_follower_account(999, traders[0].account_id, dec!(1), Decimal::ZERO, true, true)
            .await
            .unwrap();

        let job = accept_job(&h, r#"{"action":"buy"}"#, Utc::now()).await;
        assert!(h.router.process(job).await.unwrap().is_empty());
    }
}
