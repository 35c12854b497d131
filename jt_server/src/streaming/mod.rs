use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use jt_standard_lib::errors::JtError;
use jt_standard_lib::settings::ServerSettings;
use jt_standard_lib::standardized_types::accounts::{Account, AccountId};
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::Environment;
use jt_standard_lib::standardized_types::stream_events::StreamEvent;
use jt_standard_lib::TokenKey;

use crate::credential_keeper::CredentialKeeper;

pub mod gate;
pub mod market_hours;
pub mod projectx_socket;
pub mod state;
pub mod tradovate_socket;

use gate::ConnectGate;
use state::{backoff_delay, ConnectionState, Liveness, LivenessPolicy};

pub type ListenerId = u64;

/// Callbacks run synchronously on the hub's read path. They must not
/// block; anything nontrivial gets offloaded by the listener itself.
pub trait StreamListener: Send + Sync {
    fn on_event(&self, event: &StreamEvent);
}

struct ListenerEntry {
    token_key: TokenKey,
    /// Broker subaccount ids of interest; empty means every account on
    /// the session.
    accounts: HashSet<String>,
    listener: Arc<dyn StreamListener>,
}

/// Wall-clock bookkeeping for one socket lifetime, shared between the
/// socket task (writer) and the hub watchdog (reader).
pub struct SessionClock {
    connected_at: Instant,
    last_message: Mutex<Instant>,
    last_data: Mutex<Instant>,
}

impl SessionClock {
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            connected_at: now,
            last_message: Mutex::new(now),
            last_data: Mutex::new(now),
        })
    }

    pub fn touch_message(&self) {
        *self.last_message.lock().unwrap() = Instant::now();
    }

    pub fn touch_data(&self) {
        let now = Instant::now();
        *self.last_message.lock().unwrap() = now;
        *self.last_data.lock().unwrap() = now;
    }

    pub fn last_message(&self) -> Instant {
        *self.last_message.lock().unwrap()
    }

    pub fn last_data(&self) -> Instant {
        *self.last_data.lock().unwrap()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    fn saw_any_message(&self) -> bool {
        self.last_message() > self.connected_at
    }
}

struct Session {
    brokerage: Brokerage,
    state: Arc<Mutex<ConnectionState>>,
    clock: Arc<Mutex<Option<Arc<SessionClock>>>>,
    desired_accounts: Arc<Mutex<HashSet<String>>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Serialize)]
pub struct TokenStatus {
    pub token_key: TokenKey,
    pub brokerage: String,
    pub connected: bool,
    pub last_message_age_secs: Option<u64>,
    pub listener_count: usize,
}

/// One persistent streaming session per broker credential, multiplexed
/// across every logical consumer. The hub owns every streaming socket in
/// the process; nothing else opens one.
pub struct StreamingHub {
    keeper: Arc<CredentialKeeper>,
    gate: Arc<ConnectGate>,
    policy: LivenessPolicy,
    heartbeat_every: Duration,
    initial_stagger_max: Duration,
    listeners: DashMap<ListenerId, ListenerEntry>,
    sessions: DashMap<TokenKey, Session>,
    next_listener_id: AtomicU64,
}

impl StreamingHub {
    pub fn new(keeper: Arc<CredentialKeeper>, settings: &ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            keeper,
            gate: ConnectGate::new(
                settings.stream_connect_concurrency,
                Duration::from_secs(settings.stream_connect_spacing_secs),
            ),
            policy: LivenessPolicy::from_settings(settings),
            heartbeat_every: Duration::from_millis(settings.stream_heartbeat_ms),
            initial_stagger_max: Duration::from_secs(settings.stream_initial_stagger_max_secs),
            listeners: DashMap::new(),
            sessions: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Register interest in a credential's event stream. The first
    /// registration for a token key spawns its session; later ones merge
    /// their accounts into the union, which takes effect on the next
    /// (re)connect so the one-subscription-per-socket rule holds.
    pub fn register(
        self: &Arc<Self>,
        account: &Account,
        subaccounts: Vec<String>,
        listener: Arc<dyn StreamListener>,
    ) -> ListenerId {
        let token_key = account.credential_key();
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(
            id,
            ListenerEntry {
                token_key: token_key.clone(),
                accounts: subaccounts.iter().cloned().collect(),
                listener,
            },
        );

        if !account.brokerage.has_streaming() {
            return id;
        }

        match self.sessions.get(&token_key) {
            Some(session) => {
                let mut desired = session.desired_accounts.lock().unwrap();
                desired.extend(subaccounts);
            }
            None => {
                let state = Arc::new(Mutex::new(ConnectionState::Idle));
                let clock = Arc::new(Mutex::new(None));
                let desired: Arc<Mutex<HashSet<String>>> =
                    Arc::new(Mutex::new(subaccounts.into_iter().collect()));
                let task = self.spawn_session(
                    token_key.clone(),
                    account.brokerage,
                    account.id,
                    account.environment == Environment::Live,
                    state.clone(),
                    clock.clone(),
                    desired.clone(),
                );
                self.sessions.insert(
                    token_key.clone(),
                    Session {
                        brokerage: account.brokerage,
                        state,
                        clock,
                        desired_accounts: desired,
                        task,
                    },
                );
                info!(%token_key, "streaming session created");
            }
        }
        id
    }

    /// Remove a listener. The session is torn down once nothing is
    /// listening on its key.
    pub fn unregister(&self, id: ListenerId) {
        let Some((_, entry)) = self.listeners.remove(&id) else { return };
        let still_used = self
            .listeners
            .iter()
            .any(|other| other.token_key == entry.token_key);
        if !still_used {
            if let Some((key, session)) = self.sessions.remove(&entry.token_key) {
                session.task.abort();
                info!(token_key = %key, "streaming session torn down, no listeners left");
            }
        }
    }

    /// Whether a live session is currently carrying this account's events;
    /// the reconciler skips TP repair when it is.
    pub fn is_tracking(&self, account: &Account) -> bool {
        let key = account.credential_key();
        match self.sessions.get(&key) {
            Some(session) => session.state.lock().unwrap().is_connected(),
            None => false,
        }
    }

    pub fn status(&self) -> Vec<TokenStatus> {
        self.sessions
            .iter()
            .map(|entry| {
                let key = entry.key().clone();
                let connected = entry.state.lock().unwrap().is_connected();
                let last_message_age_secs = entry
                    .clock
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|clock| clock.last_message().elapsed().as_secs());
                TokenStatus {
                    brokerage: entry.brokerage.to_string(),
                    connected,
                    last_message_age_secs,
                    listener_count: self
                        .listeners
                        .iter()
                        .filter(|l| l.token_key == key)
                        .count(),
                    token_key: key,
                }
            })
            .collect()
    }

    /// Messages are parsed once (in the socket modules); this fans the
    /// typed event out to interested listeners. A panicking listener is
    /// logged and skipped; it can never take the shared connection down.
    fn dispatch(&self, token_key: &TokenKey, event: &StreamEvent) {
        for entry in self.listeners.iter() {
            if &entry.token_key != token_key {
                continue;
            }
            if let Some(account) = event.account() {
                if !entry.accounts.is_empty() && !entry.accounts.contains(account) {
                    continue;
                }
            }
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                entry.listener.on_event(event);
            }));
            if result.is_err() {
                error!(listener_id = *entry.key(), "stream listener panicked; event skipped");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_session(
        self: &Arc<Self>,
        token_key: TokenKey,
        brokerage: Brokerage,
        account_id: AccountId,
        live: bool,
        state: Arc<Mutex<ConnectionState>>,
        clock_slot: Arc<Mutex<Option<Arc<SessionClock>>>>,
        desired: Arc<Mutex<HashSet<String>>>,
    ) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            session_loop(hub, token_key, brokerage, account_id, live, state, clock_slot, desired)
                .await;
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_loop(
    hub: Weak<StreamingHub>,
    token_key: TokenKey,
    brokerage: Brokerage,
    account_id: AccountId,
    live: bool,
    state: Arc<Mutex<ConnectionState>>,
    clock_slot: Arc<Mutex<Option<Arc<SessionClock>>>>,
    desired: Arc<Mutex<HashSet<String>>>,
) {
    // Stagger process-start connections so a restart does not slam the
    // broker with simultaneous handshakes.
    {
        let Some(hub) = hub.upgrade() else { return };
        let stagger_max = hub.initial_stagger_max.as_millis() as u64;
        drop(hub);
        if stagger_max > 0 {
            let wait = rand::thread_rng().gen_range(0..stagger_max);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    let mut attempt: u32 = 0;
    loop {
        let Some(hub) = hub.upgrade() else { return };

        // Enter the gated connect region.
        let permit = hub.gate.enter().await;
        *state.lock().unwrap() = ConnectionState::Connecting;

        let token = match hub.keeper.token_for(account_id).await {
            Ok(token) => token,
            Err(JtError::AuthExpired(_)) => {
                // Dead until a credentials change; poll the store rather
                // than hammering the broker.
                *state.lock().unwrap() = ConnectionState::Dead;
                drop(permit);
                drop(hub);
                wait_for_reauth(&token_key, &state).await;
                attempt = 0;
                continue;
            }
            Err(e) => {
                warn!(%token_key, error = %e, "token fetch failed before connect");
                *state.lock().unwrap() = ConnectionState::Dead;
                drop(permit);
                attempt = attempt.saturating_add(1);
                backoff(&state, attempt).await;
                continue;
            }
        };

        *state.lock().unwrap() = ConnectionState::Authenticating;
        let clock = SessionClock::new();
        *clock_slot.lock().unwrap() = Some(clock.clone());

        let accounts: Vec<String> = desired.lock().unwrap().iter().cloned().collect();
        let dispatch: Arc<dyn Fn(StreamEvent) + Send + Sync> = {
            let hub = Arc::downgrade(&hub);
            let token_key = token_key.clone();
            Arc::new(move |event| {
                if let Some(hub) = hub.upgrade() {
                    hub.dispatch(&token_key, &event);
                }
            })
        };

        let socket_clock = clock.clone();
        let heartbeat = hub.heartbeat_every;
        let socket_token = token.clone();
        let mut socket_task = tokio::spawn(async move {
            match brokerage {
                Brokerage::Tradovate => {
                    tradovate_socket::run(
                        live,
                        &socket_token,
                        &accounts,
                        heartbeat,
                        socket_clock,
                        dispatch,
                    )
                    .await
                }
                Brokerage::ProjectX => {
                    projectx_socket::run(
                        live,
                        &socket_token,
                        &accounts,
                        heartbeat,
                        socket_clock,
                        dispatch,
                    )
                    .await
                }
                _ => Ok(()),
            }
        });

        *state.lock().unwrap() = ConnectionState::Subscribing;

        // The gate permit is held until the session proves itself (first
        // peer frame) or gives up.
        let proved = wait_for_first_frame(&clock, Duration::from_secs(15), &socket_task).await;
        drop(permit);

        if proved {
            *state.lock().unwrap() = ConnectionState::Live { since: Instant::now() };
            info!(%token_key, "streaming session live");
        }

        // Watchdog: silence probing, dead-subscription detection, token
        // aging. The socket task dying for any reason lands here too.
        let policy = hub.policy;
        let keeper = hub.keeper.clone();
        drop(hub);
        let outcome = watchdog(&mut socket_task, &clock, &policy, &state).await;

        match outcome {
            WatchdogOutcome::PeerClosed(Ok(())) => {
                info!(%token_key, "stream closed by peer");
                attempt = 0;
            }
            WatchdogOutcome::PeerClosed(Err(e)) => {
                warn!(%token_key, error = %e, "stream failed");
                attempt = attempt.saturating_add(1);
                if matches!(e, JtError::AuthExpired(_)) {
                    // The broker rejected a token we thought was fresh;
                    // force the next connect through a refresh.
                    keeper.invalidate(account_id).await.ok();
                }
            }
            WatchdogOutcome::ForcedReconnect => {
                warn!(%token_key, "forcing reconnect (dead subscription or aged token)");
                attempt = 0;
            }
        }

        // Long-lived sessions reset the backoff curve.
        if clock.connected_at().elapsed() > Duration::from_secs(300) {
            attempt = 0;
        }
        backoff(&state, attempt.max(1)).await;
    }
}

enum WatchdogOutcome {
    PeerClosed(Result<(), JtError>),
    ForcedReconnect,
}

async fn watchdog(
    socket_task: &mut JoinHandle<Result<(), JtError>>,
    clock: &Arc<SessionClock>,
    policy: &LivenessPolicy,
    state: &Arc<Mutex<ConnectionState>>,
) -> WatchdogOutcome {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            result = &mut *socket_task => {
                *state.lock().unwrap() = ConnectionState::Dead;
                let result = match result {
                    Ok(socket_result) => socket_result,
                    Err(join_error) if join_error.is_panic() => {
                        Err(JtError::Internal("socket task panicked".to_string()))
                    }
                    Err(_) => Ok(()),
                };
                return WatchdogOutcome::PeerClosed(result);
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let market_open = market_hours::is_futures_market_open(chrono::Utc::now());
                match policy.classify(
                    now,
                    clock.connected_at(),
                    clock.last_message(),
                    clock.last_data(),
                    market_open,
                ) {
                    Liveness::Healthy => {
                        let mut guard = state.lock().unwrap();
                        if matches!(*guard, ConnectionState::Silent { .. }) {
                            *guard = ConnectionState::Live { since: clock.connected_at() };
                        }
                    }
                    Liveness::Probe => {
                        let mut guard = state.lock().unwrap();
                        if matches!(*guard, ConnectionState::Live { .. }) {
                            *guard = ConnectionState::Silent { since: now };
                        }
                        // The socket's heartbeat cadence doubles as the
                        // probe; nothing extra to send from here.
                    }
                    Liveness::ForceReconnect => {
                        socket_task.abort();
                        *state.lock().unwrap() = ConnectionState::Dead;
                        return WatchdogOutcome::ForcedReconnect;
                    }
                }
            }
        }
    }
}

async fn wait_for_first_frame(
    clock: &Arc<SessionClock>,
    timeout: Duration,
    socket_task: &JoinHandle<Result<(), JtError>>,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if clock.saw_any_message() {
            return true;
        }
        if socket_task.is_finished() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn backoff(state: &Arc<Mutex<ConnectionState>>, attempt: u32) {
    let delay = backoff_delay(attempt);
    *state.lock().unwrap() = ConnectionState::Backoff {
        attempt,
        until: Instant::now() + delay,
    };
    tokio::time::sleep(delay).await;
}

/// Auth is dead until credentials change; the loop re-checks the keeper
/// every pass instead of hammering the broker.
async fn wait_for_reauth(token_key: &TokenKey, state: &Arc<Mutex<ConnectionState>>) {
    warn!(%token_key, "stream auth dead; waiting for re-authentication");
    *state.lock().unwrap() = ConnectionState::Dead;
    tokio::time::sleep(Duration::from_secs(30)).await;
}
