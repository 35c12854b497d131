use diesel::sql_query;
use diesel::RunQueryDsl;
use tracing::{debug, info};

use crate::errors::JtError;
use crate::store::AnyConnection;

/// `{ID}` is replaced with the back-end's auto-increment primary key
/// spelling. Everything else is the portable subset: TEXT, BIGINT,
/// BOOLEAN, TIMESTAMP, and single-quoted string defaults.
const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id {ID},
        username TEXT NOT NULL,
        approved BOOLEAN NOT NULL DEFAULT '0',
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS accounts (
        id {ID},
        user_id BIGINT NOT NULL,
        brokerage TEXT NOT NULL,
        environment TEXT NOT NULL,
        credentials TEXT NOT NULL,
        subaccount_id TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT '1',
        needs_reauth BOOLEAN NOT NULL DEFAULT '0',
        reauth_reason TEXT,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS strategies (
        id {ID},
        user_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        symbol TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT '1',
        initial_size TEXT NOT NULL DEFAULT '1',
        add_size TEXT NOT NULL DEFAULT '1',
        tp_plan TEXT NOT NULL DEFAULT '{}',
        sl_plan TEXT NOT NULL DEFAULT '{}',
        add_down_plan TEXT NOT NULL DEFAULT '{}',
        break_even_plan TEXT NOT NULL DEFAULT '{}',
        windows TEXT NOT NULL DEFAULT '[]',
        auto_flat_after_cutoff BOOLEAN NOT NULL DEFAULT '0',
        direction TEXT NOT NULL DEFAULT 'both',
        inverse BOOLEAN NOT NULL DEFAULT '0',
        time_zone TEXT NOT NULL DEFAULT 'America/Chicago',
        webhook_token TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS traders (
        id {ID},
        user_id BIGINT NOT NULL,
        strategy_id BIGINT NOT NULL,
        account_id BIGINT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT '1',
        multiplier TEXT NOT NULL DEFAULT '1',
        overrides TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS signals (
        id {ID},
        strategy_id BIGINT,
        action TEXT NOT NULL,
        raw_body TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        accepted BOOLEAN NOT NULL DEFAULT '0',
        received_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trades (
        id {ID},
        strategy_id BIGINT NOT NULL,
        trader_id BIGINT NOT NULL,
        account_id BIGINT NOT NULL,
        signal_id BIGINT,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity TEXT NOT NULL,
        entry_price TEXT NOT NULL,
        entry_time TIMESTAMP NOT NULL,
        exit_price TEXT,
        exit_time TIMESTAMP,
        status TEXT NOT NULL DEFAULT 'open',
        exit_reason TEXT,
        realized_pnl TEXT,
        client_order_id TEXT NOT NULL,
        tp_order_id TEXT,
        sl_order_id TEXT,
        break_even_applied BOOLEAN NOT NULL DEFAULT '0'
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        id {ID},
        strategy_id BIGINT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity TEXT NOT NULL DEFAULT '0',
        average_price TEXT NOT NULL DEFAULT '0',
        entries TEXT NOT NULL DEFAULT '[]',
        open_pnl TEXT NOT NULL DEFAULT '0',
        worst_pnl TEXT NOT NULL DEFAULT '0',
        best_pnl TEXT NOT NULL DEFAULT '0',
        open BOOLEAN NOT NULL DEFAULT '1',
        opened_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leader_accounts (
        id {ID},
        account_id BIGINT NOT NULL,
        auto_copy_enabled BOOLEAN NOT NULL DEFAULT '1'
    )",
    "CREATE TABLE IF NOT EXISTS follower_accounts (
        id {ID},
        leader_account_id BIGINT NOT NULL,
        account_id BIGINT NOT NULL,
        multiplier TEXT NOT NULL DEFAULT '1',
        max_position_size TEXT NOT NULL DEFAULT '0',
        copy_tp BOOLEAN NOT NULL DEFAULT '1',
        copy_sl BOOLEAN NOT NULL DEFAULT '1',
        enabled BOOLEAN NOT NULL DEFAULT '1'
    )",
    "CREATE TABLE IF NOT EXISTS copy_trade_logs (
        id {ID},
        leader_account_id BIGINT NOT NULL,
        follower_account_id BIGINT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        leader_quantity TEXT NOT NULL,
        follower_quantity TEXT NOT NULL,
        leader_price TEXT,
        follower_price TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        latency_ms BIGINT,
        error TEXT,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS contract_mappings (
        id {ID},
        source_symbol TEXT NOT NULL,
        target_symbol TEXT NOT NULL,
        qty_multiplier TEXT NOT NULL DEFAULT '1'
    )",
    "CREATE TABLE IF NOT EXISTS execution_failures (
        id {ID},
        strategy_id BIGINT,
        trader_id BIGINT,
        account_id BIGINT,
        symbol TEXT NOT NULL,
        action TEXT NOT NULL,
        error_kind TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
];

/// Columns added after first release. Each runs as
/// `ALTER TABLE <table> ADD COLUMN <ddl>` and a duplicate-column error is
/// treated as success, which is what makes the whole pass idempotent.
/// Numeric caps default to '0' meaning unlimited; a finite default here
/// would silently cap every existing row.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("strategies", "signal_delay BIGINT NOT NULL DEFAULT '0'"),
    ("strategies", "signal_cooldown_secs BIGINT NOT NULL DEFAULT '0'"),
    ("strategies", "max_signals_per_session BIGINT NOT NULL DEFAULT '0'"),
    ("strategies", "max_daily_loss TEXT NOT NULL DEFAULT '0'"),
    ("strategies", "max_contracts TEXT NOT NULL DEFAULT '0'"),
];

const CREATE_INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_strategies_webhook_token ON strategies (webhook_token)",
    "CREATE INDEX IF NOT EXISTS idx_signals_strategy ON signals (strategy_id, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_signals_dedup ON signals (dedup_key, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_trades_open ON trades (account_id, symbol, status)",
    "CREATE INDEX IF NOT EXISTS idx_failures_created ON execution_failures (created_at)",
];

fn auto_increment_id(conn: &AnyConnection) -> &'static str {
    match conn {
        AnyConnection::Sqlite(_) => "INTEGER PRIMARY KEY AUTOINCREMENT",
        AnyConnection::Postgres(_) => "BIGSERIAL PRIMARY KEY",
    }
}

fn is_duplicate_column(err: &diesel::result::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("duplicate column") || text.contains("already exists")
}

/// Run the full additive migration pass. Safe to call at every startup and
/// from the admin endpoint; re-running is a no-op.
pub fn run_migrations(conn: &mut AnyConnection) -> Result<(), JtError> {
    let id_spelling = auto_increment_id(conn);

    for ddl in CREATE_TABLES {
        let stmt = ddl.replace("{ID}", id_spelling);
        sql_query(stmt)
            .execute(conn)
            .map_err(|e| JtError::StoreUnavailable(format!("create table: {}", e)))?;
    }

    for (table, column_ddl) in ADDITIVE_COLUMNS {
        let stmt = format!("ALTER TABLE {} ADD COLUMN {}", table, column_ddl);
        match sql_query(stmt).execute(conn) {
            Ok(_) => info!(table = *table, column = *column_ddl, "added column"),
            Err(e) if is_duplicate_column(&e) => {
                debug!(table = *table, column = *column_ddl, "column present, skipping");
            }
            Err(e) => {
                return Err(JtError::StoreUnavailable(format!(
                    "alter table {}: {}",
                    table, e
                )))
            }
        }
    }

    for ddl in CREATE_INDEXES {
        sql_query(*ddl)
            .execute(conn)
            .map_err(|e| JtError::StoreUnavailable(format!("create index: {}", e)))?;
    }

    Ok(())
}
