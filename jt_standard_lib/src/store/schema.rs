// Hand-maintained to match the DDL in `migrations.rs`. Decimals are stored
// as text so both back-ends round-trip them exactly.

diesel::table! {
    users (id) {
        id -> BigInt,
        username -> Text,
        approved -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    accounts (id) {
        id -> BigInt,
        user_id -> BigInt,
        brokerage -> Text,
        environment -> Text,
        credentials -> Text,
        subaccount_id -> Text,
        enabled -> Bool,
        needs_reauth -> Bool,
        reauth_reason -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    strategies (id) {
        id -> BigInt,
        user_id -> BigInt,
        name -> Text,
        symbol -> Text,
        enabled -> Bool,
        initial_size -> Text,
        add_size -> Text,
        tp_plan -> Text,
        sl_plan -> Text,
        add_down_plan -> Text,
        break_even_plan -> Text,
        windows -> Text,
        auto_flat_after_cutoff -> Bool,
        direction -> Text,
        inverse -> Bool,
        signal_delay -> BigInt,
        signal_cooldown_secs -> BigInt,
        max_signals_per_session -> BigInt,
        max_daily_loss -> Text,
        max_contracts -> Text,
        time_zone -> Text,
        webhook_token -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    traders (id) {
        id -> BigInt,
        user_id -> BigInt,
        strategy_id -> BigInt,
        account_id -> BigInt,
        enabled -> Bool,
        multiplier -> Text,
        overrides -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    signals (id) {
        id -> BigInt,
        strategy_id -> Nullable<BigInt>,
        action -> Text,
        raw_body -> Text,
        dedup_key -> Text,
        accepted -> Bool,
        received_at -> Timestamp,
    }
}

diesel::table! {
    trades (id) {
        id -> BigInt,
        strategy_id -> BigInt,
        trader_id -> BigInt,
        account_id -> BigInt,
        signal_id -> Nullable<BigInt>,
        symbol -> Text,
        side -> Text,
        quantity -> Text,
        entry_price -> Text,
        entry_time -> Timestamp,
        exit_price -> Nullable<Text>,
        exit_time -> Nullable<Timestamp>,
        status -> Text,
        exit_reason -> Nullable<Text>,
        realized_pnl -> Nullable<Text>,
        client_order_id -> Text,
        tp_order_id -> Nullable<Text>,
        sl_order_id -> Nullable<Text>,
        break_even_applied -> Bool,
    }
}

diesel::table! {
    positions (id) {
        id -> BigInt,
        strategy_id -> BigInt,
        symbol -> Text,
        side -> Text,
        quantity -> Text,
        average_price -> Text,
        entries -> Text,
        open_pnl -> Text,
        worst_pnl -> Text,
        best_pnl -> Text,
        open -> Bool,
        opened_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    leader_accounts (id) {
        id -> BigInt,
        account_id -> BigInt,
        auto_copy_enabled -> Bool,
    }
}

diesel::table! {
    follower_accounts (id) {
        id -> BigInt,
        leader_account_id -> BigInt,
        account_id -> BigInt,
        multiplier -> Text,
        max_position_size -> Text,
        copy_tp -> Bool,
        copy_sl -> Bool,
        enabled -> Bool,
    }
}

diesel::table! {
    copy_trade_logs (id) {
        id -> BigInt,
        leader_account_id -> BigInt,
        follower_account_id -> BigInt,
        symbol -> Text,
        side -> Text,
        leader_quantity -> Text,
        follower_quantity -> Text,
        leader_price -> Nullable<Text>,
        follower_price -> Nullable<Text>,
        status -> Text,
        latency_ms -> Nullable<BigInt>,
        error -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    contract_mappings (id) {
        id -> BigInt,
        source_symbol -> Text,
        target_symbol -> Text,
        qty_multiplier -> Text,
    }
}

diesel::table! {
    execution_failures (id) {
        id -> BigInt,
        strategy_id -> Nullable<BigInt>,
        trader_id -> Nullable<BigInt>,
        account_id -> Nullable<BigInt>,
        symbol -> Text,
        action -> Text,
        error_kind -> Text,
        detail -> Text,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(traders, strategies);
diesel::allow_tables_to_appear_in_same_query!(leader_accounts, follower_accounts);
