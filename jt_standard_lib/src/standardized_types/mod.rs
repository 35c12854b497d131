use rust_decimal::Decimal;

pub mod accounts;
pub mod broker_enum;
pub mod copy_trading;
pub mod enums;
pub mod orders;
pub mod signals;
pub mod strategies;
pub mod stream_events;
pub mod trades;

pub type Price = Decimal;
pub type Volume = Decimal;
pub type SymbolName = String;
