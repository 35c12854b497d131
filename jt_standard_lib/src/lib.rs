pub mod errors;
pub mod helpers;
pub mod settings;
pub mod standardized_types;
pub mod store;

/// Key identifying one shared streaming session: one per (brokerage, credential),
/// never per account. Multiple accounts multiplex over the same key.
pub type TokenKey = String;
