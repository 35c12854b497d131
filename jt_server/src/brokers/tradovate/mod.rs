pub mod api_client;
pub mod models;

pub use api_client::TradovateClient;
