use serde::Deserialize;

/// Runtime configuration, read from the environment (see `.env` loading in
/// `main`). Processor secrets are empty by default so the relay can boot in
/// tests without any processor configured; the corresponding adapters just
/// reject webhooks until a secret is set.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_crypto_invoice_base")]
    pub crypto_invoice_base: String,
    #[serde(default)]
    pub crypto_invoice_token: String,

    #[serde(default = "default_card_gateway_base")]
    pub card_gateway_base: String,
    #[serde(default)]
    pub card_gateway_merchant_id: String,
    #[serde(default)]
    pub card_gateway_secret: String,

    #[serde(default = "default_peer_wallet_base")]
    pub peer_wallet_base: String,
    #[serde(default)]
    pub peer_wallet_token: String,

    #[serde(default = "default_delivery_base")]
    pub delivery_base: String,
    #[serde(default)]
    pub delivery_token: String,

    /// Bound on every `check_paid` poll; a timeout reads as "not yet paid".
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}

fn default_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "sqlite:storefront_relay.db".to_string()
}

fn default_crypto_invoice_base() -> String {
    "https://pay.crypt.bot/api".to_string()
}

fn default_card_gateway_base() -> String {
    "https://app.platega.io".to_string()
}

fn default_peer_wallet_base() -> String {
    "https://wallet.example.com/api".to_string()
}

fn default_delivery_base() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_check_timeout_secs() -> u64 {
    10
}
