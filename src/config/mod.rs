use std::env;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::security_headers;

/// M-Pesa (Daraja) gateway settings.
#[derive(Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

impl MpesaConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("MPESA_BASE_URL")
                .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
            consumer_key: env::var("MPESA_CONSUMER_KEY").unwrap_or_default(),
            consumer_secret: env::var("MPESA_CONSUMER_SECRET").unwrap_or_default(),
            short_code: env::var("MPESA_SHORT_CODE").unwrap_or_else(|_| "174379".to_string()),
            passkey: env::var("MPESA_PASSKEY").unwrap_or_default(),
            callback_url: env::var("MPESA_CALLBACK_URL").unwrap_or_default(),
            account_reference: env::var("MPESA_ACCOUNT_REFERENCE")
                .unwrap_or_else(|_| "Tikiti".to_string()),
            transaction_desc: env::var("MPESA_TRANSACTION_DESC")
                .unwrap_or_else(|_| "Ticket purchase".to_string()),
        }
    }
}

pub struct Config {
    pub database_url: String,
    pub bind_port: u16,
    pub mpesa: MpesaConfig,
    pub notifier_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tikiti".to_string()),
            bind_port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            mpesa: MpesaConfig::from_env(),
            notifier_url: env::var("NOTIFIER_URL").ok(),
        }
    }
}
