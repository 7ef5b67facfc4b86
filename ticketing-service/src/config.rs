use anyhow::{anyhow, Result};
use chrono::Duration;
use clap::Parser;
use payment_gateways::{
    BankConfig, BankReferenceGateway, CardConfig, CashVoucherGateway, GatewayRegistry,
    HostedCardGateway, MockGateway, RetryPolicy, VoucherConfig, WalletConfig,
    WalletRedirectGateway,
};
use shared::Gateway;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "ticketing-service")]
pub struct Config {
    /// Falls back to the in-memory store when unset.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_POOL_SIZE", default_value = "10")]
    pub database_pool_size: u32,

    /// Ticket delivery is only published when brokers are configured.
    #[arg(long, env = "KAFKA_BROKERS")]
    pub kafka_brokers: Option<String>,

    #[arg(long, default_value = "ticket-delivery")]
    pub delivery_topic: String,

    #[arg(long, env = "PORT", default_value = "3001")]
    pub port: u16,

    #[arg(long, env = "RESERVATION_WINDOW_MINUTES", default_value = "30")]
    pub reservation_window_minutes: i64,

    #[arg(long, env = "CARD_RESERVATION_WINDOW_MINUTES", default_value = "10")]
    pub card_reservation_window_minutes: i64,

    #[arg(long, env = "MAX_TICKETS_PER_PURCHASE", default_value = "10")]
    pub max_tickets_per_purchase: i32,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SWEEP_BATCH", default_value = "100")]
    pub sweep_batch: i64,

    /// Bearer tokens accepted on operator and scanner endpoints.
    #[arg(long, env = "STAFF_TOKENS", value_delimiter = ',')]
    pub staff_tokens: Vec<String>,

    #[arg(long, env = "GATEWAY_MAX_ATTEMPTS", default_value = "3")]
    pub gateway_max_attempts: u32,

    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value = "10")]
    pub gateway_timeout_secs: u64,

    #[arg(long, env = "WALLET_API_BASE")]
    pub wallet_api_base: Option<String>,
    #[arg(long, env = "WALLET_API_KEY")]
    pub wallet_api_key: Option<String>,
    #[arg(long, env = "WALLET_WEBHOOK_SECRET")]
    pub wallet_webhook_secret: Option<String>,
    #[arg(long, env = "WALLET_NOTIFICATION_URL")]
    pub wallet_notification_url: Option<String>,

    #[arg(long, env = "CARD_API_BASE")]
    pub card_api_base: Option<String>,
    #[arg(long, env = "CARD_API_KEY")]
    pub card_api_key: Option<String>,
    #[arg(long, env = "CARD_WEBHOOK_SECRET")]
    pub card_webhook_secret: Option<String>,

    #[arg(long, env = "BANK_API_BASE")]
    pub bank_api_base: Option<String>,
    #[arg(long, env = "BANK_API_KEY")]
    pub bank_api_key: Option<String>,
    #[arg(long, env = "BANK_WEBHOOK_SECRET")]
    pub bank_webhook_secret: Option<String>,

    #[arg(long, env = "VOUCHER_API_BASE")]
    pub voucher_api_base: Option<String>,
    #[arg(long, env = "VOUCHER_API_KEY")]
    pub voucher_api_key: Option<String>,
    #[arg(long, env = "VOUCHER_WEBHOOK_SECRET")]
    pub voucher_webhook_secret: Option<String>,

    /// Registers in-process mock gateways for every provider that is not configured.
    #[arg(long, env = "MOCK_GATEWAY_SECRET")]
    pub mock_gateway_secret: Option<String>,
}

/// Engine knobs, decoupled from how they were parsed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reservation_window: Duration,
    pub card_reservation_window: Duration,
    pub max_tickets_per_purchase: i32,
    pub sweep_interval: StdDuration,
    pub sweep_batch: i64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_window: Duration::minutes(30),
            card_reservation_window: Duration::minutes(10),
            max_tickets_per_purchase: 10,
            sweep_interval: StdDuration::from_secs(60),
            sweep_batch: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Provider credentials: all three must be present once the webhook secret is.
fn credentials(
    name: &str,
    api_base: &Option<String>,
    api_key: &Option<String>,
    secret: &Option<String>,
) -> Result<Option<(String, String, String)>> {
    let Some(secret) = secret.clone() else {
        return Ok(None);
    };
    let api_base = api_base
        .clone()
        .ok_or_else(|| anyhow!("{} gateway has a webhook secret but no API base", name))?;
    let api_key = api_key
        .clone()
        .ok_or_else(|| anyhow!("{} gateway has a webhook secret but no API key", name))?;
    Ok(Some((api_base, api_key, secret)))
}

impl Config {
    pub fn engine(&self) -> Result<EngineConfig> {
        if self.max_tickets_per_purchase < 1 {
            return Err(anyhow!("MAX_TICKETS_PER_PURCHASE must be at least 1"));
        }
        if self.gateway_max_attempts < 1 {
            return Err(anyhow!("GATEWAY_MAX_ATTEMPTS must be at least 1"));
        }

        Ok(EngineConfig {
            reservation_window: Duration::minutes(self.reservation_window_minutes),
            card_reservation_window: Duration::minutes(self.card_reservation_window_minutes),
            max_tickets_per_purchase: self.max_tickets_per_purchase,
            sweep_interval: StdDuration::from_secs(self.sweep_interval_secs.max(1)),
            sweep_batch: self.sweep_batch.max(1),
            retry: RetryPolicy {
                max_attempts: self.gateway_max_attempts,
                ..RetryPolicy::default()
            },
        })
    }

    pub fn gateway_registry(&self) -> Result<GatewayRegistry> {
        let timeout = StdDuration::from_secs(self.gateway_timeout_secs);
        let mut registry = GatewayRegistry::new();

        if let Some((api_base, access_token, webhook_secret)) = credentials(
            "wallet",
            &self.wallet_api_base,
            &self.wallet_api_key,
            &self.wallet_webhook_secret,
        )? {
            registry.register(Arc::new(WalletRedirectGateway::new(WalletConfig {
                api_base,
                access_token,
                webhook_secret,
                notification_url: self.wallet_notification_url.clone(),
                tolerance_secs: 300,
                timeout,
            })?));
        }

        if let Some((api_base, secret_key, webhook_secret)) = credentials(
            "card",
            &self.card_api_base,
            &self.card_api_key,
            &self.card_webhook_secret,
        )? {
            registry.register(Arc::new(HostedCardGateway::new(CardConfig {
                api_base,
                secret_key,
                webhook_secret,
                tolerance_secs: 300,
                timeout,
            })?));
        }

        if let Some((api_base, api_key, webhook_secret)) = credentials(
            "bank",
            &self.bank_api_base,
            &self.bank_api_key,
            &self.bank_webhook_secret,
        )? {
            registry.register(Arc::new(BankReferenceGateway::new(BankConfig {
                api_base,
                api_key,
                webhook_secret,
                timeout,
            })?));
        }

        if let Some((api_base, api_key, webhook_secret)) = credentials(
            "voucher",
            &self.voucher_api_base,
            &self.voucher_api_key,
            &self.voucher_webhook_secret,
        )? {
            registry.register(Arc::new(CashVoucherGateway::new(VoucherConfig {
                api_base,
                api_key,
                webhook_secret,
                timeout,
            })?));
        }

        if let Some(secret) = &self.mock_gateway_secret {
            for kind in [
                Gateway::WalletRedirect,
                Gateway::HostedCard,
                Gateway::BankReference,
                Gateway::CashVoucher,
            ] {
                if registry.get(kind).is_none() {
                    warn!(gateway = %kind, "registering mock gateway");
                    registry.register(Arc::new(MockGateway::new(kind, secret.clone())));
                }
            }
        }

        if registry.is_empty() {
            warn!("no payment gateway configured; only manual completion is available");
        } else {
            info!(gateways = ?registry.kinds(), "payment gateways registered");
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_staff_tokens_parse() {
        let config = Config::try_parse_from([
            "ticketing-service",
            "--staff-tokens",
            "door-1,door-2",
        ])
        .unwrap();

        assert_eq!(config.delivery_topic, "ticket-delivery");
        assert_eq!(config.staff_tokens, vec!["door-1", "door-2"]);

        let engine = config.engine().unwrap();
        assert_eq!(engine.reservation_window, Duration::minutes(30));
        assert_eq!(engine.card_reservation_window, Duration::minutes(10));
        assert_eq!(engine.retry.max_attempts, 3);
    }

    #[test]
    fn a_webhook_secret_without_credentials_is_rejected() {
        let config = Config::try_parse_from([
            "ticketing-service",
            "--bank-webhook-secret",
            "s3cret",
        ])
        .unwrap();

        assert!(config.gateway_registry().is_err());
    }

    #[test]
    fn mock_secret_fills_every_provider() {
        let config = Config::try_parse_from([
            "ticketing-service",
            "--mock-gateway-secret",
            "dev",
        ])
        .unwrap();

        let registry = config.gateway_registry().unwrap();
        assert_eq!(registry.kinds().len(), 4);
        assert!(registry.resolve("voucher").is_some());
    }
}
