//! Uniform adapters over the external payment providers.
//!
//! Each adapter turns an order into whatever the buyer needs to pay (redirect URL, client
//! token, bank or voucher reference) and turns the provider's signed notifications into a
//! normalized [`shared::PaymentEvent`].

pub mod bank;
pub mod card;
pub mod client;
pub mod gateway;
pub mod mock;
pub mod money;
pub mod registry;
pub mod retry;
pub mod signature;
pub mod voucher;
pub mod wallet;

pub use bank::{BankConfig, BankReferenceGateway};
pub use card::{CardConfig, HostedCardGateway};
pub use gateway::{
    ChargeRequest, ChargeResult, IntentRequest, PaymentError, PaymentGateway, PaymentIntent,
    PaymentResult,
};
pub use mock::{MockGateway, MockWebhook};
pub use registry::GatewayRegistry;
pub use retry::{with_retries, RetryPolicy};
pub use voucher::{CashVoucherGateway, VoucherConfig};
pub use wallet::{WalletConfig, WalletRedirectGateway};
