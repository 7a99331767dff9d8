pub mod schema;

pub use schema::{Config, GatewayConfig, SendMode, SessionConfig, StoreConfig, WebhookConfig};
