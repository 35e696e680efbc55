pub mod invoice;
pub mod nostr;
pub mod notify;
pub mod rates;
pub mod relay;
pub mod store;
pub mod telemetry;
