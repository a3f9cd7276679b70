//! Opinionated AMQP 0-9-1 transport for microservices.
//!
//! Three patterns on top of a raw broker client: fire-and-forget
//! publishing ([`Transport::publish`]), request/response RPC with
//! correlated replies over a private queue
//! ([`Transport::publish_and_wait`]), and long-running consumers that
//! re-establish themselves across broker restarts
//! ([`Transport::create_consumed_queue`]). Connection lifecycle, queue
//! and exchange declarations, serialization, dead-letter demotion and
//! response caching all live behind those calls.
#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::pedantic,
    clippy::unwrap_used
)]
#![allow(clippy::unused_async, clippy::module_name_repetitions)]

pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod message;
pub mod serialize;
pub mod transport;

mod channel_pool;
mod facade;
mod reply_storage;
mod util;

pub use backoff::RecoveryPolicy;
pub use cache::ResponseCache;
pub use config::{
    ConnectionConfig, DlxConfig, ExchangeConfig, HeadersExchangeConfig, QueueOptions,
    RecoveryConfig, TransportConfig,
};
pub use error::{Death, Error, RemoteError};
pub use events::TransportEvent;
pub use facade::ConnectionState;
pub use handler::{Inbound, MessageHandler, Responder};
pub use lapin;
pub use message::{AppId, DeliveryProperties, PublishOptions, Response};
pub use serialize::{ContentEncoding, ContentType};
pub use transport::{BindingId, Transport};
