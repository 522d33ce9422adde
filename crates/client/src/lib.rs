//! Client side of the gateway protocol.
//!
//! [`GatewayClient`] correlates responses with requests (each request gets a
//! UUID and a timeout), fans events out to subscribers, and reconnects with
//! exponential backoff. Requests still pending when the connection drops fail
//! with [`ClientError::ConnectionClosed`]. [`ChatStream`] turns one
//! `chat.send` into an ordered, pull-based stream.

pub mod backoff;
pub mod client;
pub mod error;
pub mod pending;
pub mod stream;
pub mod subscriptions;

pub use {
    backoff::Backoff,
    client::{ClientOptions, ConnectionState, GatewayClient},
    error::ClientError,
    stream::{ChatEvent, ChatStream},
    subscriptions::{Subscription, WILDCARD},
};
