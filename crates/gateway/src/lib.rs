//! Gateway: WebSocket/HTTP server, request dispatch, streaming chat runs and
//! the broadcast bus.
//!
//! Lifecycle:
//! 1. Load config, build the provider registry and chat service
//! 2. Register method handlers
//! 3. Bind and serve `/health` and `/ws`
//! 4. Tick broadcast in the background
//!
//! Every socket gets a hello response, then any number of concurrent
//! requests. Requests are answered exactly once; chat runs stream events on
//! the owning connection before their response.

pub mod aborts;
pub mod broadcast;
pub mod chat;
pub mod methods;
pub mod server;
pub mod state;
pub mod ws;
