//! Botrelay core library: connection registry, bot instance lifecycle, message routing,
//! persistence and the gateway that exposes them. Shared by the CLI and integration tests.

pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod nlu;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod store;
