//! Gateway: HTTP + WebSocket surface.
//!
//! Single port serves the bridge WebSocket (`/ws`), the provisioning and conversation API
//! (`/api/v1/...`) and health/debug endpoints.

mod api;
mod protocol;
mod server;

pub use api::ApiError;
pub use protocol::{strip_decoration, ConnectParams, InboundFrame, OutboundFrame, GROUP_MARKER};
pub use server::{build_app, run_gateway, serve, GatewayState};
