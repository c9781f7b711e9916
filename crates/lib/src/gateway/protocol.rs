//! Bridge WebSocket wire types.

use serde::{Deserialize, Serialize};

/// Address suffix of group chats.
pub const GROUP_MARKER: &str = "@g.us";

/// Query string of `GET /ws`: `?phone=<bot number>&sessionId=<id>&organization=<slug>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub phone: String,
    pub session_id: Option<String>,
    /// Organization slug; the configured default organization when absent.
    pub organization: Option<String>,
}

/// Frame sent by the bridge agent for every message it receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Participant address, e.g. `+1555@s.whatsapp.net`.
    pub phone: String,
    #[serde(default)]
    pub message: String,
    pub bot_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// `text` (default), `audio`, `image`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

impl InboundFrame {
    pub fn is_group(&self) -> bool {
        self.phone.contains(GROUP_MARKER)
    }

    pub fn is_audio(&self) -> bool {
        self.message_type.as_deref() == Some("audio")
    }
}

/// Reply frame queued to the bridge agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub to: String,
    pub message: String,
    pub session_id: String,
}

/// Everything before the first `@` (`+1555@s.whatsapp.net` → `+1555`).
pub fn strip_decoration(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}
