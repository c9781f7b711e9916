//! Persisted records: organizations, clients, bots, bot instances and conversation documents.
//!
//! Every record carries an `organization_id`; stores filter on it so one tenant never reads
//! or writes another tenant's rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrganizationId = u64;
pub type ClientId = u64;
pub type BotId = u64;
pub type InstanceId = u64;

/// Tenant: top-level isolation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    /// URL-friendly unique name (e.g. "default").
    pub slug: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// End user, keyed by (organization, phone). Created lazily on the first inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Base bot, keyed by (organization, number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A provisioned runtime container serving one tenant's dedicated bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: InstanceId,
    pub organization_id: OrganizationId,
    /// Container name (unique).
    pub name: String,
    /// Empty until the container has been created.
    #[serde(default)]
    pub container_id: String,
    /// Host port of the NLU runtime; unique across all instances.
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(default)]
    pub based_on_bot_id: Option<BotId>,
    pub whatsapp_number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a new instance; id and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewBotInstance {
    pub organization_id: OrganizationId,
    pub name: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub based_on_bot_id: Option<BotId>,
    pub whatsapp_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Bot,
    /// A human operator answering in place of the bot.
    Operator,
}

/// One immutable conversation entry. Conversations are keyed by (client, bot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    pub bot_id: BotId,
    pub role: SenderRole,
    /// Raw sender address: the participant address for users, "bot" for replies.
    pub sender: String,
    /// Participant address of the chat this message belongs to.
    pub chat_id: String,
    pub text: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Generating,
    Completed,
    Failed,
}

/// Metadata about a document generated for a client (e.g. a filled-in form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub entities: Option<serde_json::Value>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether the bot answers a chat (`bot_mode == true`) or a human operator has taken over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMode {
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    pub session_id: String,
    pub chat_id: String,
    pub bot_mode: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatArchive {
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub chat_id: String,
    pub chat_name: String,
    pub is_group: bool,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_serializes_lowercase() {
        let s = serde_json::to_string(&InstanceStatus::Running).unwrap();
        assert_eq!(s, "\"running\"");
        assert_eq!(InstanceStatus::Creating.to_string(), "creating");
    }

    #[test]
    fn document_type_field_is_renamed() {
        let now = Utc::now();
        let doc = Document {
            id: "d1".into(),
            organization_id: 1,
            client_id: 2,
            bot_id: None,
            session_id: None,
            file_name: "manifest.pdf".into(),
            url: None,
            doc_type: "manifiesto".into(),
            metadata: None,
            entities: None,
            status: DocumentStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["type"], "manifiesto");
        assert_eq!(v["status"], "completed");
    }
}
