//! Persistence gateways.
//!
//! [`DirectoryStore`] is the relational side (organizations, clients, bots, bot instances);
//! [`ConversationStore`] is the append-style document side (messages, documents, chat modes,
//! archives). Both take the organization id on every call that reads or writes tenant data.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::models::{
    Bot, BotId, BotInstance, ChatArchive, ChatMode, Client, ClientId, Document, InstanceId,
    InstanceStatus, Message, NewBotInstance, Organization, OrganizationId,
};
use async_trait::async_trait;

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Return the organization with this slug, creating it (active) when absent.
    async fn ensure_organization(&self, slug: &str, name: &str) -> Result<Organization>;

    async fn organization_by_slug(&self, slug: &str) -> Result<Option<Organization>>;

    async fn get_or_create_client(&self, org: OrganizationId, phone: &str) -> Result<Client>;

    async fn get_or_create_bot(&self, org: OrganizationId, number: &str, name: &str) -> Result<Bot>;

    /// Insert a new instance. Fails with `Conflict` when the port or name is already taken, or
    /// when another live (creating/running) instance serves the same (organization, number).
    async fn insert_instance(&self, new: NewBotInstance) -> Result<BotInstance>;

    /// Update status and, when given, the container id. `NotFound` when absent.
    async fn update_instance(
        &self,
        org: OrganizationId,
        id: InstanceId,
        status: InstanceStatus,
        container_id: Option<&str>,
    ) -> Result<BotInstance>;

    async fn get_instance(&self, org: OrganizationId, id: InstanceId) -> Result<Option<BotInstance>>;

    async fn list_instances(&self, org: OrganizationId) -> Result<Vec<BotInstance>>;

    /// The running instance serving `number` for this organization, if any.
    async fn running_instance(
        &self,
        org: OrganizationId,
        number: &str,
    ) -> Result<Option<BotInstance>>;

    /// Delete an instance record. `NotFound` when absent.
    async fn delete_instance(&self, org: OrganizationId, id: InstanceId) -> Result<()>;

    /// Host ports assigned to instances of every organization.
    async fn assigned_ports(&self) -> Result<Vec<u16>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(&self, message: Message) -> Result<()>;

    /// All messages of the (client, bot) conversation in append order.
    async fn conversation(
        &self,
        org: OrganizationId,
        client: ClientId,
        bot: BotId,
    ) -> Result<Vec<Message>>;

    /// Messages of one chat within a session; `chat_id` matches case-insensitively as a substring.
    async fn export_conversation(
        &self,
        org: OrganizationId,
        client: ClientId,
        session_id: &str,
        chat_id: &str,
    ) -> Result<Vec<Message>>;

    async fn save_document(&self, document: Document) -> Result<Document>;

    async fn documents_for_client(&self, org: OrganizationId, client: ClientId)
        -> Result<Vec<Document>>;

    /// Upsert by (organization, client, session, chat); keeps the original `created_at`.
    async fn save_chat_mode(&self, mode: ChatMode) -> Result<ChatMode>;

    async fn chat_mode(
        &self,
        org: OrganizationId,
        client: ClientId,
        session_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatMode>>;

    async fn archive_chat(&self, archive: ChatArchive) -> Result<()>;

    async fn archived_chats(&self, org: OrganizationId, client: ClientId)
        -> Result<Vec<ChatArchive>>;
}
