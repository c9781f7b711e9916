//! In-memory store implementing both persistence traits; optionally backed by files.
//!
//! With a path, the directory tables live in a JSON snapshot that is rewritten after every
//! mutation while the write lock is held. A mutation is applied to a copy and only becomes
//! visible once the snapshot write succeeded. Conversation messages go to an append-only
//! JSON-lines log next to the snapshot (`data.json` -> `data.messages.jsonl`).

use super::{ConversationStore, DirectoryStore};
use crate::error::{Error, Result};
use crate::models::{
    Bot, BotId, BotInstance, ChatArchive, ChatMode, Client, ClientId, Document, InstanceId,
    InstanceStatus, Message, NewBotInstance, Organization, OrganizationId,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NextIds {
    organization: u64,
    client: u64,
    bot: u64,
    instance: u64,
}

impl NextIds {
    fn take(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    ids: NextIds,
    #[serde(default)]
    organizations: Vec<Organization>,
    #[serde(default)]
    clients: Vec<Client>,
    #[serde(default)]
    bots: Vec<Bot>,
    #[serde(default)]
    instances: Vec<BotInstance>,
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    chat_modes: Vec<ChatMode>,
    #[serde(default)]
    archives: Vec<ChatArchive>,
}

fn is_live(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Creating | InstanceStatus::Running)
}

/// Message log kept next to the snapshot at `path`.
fn message_log_path(path: &Path) -> PathBuf {
    path.with_extension("messages.jsonl")
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", parent.display(), e)))?;
    }
    Ok(())
}

pub struct MemoryStore {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
    messages: RwLock<Vec<Message>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store; nothing is written to disk.
    pub fn new() -> Self {
        Self {
            path: None,
            tables: RwLock::new(Tables::default()),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Load from `path`; a missing file starts empty, an unreadable one is an error.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing data file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("data file not found, starting empty: {}", path.display());
                Tables::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading data file {}", path.display()))
            }
        };
        let messages = Self::load_messages(&message_log_path(&path)).await?;
        Ok(Self {
            path: Some(path),
            tables: RwLock::new(tables),
            messages: RwLock::new(messages),
        })
    }

    /// Read the message log. A line that does not decode (e.g. cut short by a failed append)
    /// is skipped.
    async fn load_messages(log_path: &Path) -> anyhow::Result<Vec<Message>> {
        use anyhow::Context;
        let raw = match tokio::fs::read_to_string(log_path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading message log {}", log_path.display()))
            }
        };
        let mut messages = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(m) => messages.push(m),
                Err(e) => log::warn!(
                    "skipping line {} of {}: {}",
                    n + 1,
                    log_path.display(),
                    e
                ),
            }
        }
        Ok(messages)
    }

    async fn save(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json =
            serde_json::to_string_pretty(tables).map_err(|e| Error::Persistence(e.to_string()))?;
        ensure_parent(path).await?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))
    }

    /// Apply `f` under the write lock. With a path, `f` runs on a copy that replaces the
    /// tables only after the snapshot was written; a failed write changes nothing.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write().await;
        if self.path.is_none() {
            return f(&mut tables);
        }
        let mut next = tables.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *tables = next;
        Ok(out)
    }

    async fn append_to_log(&self, message: &Message) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let log_path = message_log_path(path);
        let mut line =
            serde_json::to_string(message).map_err(|e| Error::Persistence(e.to_string()))?;
        line.push('\n');
        ensure_parent(&log_path).await?;
        let persist = |e: std::io::Error| Error::Persistence(format!("{}: {}", log_path.display(), e));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(persist)?;
        file.write_all(line.as_bytes()).await.map_err(persist)?;
        file.flush().await.map_err(persist)
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn ensure_organization(&self, slug: &str, name: &str) -> Result<Organization> {
        if let Some(org) = self.organization_by_slug(slug).await? {
            return Ok(org);
        }
        self.mutate(|t| {
            if let Some(org) = t.organizations.iter().find(|o| o.slug == slug) {
                return Ok(org.clone());
            }
            let now = Utc::now();
            let org = Organization {
                id: NextIds::take(&mut t.ids.organization),
                name: name.to_string(),
                slug: slug.to_string(),
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            t.organizations.push(org.clone());
            log::info!("created organization {} (id {})", org.slug, org.id);
            Ok(org)
        })
        .await
    }

    async fn organization_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
        let t = self.tables.read().await;
        Ok(t.organizations.iter().find(|o| o.slug == slug).cloned())
    }

    async fn get_or_create_client(&self, org: OrganizationId, phone: &str) -> Result<Client> {
        {
            let t = self.tables.read().await;
            if let Some(c) = t
                .clients
                .iter()
                .find(|c| c.organization_id == org && c.phone == phone)
            {
                return Ok(c.clone());
            }
        }
        self.mutate(|t| {
            if let Some(c) = t
                .clients
                .iter()
                .find(|c| c.organization_id == org && c.phone == phone)
            {
                return Ok(c.clone());
            }
            let now = Utc::now();
            let client = Client {
                id: NextIds::take(&mut t.ids.client),
                organization_id: org,
                name: String::new(),
                email: None,
                phone: phone.to_string(),
                created_at: now,
                updated_at: now,
            };
            t.clients.push(client.clone());
            log::debug!("created client {} for organization {}", phone, org);
            Ok(client)
        })
        .await
    }

    async fn get_or_create_bot(&self, org: OrganizationId, number: &str, name: &str) -> Result<Bot> {
        {
            let t = self.tables.read().await;
            if let Some(b) = t
                .bots
                .iter()
                .find(|b| b.organization_id == org && b.number == number)
            {
                return Ok(b.clone());
            }
        }
        self.mutate(|t| {
            if let Some(b) = t
                .bots
                .iter()
                .find(|b| b.organization_id == org && b.number == number)
            {
                return Ok(b.clone());
            }
            let now = Utc::now();
            let bot = Bot {
                id: NextIds::take(&mut t.ids.bot),
                organization_id: org,
                name: name.to_string(),
                number: number.to_string(),
                created_at: now,
                updated_at: now,
            };
            t.bots.push(bot.clone());
            log::debug!("created bot {} for organization {}", number, org);
            Ok(bot)
        })
        .await
    }

    async fn insert_instance(&self, new: NewBotInstance) -> Result<BotInstance> {
        self.mutate(|t| {
            if t.instances.iter().any(|i| i.port == new.port) {
                return Err(Error::Conflict(format!("port {} already assigned", new.port)));
            }
            if t.instances.iter().any(|i| i.name == new.name) {
                return Err(Error::Conflict(format!("instance name {} already exists", new.name)));
            }
            if is_live(new.status)
                && t.instances.iter().any(|i| {
                    i.organization_id == new.organization_id
                        && i.whatsapp_number == new.whatsapp_number
                        && is_live(i.status)
                })
            {
                return Err(Error::Conflict(format!(
                    "number {} already has a live instance",
                    new.whatsapp_number
                )));
            }
            let now = Utc::now();
            let instance = BotInstance {
                id: NextIds::take(&mut t.ids.instance),
                organization_id: new.organization_id,
                name: new.name,
                container_id: String::new(),
                port: new.port,
                status: new.status,
                based_on_bot_id: new.based_on_bot_id,
                whatsapp_number: new.whatsapp_number,
                created_at: now,
                updated_at: now,
            };
            t.instances.push(instance.clone());
            Ok(instance)
        })
        .await
    }

    async fn update_instance(
        &self,
        org: OrganizationId,
        id: InstanceId,
        status: InstanceStatus,
        container_id: Option<&str>,
    ) -> Result<BotInstance> {
        self.mutate(|t| {
            let instance = t
                .instances
                .iter_mut()
                .find(|i| i.organization_id == org && i.id == id)
                .ok_or_else(|| Error::NotFound(format!("instance {}", id)))?;
            instance.status = status;
            if let Some(cid) = container_id {
                instance.container_id = cid.to_string();
            }
            instance.updated_at = Utc::now();
            Ok(instance.clone())
        })
        .await
    }

    async fn get_instance(&self, org: OrganizationId, id: InstanceId) -> Result<Option<BotInstance>> {
        let t = self.tables.read().await;
        Ok(t
            .instances
            .iter()
            .find(|i| i.organization_id == org && i.id == id)
            .cloned())
    }

    async fn list_instances(&self, org: OrganizationId) -> Result<Vec<BotInstance>> {
        let t = self.tables.read().await;
        Ok(t
            .instances
            .iter()
            .filter(|i| i.organization_id == org)
            .cloned()
            .collect())
    }

    async fn running_instance(
        &self,
        org: OrganizationId,
        number: &str,
    ) -> Result<Option<BotInstance>> {
        let t = self.tables.read().await;
        Ok(t
            .instances
            .iter()
            .find(|i| {
                i.organization_id == org
                    && i.whatsapp_number == number
                    && i.status == InstanceStatus::Running
            })
            .cloned())
    }

    async fn delete_instance(&self, org: OrganizationId, id: InstanceId) -> Result<()> {
        self.mutate(|t| {
            let before = t.instances.len();
            t.instances
                .retain(|i| !(i.organization_id == org && i.id == id));
            if t.instances.len() == before {
                return Err(Error::NotFound(format!("instance {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn assigned_ports(&self) -> Result<Vec<u16>> {
        let t = self.tables.read().await;
        Ok(t.instances.iter().map(|i| i.port).collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn append_message(&self, message: Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        self.append_to_log(&message).await?;
        messages.push(message);
        Ok(())
    }

    async fn conversation(
        &self,
        org: OrganizationId,
        client: ClientId,
        bot: BotId,
    ) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.organization_id == org && m.client_id == client && m.bot_id == bot)
            .cloned()
            .collect())
    }

    async fn export_conversation(
        &self,
        org: OrganizationId,
        client: ClientId,
        session_id: &str,
        chat_id: &str,
    ) -> Result<Vec<Message>> {
        let needle = chat_id.to_lowercase();
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| {
                m.organization_id == org
                    && m.client_id == client
                    && m.session_id == session_id
                    && m.chat_id.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect())
    }

    async fn save_document(&self, document: Document) -> Result<Document> {
        self.mutate(|t| {
            t.documents.push(document.clone());
            Ok(document)
        })
        .await
    }

    async fn documents_for_client(
        &self,
        org: OrganizationId,
        client: ClientId,
    ) -> Result<Vec<Document>> {
        let t = self.tables.read().await;
        Ok(t
            .documents
            .iter()
            .filter(|d| d.organization_id == org && d.client_id == client)
            .cloned()
            .collect())
    }

    async fn save_chat_mode(&self, mode: ChatMode) -> Result<ChatMode> {
        self.mutate(|t| {
            if let Some(existing) = t.chat_modes.iter_mut().find(|m| {
                m.organization_id == mode.organization_id
                    && m.client_id == mode.client_id
                    && m.session_id == mode.session_id
                    && m.chat_id == mode.chat_id
            }) {
                existing.bot_mode = mode.bot_mode;
                existing.updated_at = mode.updated_at;
                return Ok(existing.clone());
            }
            t.chat_modes.push(mode.clone());
            Ok(mode)
        })
        .await
    }

    async fn chat_mode(
        &self,
        org: OrganizationId,
        client: ClientId,
        session_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatMode>> {
        let t = self.tables.read().await;
        Ok(t
            .chat_modes
            .iter()
            .find(|m| {
                m.organization_id == org
                    && m.client_id == client
                    && m.session_id == session_id
                    && m.chat_id == chat_id
            })
            .cloned())
    }

    async fn archive_chat(&self, archive: ChatArchive) -> Result<()> {
        self.mutate(|t| {
            t.archives.push(archive);
            Ok(())
        })
        .await
    }

    async fn archived_chats(
        &self,
        org: OrganizationId,
        client: ClientId,
    ) -> Result<Vec<ChatArchive>> {
        let t = self.tables.read().await;
        Ok(t
            .archives
            .iter()
            .filter(|a| a.organization_id == org && a.client_id == client)
            .cloned()
            .collect())
    }
}
