//! Provisioning and conversation HTTP handlers under `/api/v1`.
//!
//! Every handler resolves the tenant from `?organization=<slug>` (default organization when
//! absent) and reports failures as `{ "error", "kind", "field"? }` with a status per error kind.

use super::server::GatewayState;
use crate::error::Error;
use crate::lifecycle::ProvisionRequest;
use crate::models::{BotId, ChatArchive, ChatMode, ClientId, Document, DocumentStatus, InstanceId};
use crate::registry::ConnectionKey;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

/// Error wrapper mapping the crate taxonomy to HTTP.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        ApiError(Error::invalid("body", r.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(r: PathRejection) -> Self {
        ApiError(Error::invalid("id", r.body_text()))
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::Persistence(_) | Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Inconsistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::warn!("request failed: {}", self.0);
        }
        let mut body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        if let Error::InvalidRequest { field, .. } = &self.0 {
            body["field"] = json!(field);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct OrgQuery {
    pub organization: Option<String>,
}

fn path_id(p: Result<Path<u64>, PathRejection>) -> ApiResult<u64> {
    Ok(p?.0)
}

fn required<'a>(field: &'static str, value: &'a str) -> ApiResult<&'a str> {
    let v = value.trim();
    if v.is_empty() {
        return Err(Error::invalid(field, "is required").into());
    }
    Ok(v)
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// POST /api/v1/organizations: 201 when created, 200 when the slug already exists.
pub async fn create_organization(
    State(state): State<GatewayState>,
    body: Result<Json<CreateOrganizationBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(body) = body?;
    let slug = required("slug", &body.slug)?;
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::invalid("slug", "may contain only a-z, 0-9 and '-'").into());
    }
    let name = required("name", &body.name)?;
    if let Some(org) = state.directory.organization_by_slug(slug).await? {
        return Ok((StatusCode::OK, Json(json!(org))));
    }
    let org = state.directory.ensure_organization(slug, name).await?;
    Ok((StatusCode::CREATED, Json(json!(org))))
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub based_on_bot_id: Option<BotId>,
    #[serde(default)]
    pub whatsapp_number: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// POST /api/v1/bot-instances
pub async fn create_instance(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    body: Result<Json<CreateInstanceBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(body) = body?;
    let org = state.organization(q.organization.as_deref()).await?;
    let instance = state
        .instances
        .provision(ProvisionRequest {
            organization_id: org.id,
            name: body.name,
            based_on_bot_id: body.based_on_bot_id,
            whatsapp_number: body.whatsapp_number,
            port: body.port,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!(instance))))
}

/// GET /api/v1/bot-instances
pub async fn list_instances(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let org = state.organization(q.organization.as_deref()).await?;
    let instances = state.instances.list(org.id).await?;
    Ok(Json(json!(instances)))
}

/// GET /api/v1/bot-instances/:id
pub async fn get_instance(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    id: Result<Path<InstanceId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = path_id(id)?;
    let org = state.organization(q.organization.as_deref()).await?;
    let instance = state.instances.get(org.id, id).await?;
    Ok(Json(json!(instance)))
}

/// DELETE /api/v1/bot-instances/:id
pub async fn delete_instance(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    id: Result<Path<InstanceId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = path_id(id)?;
    let org = state.organization(q.organization.as_deref()).await?;
    state.instances.deprovision(org.id, id).await?;
    Ok(Json(json!({ "message": "instance deleted", "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct SaveDocumentBody {
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub entities: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<DocumentStatus>,
}

/// POST /api/v1/documents
pub async fn save_document(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    body: Result<Json<SaveDocumentBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(body) = body?;
    let client_id = body
        .client_id
        .ok_or_else(|| Error::invalid("client_id", "is required"))?;
    let file_name = required("file_name", &body.file_name)?.to_string();
    let doc_type = required("type", &body.doc_type)?.to_string();
    let org = state.organization(q.organization.as_deref()).await?;
    let now = Utc::now();
    let document = state
        .conversations
        .save_document(Document {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: org.id,
            client_id,
            bot_id: body.bot_id,
            session_id: body.session_id,
            file_name,
            url: body.url,
            doc_type,
            metadata: body.metadata,
            entities: body.entities,
            status: body.status.unwrap_or(DocumentStatus::Completed),
            created_at: now,
            updated_at: now,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!(document))))
}

/// GET /api/v1/clients/:client_id/documents
pub async fn client_documents(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    id: Result<Path<ClientId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let client_id = path_id(id)?;
    let org = state.organization(q.organization.as_deref()).await?;
    let documents = state
        .conversations
        .documents_for_client(org.id, client_id)
        .await?;
    Ok(Json(json!({ "total": documents.len(), "documents": documents })))
}

#[derive(Debug, Deserialize)]
pub struct ChatModeBody {
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub chat_id: String,
    pub bot_mode: Option<bool>,
}

/// POST /api/v1/chats/mode
pub async fn update_chat_mode(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    body: Result<Json<ChatModeBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(body) = body?;
    let client_id = body
        .client_id
        .ok_or_else(|| Error::invalid("client_id", "is required"))?;
    let session_id = required("session_id", &body.session_id)?.to_string();
    let chat_id = required("chat_id", &body.chat_id)?.to_string();
    let bot_mode = body
        .bot_mode
        .ok_or_else(|| Error::invalid("bot_mode", "is required and must be a boolean"))?;
    let org = state.organization(q.organization.as_deref()).await?;
    let now = Utc::now();
    let mode = state
        .conversations
        .save_chat_mode(ChatMode {
            organization_id: org.id,
            client_id,
            bot_id: body.bot_id,
            session_id,
            chat_id,
            bot_mode,
            created_at: now,
            updated_at: now,
        })
        .await?;
    log::info!(
        "chat {} in session {} now {}",
        mode.chat_id,
        mode.session_id,
        if mode.bot_mode { "bot-handled" } else { "operator-handled" }
    );
    Ok(Json(json!(mode)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSendQuery {
    pub organization: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub bot_number: String,
}

#[derive(Debug, Deserialize)]
pub struct OperatorSendBody {
    #[serde(default)]
    pub message: String,
}

/// POST /api/v1/chats/:chat_id/send?sessionId=&botNumber=
///
/// Operator reply: delivered through the bridge connected as `sessionId:botNumber`.
pub async fn send_chat_message(
    State(state): State<GatewayState>,
    Query(q): Query<OperatorSendQuery>,
    chat_id: Result<Path<String>, PathRejection>,
    body: Result<Json<OperatorSendBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Path(chat_id) = chat_id.map_err(|r| Error::invalid("chat_id", r.body_text()))?;
    let Json(body) = body?;
    let chat_id = required("chat_id", &chat_id)?;
    let bot_number = required("botNumber", &q.bot_number)?;
    if body.message.trim().is_empty() {
        return Err(Error::invalid("message", "is required").into());
    }
    let org = state.organization(q.organization.as_deref()).await?;
    let key = ConnectionKey::new(q.session_id.as_deref(), bot_number);
    let message = state
        .router
        .send_operator_message(org.id, &key, chat_id, &body.message)
        .await?;
    Ok(Json(json!(message)))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveBody {
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub bot_id: Option<BotId>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub chat_name: String,
    #[serde(default)]
    pub is_group: bool,
}

/// POST /api/v1/chats/archive
pub async fn archive_chat(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    body: Result<Json<ArchiveBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(body) = body?;
    let client_id = body
        .client_id
        .ok_or_else(|| Error::invalid("client_id", "is required"))?;
    let chat_id = required("chat_id", &body.chat_id)?.to_string();
    let chat_name = required("chat_name", &body.chat_name)?.to_string();
    let org = state.organization(q.organization.as_deref()).await?;
    let archive = ChatArchive {
        organization_id: org.id,
        client_id,
        bot_id: body.bot_id,
        session_id: body.session_id,
        chat_id,
        chat_name,
        is_group: body.is_group,
        archived_at: Utc::now(),
    };
    state.conversations.archive_chat(archive.clone()).await?;
    Ok((StatusCode::CREATED, Json(json!(archive))))
}

/// GET /api/v1/clients/:client_id/archives
pub async fn client_archives(
    State(state): State<GatewayState>,
    Query(q): Query<OrgQuery>,
    id: Result<Path<ClientId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let client_id = path_id(id)?;
    let org = state.organization(q.organization.as_deref()).await?;
    let archives = state.conversations.archived_chats(org.id, client_id).await?;
    Ok(Json(json!({ "total": archives.len(), "archives": archives })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub organization: Option<String>,
    pub bot_id: Option<BotId>,
}

/// GET /api/v1/conversations/:client_id?botId=
pub async fn conversation(
    State(state): State<GatewayState>,
    Query(q): Query<ConversationQuery>,
    id: Result<Path<ClientId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let client_id = path_id(id)?;
    let bot_id = q
        .bot_id
        .ok_or_else(|| Error::invalid("botId", "is required"))?;
    let org = state.organization(q.organization.as_deref()).await?;
    let messages = state
        .conversations
        .conversation(org.id, client_id, bot_id)
        .await?;
    Ok(Json(json!({
        "client_id": client_id,
        "bot_id": bot_id,
        "total": messages.len(),
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub organization: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub chat_id: String,
}

/// GET /api/v1/conversations/:client_id/export?sessionId=&chatId=
pub async fn export_conversation(
    State(state): State<GatewayState>,
    Query(q): Query<ExportQuery>,
    id: Result<Path<ClientId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let client_id = path_id(id)?;
    let session_id = required("sessionId", &q.session_id)?;
    let chat_id = required("chatId", &q.chat_id)?;
    let org = state.organization(q.organization.as_deref()).await?;
    let messages = state
        .conversations
        .export_conversation(org.id, client_id, session_id, chat_id)
        .await?;
    Ok(Json(json!({
        "client_id": client_id,
        "session_id": session_id,
        "chat_id": chat_id,
        "total": messages.len(),
        "messages": messages,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn invalid_request_body_names_field() {
        let res = ApiError(Error::invalid("name", "must not be empty")).into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["field"], "name");
        assert_eq!(v["kind"], "invalid_request");
    }

    #[test]
    fn status_per_kind() {
        assert_eq!(status_for(&Error::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&Error::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&Error::Upstream("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&Error::Inconsistency("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
