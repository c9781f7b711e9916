//! Gateway HTTP + WebSocket server (single port).

use super::api::{self, ApiError};
use super::protocol::{ConnectParams, InboundFrame};
use crate::config::{self, Config};
use crate::error::Error;
use crate::lifecycle::InstanceManager;
use crate::models::{Organization, OrganizationId};
use crate::nlu::{NluClient, NluRuntime};
use crate::registry::{ConnectionHandle, ConnectionKey, ConnectionRegistry};
use crate::router::MessageRouter;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::store::{ConversationStore, DirectoryStore, MemoryStore};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const PROTOCOL_VERSION: u32 = 1;

/// How long a closing connection may take to flush queued replies.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the gateway: stores, registry, lifecycle manager and router.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn DirectoryStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub registry: ConnectionRegistry,
    pub instances: Arc<InstanceManager>,
    pub router: Arc<MessageRouter>,
    /// Fires once on shutdown; every connection task subscribes.
    pub event_tx: broadcast::Sender<()>,
}

impl GatewayState {
    /// Wire the components from explicit parts.
    pub fn from_parts<S>(
        config: Config,
        store: Arc<S>,
        runtime: Arc<dyn ContainerRuntime>,
        nlu: Arc<dyn NluRuntime>,
    ) -> Self
    where
        S: DirectoryStore + ConversationStore + 'static,
    {
        let registry = ConnectionRegistry::new();
        let instances = Arc::new(InstanceManager::new(
            store.clone(),
            runtime,
            config.runtime.clone(),
            config.nlu.instance_host.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            store.clone(),
            instances.clone(),
            nlu,
            registry.clone(),
            config.nlu.default_url.clone(),
        ));
        let (event_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            directory: store.clone(),
            conversations: store,
            registry,
            instances,
            router,
            event_tx,
        }
    }

    /// Production wiring: JSON-backed store, container CLI, HTTP NLU client.
    pub async fn from_config(config: Config, config_path: &Path) -> Result<Self> {
        let store = match config::resolve_data_path(&config, config_path) {
            Some(path) => {
                log::info!("data file: {}", path.display());
                MemoryStore::load(&path).await?
            }
            None => {
                log::warn!("no store.dataPath configured, data is kept in memory only");
                MemoryStore::new()
            }
        };
        let runtime = Arc::new(DockerCli::new(
            config.runtime.cli.clone(),
            config.runtime.command_timeout(),
        ));
        let nlu = Arc::new(NluClient::new(config.nlu.timeout()));
        Ok(Self::from_parts(config, Arc::new(store), runtime, nlu))
    }

    /// Active organization by slug, or the configured default when `slug` is absent.
    pub async fn organization(&self, slug: Option<&str>) -> crate::error::Result<Organization> {
        let slug = slug
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.tenancy.default_organization);
        match self.directory.organization_by_slug(slug).await? {
            Some(org) if org.is_active => Ok(org),
            Some(_) => Err(Error::NotFound(format!("organization {} is inactive", slug))),
            None => Err(Error::NotFound(format!("organization {}", slug))),
        }
    }

    async fn ensure_default_organization(&self) -> crate::error::Result<Organization> {
        let t = &self.config.tenancy;
        self.directory
            .ensure_organization(&t.default_organization, &t.default_organization_name)
            .await
    }
}

/// All routes on one router.
pub fn build_app(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .route("/debug/bots", get(debug_bots))
        .route("/api/v1/organizations", post(api::create_organization))
        .route(
            "/api/v1/bot-instances",
            get(api::list_instances).post(api::create_instance),
        )
        .route(
            "/api/v1/bot-instances/:id",
            get(api::get_instance).delete(api::delete_instance),
        )
        .route("/api/v1/documents", post(api::save_document))
        .route("/api/v1/clients/:client_id/documents", get(api::client_documents))
        .route("/api/v1/clients/:client_id/archives", get(api::client_archives))
        .route("/api/v1/chats/mode", post(api::update_chat_mode))
        .route("/api/v1/chats/archive", post(api::archive_chat))
        .route("/api/v1/chats/:chat_id/send", post(api::send_chat_message))
        .route("/api/v1/conversations/:client_id", get(api::conversation))
        .route(
            "/api/v1/conversations/:client_id/export",
            get(api::export_conversation),
        )
        .with_state(state)
}

/// Run the gateway with production wiring until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config, config_path: std::path::PathBuf) -> Result<()> {
    let state = GatewayState::from_config(config, &config_path).await?;
    serve(state).await
}

/// Serve an already-wired state on `gateway.bind:gateway.port`.
pub async fn serve(state: GatewayState) -> Result<()> {
    let org = state
        .ensure_default_organization()
        .await
        .context("creating default organization")?;
    log::info!("default organization: {} (id {})", org.slug, org.id);

    let bind_addr = format!(
        "{}:{}",
        state.config.gateway.bind.trim(),
        state.config.gateway.port
    );
    let event_tx = state.event_tx.clone();
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM, after telling every connection task to close.
async fn shutdown_signal(event_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing bridge connections");
    let _ = event_tx.send(());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "connections": state.registry.list_keys().await.len(),
    }))
}

/// GET /debug/bots lists the registered connection keys.
async fn debug_bots(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let keys: Vec<String> = state
        .registry
        .list_keys()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(json!({ "total": keys.len(), "connections": keys }))
}

/// GET /ws?phone=&sessionId=&organization= registers the connection, then upgrades.
/// A key that is already connected is refused with 409 before the upgrade.
async fn ws_handler(
    State(state): State<GatewayState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let number = params.phone.trim();
    if number.is_empty() {
        return ApiError(Error::invalid("phone", "query parameter is required")).into_response();
    }
    let org = match state.organization(params.organization.as_deref()).await {
        Ok(org) => org,
        Err(e) => return ApiError(e).into_response(),
    };
    let key = ConnectionKey::new(params.session_id.as_deref(), number);
    let (handle, rx) = ConnectionHandle::channel();
    let id = handle.id();
    if let Err(e) = state.registry.register(key.clone(), handle).await {
        log::warn!("refusing bridge connection: {}", e);
        return ApiError(e.into()).into_response();
    }

    let registry = state.registry.clone();
    let failed_key = key.clone();
    ws.on_failed_upgrade(move |e| {
        log::warn!("websocket upgrade for {} failed: {}", failed_key, e);
        tokio::spawn(async move {
            registry.unregister_if_owner(&failed_key, id).await;
        });
    })
    .on_upgrade(move |socket| handle_socket(socket, state, org.id, key, id, rx))
}

/// One read loop per connection. Frames are routed inline, so replies keep arrival order; a
/// writer task drains the outbound queue. Any decode error or close unregisters the key.
async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    org: OrganizationId,
    key: ConnectionKey,
    id: Uuid,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut shutdown_rx = state.event_tx.subscribe();

    let writer_key = key.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                log::debug!("write to {} failed: {}", writer_key, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::debug!("read from {} failed: {}", key, e);
                        break;
                    }
                };
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        log::warn!("undecodable frame on {}, closing: {}", key, e);
                        break;
                    }
                };
                match state.router.handle(org, &key, frame).await {
                    Ok(outcome) => log::debug!("{}: {:?}", key, outcome),
                    Err(e) => log::warn!("routing message on {} failed: {}", key, e),
                }
            }
        }
    }

    state.registry.unregister_if_owner(&key, id).await;
    // The registry held the last sender; the writer flushes what is queued and closes.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        log::debug!("writer for {} did not drain in time", key);
    }
}
