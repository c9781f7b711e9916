//! Message router: one inbound bridge frame in, zero or more reply frames out.
//!
//! Runs on the read loop of the connection that received the frame, so replies for one
//! connection leave in the order their messages arrived.

use crate::error::{Error, Result};
use crate::gateway::{strip_decoration, InboundFrame, OutboundFrame};
use crate::lifecycle::InstanceManager;
use crate::models::{Bot, Client, Message, OrganizationId, SenderRole};
use crate::nlu::NluRuntime;
use crate::registry::{ConnectionKey, ConnectionRegistry};
use crate::store::{ConversationStore, DirectoryStore};
use chrono::Utc;
use std::sync::Arc;

/// Stored in place of the text of an inbound audio message.
pub const AUDIO_PLACEHOLDER: &str = "[Audio recibido]";

/// Fixed reply to audio messages.
pub const AUDIO_FALLBACK_REPLY: &str =
    "🤖 Lo siento, por ahora solo puedo procesar mensajes de texto. Por favor, envíame tu mensaje escrito. 📝";

/// Sender recorded on bot replies.
pub const BOT_SENDER: &str = "bot";

/// Sender recorded on operator messages.
pub const OPERATOR_SENDER: &str = "operator";

const DEFAULT_BOT_NAME: &str = "Default Bot";

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Group chat; nothing stored, nothing sent.
    DroppedGroup,
    /// A human operator owns the chat; inbound stored, no reply.
    HumanTakeover,
    /// NLU replies: non-empty fragments handled and how many were queued on the connection.
    Replied { fragments: usize, delivered: usize },
    /// Audio message answered with the fixed fallback.
    AudioFallback { delivered: bool },
}

pub struct MessageRouter {
    directory: Arc<dyn DirectoryStore>,
    conversations: Arc<dyn ConversationStore>,
    instances: Arc<InstanceManager>,
    nlu: Arc<dyn NluRuntime>,
    registry: ConnectionRegistry,
    default_nlu_url: String,
}

struct Resolved {
    client: Client,
    bot: Bot,
    session: String,
    chat_id: String,
}

impl MessageRouter {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        conversations: Arc<dyn ConversationStore>,
        instances: Arc<InstanceManager>,
        nlu: Arc<dyn NluRuntime>,
        registry: ConnectionRegistry,
        default_nlu_url: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            conversations,
            instances,
            nlu,
            registry,
            default_nlu_url: default_nlu_url.into(),
        }
    }

    /// Route one frame received on the connection registered under `key`, scoped to `org`.
    ///
    /// Errors abort only this message; an inbound message already stored stays stored.
    pub async fn handle(
        &self,
        org: OrganizationId,
        key: &ConnectionKey,
        frame: InboundFrame,
    ) -> Result<RouteOutcome> {
        if frame.is_group() {
            log::debug!("dropping group message from {}", frame.phone);
            return Ok(RouteOutcome::DroppedGroup);
        }
        if frame.bot_number.trim().is_empty() || frame.phone.trim().is_empty() {
            return Err(Error::invalid("phone", "frame without phone or botNumber"));
        }

        let r = self.resolve(org, key, &frame).await?;
        let inbound_text = if frame.is_audio() {
            AUDIO_PLACEHOLDER.to_string()
        } else {
            frame.message.clone()
        };
        self.conversations
            .append_message(self.message(org, &r, SenderRole::User, &frame.phone, inbound_text))
            .await?;

        if self.human_has_chat(org, &r).await {
            log::debug!(
                "chat {} in session {} handled by an operator, not replying",
                r.chat_id,
                r.session
            );
            return Ok(RouteOutcome::HumanTakeover);
        }

        if frame.is_audio() {
            log::info!("audio message from {}, sending fallback reply", frame.phone);
            let delivered = self
                .persist_and_deliver(org, key, &r, AUDIO_FALLBACK_REPLY)
                .await;
            return Ok(RouteOutcome::AudioFallback { delivered });
        }

        let base_url = match self.instances.running_endpoint(org, &r.bot.number).await? {
            Some(url) => {
                log::debug!("routing {} to dedicated instance {}", r.bot.number, url);
                url
            }
            None => self.default_nlu_url.clone(),
        };
        let sender = format!("{}:{}", r.session, frame.phone);
        let fragments = self
            .nlu
            .send(&base_url, &sender, &frame.message)
            .await
            .map_err(Error::from)?;

        let mut handled = 0;
        let mut delivered = 0;
        for text in fragments.into_iter().filter_map(|f| f.text) {
            if text.is_empty() {
                continue;
            }
            handled += 1;
            if self.persist_and_deliver(org, key, &r, &text).await {
                delivered += 1;
            }
        }
        Ok(RouteOutcome::Replied {
            fragments: handled,
            delivered,
        })
    }

    /// Deliver a message typed by a human operator to `chat_id` over the connection `key`
    /// and store it in the conversation. `NotFound` when no bridge is connected under `key`.
    pub async fn send_operator_message(
        &self,
        org: OrganizationId,
        key: &ConnectionKey,
        chat_id: &str,
        text: &str,
    ) -> Result<Message> {
        self.registry.lookup(key).await?;
        let client = self
            .directory
            .get_or_create_client(org, strip_decoration(chat_id))
            .await?;
        let bot = self
            .directory
            .get_or_create_bot(org, strip_decoration(&key.number), DEFAULT_BOT_NAME)
            .await?;
        let r = Resolved {
            client,
            bot,
            session: key.session.clone(),
            chat_id: chat_id.to_string(),
        };
        let message = self.message(
            org,
            &r,
            SenderRole::Operator,
            OPERATOR_SENDER,
            text.to_string(),
        );
        if let Err(e) = self.conversations.append_message(message.clone()).await {
            log::warn!("storing operator message for {} failed: {}", chat_id, e);
        }
        let frame = OutboundFrame {
            to: r.chat_id.clone(),
            message: text.to_string(),
            session_id: r.session.clone(),
        };
        self.registry.send(key, &frame).await?;
        log::info!("operator message sent to {} via {}", chat_id, key);
        Ok(message)
    }

    async fn resolve(
        &self,
        org: OrganizationId,
        key: &ConnectionKey,
        frame: &InboundFrame,
    ) -> Result<Resolved> {
        let client = self
            .directory
            .get_or_create_client(org, strip_decoration(&frame.phone))
            .await?;
        let bot = self
            .directory
            .get_or_create_bot(org, strip_decoration(&frame.bot_number), DEFAULT_BOT_NAME)
            .await?;
        let session = frame
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&key.session)
            .to_string();
        Ok(Resolved {
            client,
            bot,
            session,
            chat_id: frame.phone.clone(),
        })
    }

    async fn human_has_chat(&self, org: OrganizationId, r: &Resolved) -> bool {
        match self
            .conversations
            .chat_mode(org, r.client.id, &r.session, &r.chat_id)
            .await
        {
            Ok(mode) => mode.is_some_and(|m| !m.bot_mode),
            Err(e) => {
                log::warn!("reading chat mode for {} failed, bot answers: {}", r.chat_id, e);
                false
            }
        }
    }

    fn message(
        &self,
        org: OrganizationId,
        r: &Resolved,
        role: SenderRole,
        sender: &str,
        text: String,
    ) -> Message {
        Message {
            organization_id: org,
            client_id: r.client.id,
            bot_id: r.bot.id,
            role,
            sender: sender.to_string(),
            chat_id: r.chat_id.clone(),
            text,
            session_id: r.session.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Store a reply then queue it on the connection. Storage failure is logged and delivery
    /// still happens. Returns whether the frame was queued.
    async fn persist_and_deliver(
        &self,
        org: OrganizationId,
        key: &ConnectionKey,
        r: &Resolved,
        text: &str,
    ) -> bool {
        let reply = self.message(org, r, SenderRole::Bot, BOT_SENDER, text.to_string());
        if let Err(e) = self.conversations.append_message(reply).await {
            log::warn!("storing reply for {} failed: {}", r.chat_id, e);
        }
        let frame = OutboundFrame {
            to: r.chat_id.clone(),
            message: text.to_string(),
            session_id: r.session.clone(),
        };
        match self.registry.send(key, &frame).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("reply to {} not delivered: {}", r.chat_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::lifecycle::tests::FakeRuntime;
    use crate::models::{ChatMode, InstanceStatus, NewBotInstance};
    use crate::nlu::{NluError, ReplyFragment};
    use crate::registry::ConnectionHandle;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const DEFAULT_URL: &str = "http://rasa:5005";

    #[derive(Default)]
    struct FakeNlu {
        calls: StdMutex<Vec<(String, String, String)>>,
        replies: Vec<Option<&'static str>>,
        fail: bool,
    }

    #[async_trait]
    impl NluRuntime for FakeNlu {
        async fn send(
            &self,
            base_url: &str,
            sender: &str,
            message: &str,
        ) -> std::result::Result<Vec<ReplyFragment>, NluError> {
            self.calls.lock().unwrap().push((
                base_url.to_string(),
                sender.to_string(),
                message.to_string(),
            ));
            if self.fail {
                return Err(NluError::Timeout(Duration::from_secs(10)));
            }
            Ok(self
                .replies
                .iter()
                .map(|t| ReplyFragment {
                    text: t.map(str::to_string),
                })
                .collect())
        }
    }

    struct Harness {
        router: MessageRouter,
        store: Arc<MemoryStore>,
        nlu: Arc<FakeNlu>,
        registry: ConnectionRegistry,
        key: ConnectionKey,
        rx: UnboundedReceiver<String>,
    }

    async fn harness(nlu: FakeNlu) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let nlu = Arc::new(nlu);
        let registry = ConnectionRegistry::new();
        let instances = Arc::new(InstanceManager::new(
            store.clone(),
            Arc::new(FakeRuntime::default()),
            RuntimeConfig::default(),
            "localhost",
        ));
        let key = ConnectionKey::new(Some("s1"), "+1999");
        let (handle, rx) = ConnectionHandle::channel();
        registry.register(key.clone(), handle).await.unwrap();
        let router = MessageRouter::new(
            store.clone(),
            store.clone(),
            instances,
            nlu.clone(),
            registry.clone(),
            DEFAULT_URL,
        );
        Harness {
            router,
            store,
            nlu,
            registry,
            key,
            rx,
        }
    }

    fn frame(phone: &str, message: &str) -> InboundFrame {
        InboundFrame {
            phone: phone.to_string(),
            message: message.to_string(),
            bot_number: "+1999".to_string(),
            session_id: Some("s1".to_string()),
            message_type: None,
        }
    }

    async fn messages(h: &Harness) -> Vec<Message> {
        let client = h.store.get_or_create_client(1, "+1555").await.unwrap();
        let bot = h.store.get_or_create_bot(1, "+1999", "x").await.unwrap();
        h.store.conversation(1, client.id, bot.id).await.unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<OutboundFrame> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn text_message_scenario_persists_calls_and_delivers() {
        let mut h = harness(FakeNlu {
            replies: vec![Some("¡Hola!"), Some(""), None, Some("¿En qué te ayudo?")],
            ..Default::default()
        })
        .await;
        let outcome = h
            .router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Replied {
                fragments: 2,
                delivered: 2
            }
        );

        let calls = h.nlu.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                DEFAULT_URL.to_string(),
                "s1:+1555@s.whatsapp.net".to_string(),
                "hola".to_string()
            )]
        );

        let stored = messages(&h).await;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].role, SenderRole::User);
        assert_eq!(stored[0].text, "hola");
        assert_eq!(stored[0].session_id, "s1");
        assert_eq!(stored[1].sender, BOT_SENDER);
        assert_eq!(stored[2].text, "¿En qué te ayudo?");

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            OutboundFrame {
                to: "+1555@s.whatsapp.net".into(),
                message: "¡Hola!".into(),
                session_id: "s1".into()
            }
        );
    }

    #[tokio::test]
    async fn group_message_stores_and_sends_nothing() {
        let mut h = harness(FakeNlu {
            replies: vec![Some("hi")],
            ..Default::default()
        })
        .await;
        let outcome = h
            .router
            .handle(1, &h.key, frame("120363@g.us", "hola"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::DroppedGroup);
        assert!(h.nlu.calls.lock().unwrap().is_empty());
        assert!(messages(&h).await.is_empty());
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn running_dedicated_instance_receives_the_message() {
        let h = harness(FakeNlu::default()).await;
        let inst = h
            .store
            .insert_instance(NewBotInstance {
                organization_id: 1,
                name: "rasa_acme".into(),
                port: 6003,
                status: InstanceStatus::Creating,
                based_on_bot_id: None,
                whatsapp_number: "+1999".into(),
            })
            .await
            .unwrap();
        h.store
            .update_instance(1, inst.id, InstanceStatus::Running, Some("c1"))
            .await
            .unwrap();

        h.router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();
        // Another tenant with no instance for the same number uses the shared runtime.
        h.router
            .handle(2, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();

        let calls = h.nlu.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "http://localhost:6003");
        assert_eq!(calls[1].0, DEFAULT_URL);
    }

    #[tokio::test]
    async fn stopped_instance_falls_back_to_default() {
        let h = harness(FakeNlu::default()).await;
        h.store
            .insert_instance(NewBotInstance {
                organization_id: 1,
                name: "rasa_acme".into(),
                port: 6003,
                status: InstanceStatus::Stopped,
                based_on_bot_id: None,
                whatsapp_number: "+1999".into(),
            })
            .await
            .unwrap();
        h.router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();
        assert_eq!(h.nlu.calls.lock().unwrap()[0].0, DEFAULT_URL);
    }

    #[tokio::test]
    async fn audio_skips_nlu_and_sends_fallback() {
        let mut h = harness(FakeNlu::default()).await;
        let mut f = frame("+1555@s.whatsapp.net", "");
        f.message_type = Some("audio".into());
        let outcome = h.router.handle(1, &h.key, f).await.unwrap();
        assert_eq!(outcome, RouteOutcome::AudioFallback { delivered: true });
        assert!(h.nlu.calls.lock().unwrap().is_empty());
        let stored = messages(&h).await;
        assert_eq!(stored[0].text, AUDIO_PLACEHOLDER);
        assert_eq!(stored[1].text, AUDIO_FALLBACK_REPLY);
        assert_eq!(drain(&mut h.rx)[0].message, AUDIO_FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn nlu_failure_keeps_inbound_and_sends_nothing() {
        let mut h = harness(FakeNlu {
            fail: true,
            ..Default::default()
        })
        .await;
        let err = h
            .router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        let stored = messages(&h).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, SenderRole::User);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn human_takeover_stores_inbound_without_reply() {
        let mut h = harness(FakeNlu {
            replies: vec![Some("hi")],
            ..Default::default()
        })
        .await;
        let client = h.store.get_or_create_client(1, "+1555").await.unwrap();
        let now = Utc::now();
        h.store
            .save_chat_mode(ChatMode {
                organization_id: 1,
                client_id: client.id,
                bot_id: None,
                session_id: "s1".into(),
                chat_id: "+1555@s.whatsapp.net".into(),
                bot_mode: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let outcome = h
            .router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::HumanTakeover);
        assert!(h.nlu.calls.lock().unwrap().is_empty());
        assert_eq!(messages(&h).await.len(), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn disconnected_connection_still_persists_every_fragment() {
        let h = harness(FakeNlu {
            replies: vec![Some("uno"), Some("dos")],
            ..Default::default()
        })
        .await;
        h.registry.unregister(&h.key).await;
        let outcome = h
            .router
            .handle(1, &h.key, frame("+1555@s.whatsapp.net", "hola"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Replied {
                fragments: 2,
                delivered: 0
            }
        );
        assert_eq!(messages(&h).await.len(), 3);
    }

    #[tokio::test]
    async fn missing_session_uses_connection_session() {
        let h = harness(FakeNlu::default()).await;
        let mut f = frame("+1555@s.whatsapp.net", "hola");
        f.session_id = None;
        h.router.handle(1, &h.key, f).await.unwrap();
        assert_eq!(
            h.nlu.calls.lock().unwrap()[0].1,
            "s1:+1555@s.whatsapp.net"
        );
    }

    #[tokio::test]
    async fn operator_message_is_stored_and_delivered() {
        let mut h = harness(FakeNlu::default()).await;
        let sent = h
            .router
            .send_operator_message(1, &h.key, "+1555@s.whatsapp.net", "Te atiendo yo")
            .await
            .unwrap();
        assert_eq!(sent.role, SenderRole::Operator);
        assert_eq!(
            drain(&mut h.rx),
            vec![OutboundFrame {
                to: "+1555@s.whatsapp.net".into(),
                message: "Te atiendo yo".into(),
                session_id: "s1".into(),
            }]
        );
        let stored = messages(&h).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender, OPERATOR_SENDER);
        assert!(h.nlu.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn operator_message_without_connection_is_not_found() {
        let h = harness(FakeNlu::default()).await;
        let key = ConnectionKey::new(Some("s2"), "+1999");
        let err = h
            .router
            .send_operator_message(1, &key, "+1555@s.whatsapp.net", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(messages(&h).await.is_empty());
    }
}
