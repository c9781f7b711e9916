//! Integration test: a fake bridge agent connects over WebSocket, sends inbound frames and
//! receives replies produced by a fake NLU runtime.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn ws_url(base: &str, query: &str) -> String {
    format!("{}/ws?{}", base.replacen("http://", "ws://", 1), query)
}

async fn next_json(socket: &mut Socket) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("reply within 5s")
            .expect("stream open")
            .expect("ws message");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("reply is JSON");
        }
    }
}

async fn connection_count(base: &str) -> u64 {
    let json: serde_json::Value = reqwest::get(format!("{}/debug/bots", base))
        .await
        .expect("GET /debug/bots")
        .json()
        .await
        .expect("parse JSON");
    json["total"].as_u64().unwrap_or_default()
}

#[tokio::test]
async fn inbound_text_is_answered_on_the_same_connection() {
    let (nlu_url, seen) = common::start_fake_nlu().await;
    let mut config = common::test_config();
    config.nlu.default_url = nlu_url;
    let base = common::start_gateway(config).await;

    let (mut socket, _) = connect_async(ws_url(&base, "phone=%2B1999&sessionId=s1"))
        .await
        .expect("connect");

    // Group traffic is dropped; the first reply must belong to the 1:1 message.
    let group = json!({"phone": "120363@g.us", "message": "spam", "botNumber": "+1999", "sessionId": "s1"});
    socket
        .send(Message::Text(group.to_string()))
        .await
        .expect("send group frame");
    let inbound = json!({
        "phone": "+1555@s.whatsapp.net",
        "message": "hola",
        "botNumber": "+1999",
        "sessionId": "s1"
    });
    socket
        .send(Message::Text(inbound.to_string()))
        .await
        .expect("send frame");

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["to"], "+1555@s.whatsapp.net");
    assert_eq!(reply["message"], "echo: hola");
    assert_eq!(reply["sessionId"], "s1");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![("s1:+1555@s.whatsapp.net".to_string(), "hola".to_string())]
    );

    // The conversation was stored for the default organization.
    let export: serde_json::Value = reqwest::get(format!(
        "{}/api/v1/conversations/1/export?sessionId=s1&chatId=%2B1555",
        base
    ))
    .await
    .expect("GET export")
    .json()
    .await
    .expect("parse JSON");
    assert_eq!(export["total"], 2);
    assert_eq!(export["messages"][0]["text"], "hola");
    assert_eq!(export["messages"][1]["text"], "echo: hola");
}

#[tokio::test]
async fn operator_answers_while_bot_is_paused() {
    let (nlu_url, seen) = common::start_fake_nlu().await;
    let mut config = common::test_config();
    config.nlu.default_url = nlu_url;
    let base = common::start_gateway(config).await;
    let client = reqwest::Client::new();

    let (mut socket, _) = connect_async(ws_url(&base, "phone=%2B1999&sessionId=s1"))
        .await
        .expect("connect");

    // First client of a fresh store gets id 1.
    let resp = client
        .post(format!("{}/api/v1/chats/mode", base))
        .json(&json!({
            "client_id": 1,
            "session_id": "s1",
            "chat_id": "+1555@s.whatsapp.net",
            "bot_mode": false
        }))
        .send()
        .await
        .expect("POST mode");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let inbound = json!({
        "phone": "+1555@s.whatsapp.net",
        "message": "hola",
        "botNumber": "+1999",
        "sessionId": "s1"
    });
    socket
        .send(Message::Text(inbound.to_string()))
        .await
        .expect("send frame");

    let resp = client
        .post(format!(
            "{}/api/v1/chats/+1555@s.whatsapp.net/send?sessionId=s1&botNumber=%2B1999",
            base
        ))
        .json(&json!({ "message": "Te atiendo yo" }))
        .send()
        .await
        .expect("POST send");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let stored: serde_json::Value = resp.json().await.expect("JSON");
    assert_eq!(stored["role"], "operator");

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["to"], "+1555@s.whatsapp.net");
    assert_eq!(reply["message"], "Te atiendo yo");
    assert_eq!(reply["sessionId"], "s1");
    assert!(seen.lock().unwrap().is_empty());

    // No bridge connected for session s9.
    let resp = client
        .post(format!(
            "{}/api/v1/chats/+1555@s.whatsapp.net/send?sessionId=s9&botNumber=%2B1999",
            base
        ))
        .json(&json!({ "message": "hola" }))
        .send()
        .await
        .expect("POST send");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = client
        .post(format!(
            "{}/api/v1/chats/+1555@s.whatsapp.net/send?sessionId=s1&botNumber=%2B1999",
            base
        ))
        .json(&json!({ "message": "  " }))
        .send()
        .await
        .expect("POST send");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("JSON");
    assert_eq!(body["field"], "message");
}

#[tokio::test]
async fn audio_frame_gets_fallback_reply() {
    let (nlu_url, seen) = common::start_fake_nlu().await;
    let mut config = common::test_config();
    config.nlu.default_url = nlu_url;
    let base = common::start_gateway(config).await;

    let (mut socket, _) = connect_async(ws_url(&base, "phone=%2B1999"))
        .await
        .expect("connect");
    let inbound = json!({
        "phone": "+1555@s.whatsapp.net",
        "botNumber": "+1999",
        "messageType": "audio"
    });
    socket
        .send(Message::Text(inbound.to_string()))
        .await
        .expect("send frame");

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["message"], lib::router::AUDIO_FALLBACK_REPLY);
    assert_eq!(reply["sessionId"], "default");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_connection_is_refused_until_the_first_closes() {
    let base = common::start_gateway(common::test_config()).await;
    let url = ws_url(&base, "phone=%2B1999&sessionId=s1");

    let (mut first, _) = connect_async(&url).await.expect("first connect");
    assert_eq!(connection_count(&base).await, 1);

    match connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 409);
        }
        Err(e) => panic!("expected HTTP 409, got {}", e),
        Ok(_) => panic!("second connection under the same key was accepted"),
    }

    // Same number, other session: a distinct key.
    let (_other, _) = connect_async(ws_url(&base, "phone=%2B1999&sessionId=s2"))
        .await
        .expect("other session connects");
    assert_eq!(connection_count(&base).await, 2);

    first.close(None).await.expect("close");
    let mut released = false;
    for _ in 0..100 {
        if connection_count(&base).await == 1 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(released, "closed connection was not unregistered");
    connect_async(&url).await.expect("reconnect after close");
}

#[tokio::test]
async fn undecodable_frame_closes_and_unregisters() {
    let base = common::start_gateway(common::test_config()).await;
    let (mut socket, _) = connect_async(ws_url(&base, "phone=%2B1777"))
        .await
        .expect("connect");
    socket
        .send(Message::Text("not json".to_string()))
        .await
        .expect("send garbage");

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the connection");
    let mut released = false;
    for _ in 0..100 {
        if connection_count(&base).await == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(released, "closed connection was not unregistered");
}

#[tokio::test]
async fn missing_phone_is_bad_request() {
    let base = common::start_gateway(common::test_config()).await;
    match connect_async(ws_url(&base, "sessionId=s1")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 400);
        }
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }
}
