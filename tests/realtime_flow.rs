//! End-to-end tests over a real socket: auth, initial subscriptions, join/leave, fan-out, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flitch_realtime::auth::Claims;
use flitch_realtime::config::Config;
use flitch_realtime::directory::InMemoryChatDirectory;
use flitch_realtime::events::ServerEvent;
use flitch_realtime::ids::{RoomId, UserId};
use flitch_realtime::{build_router, AppState};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    directory: Arc<InMemoryChatDirectory>,
}

async fn start_server() -> TestServer {
    let config = Config::from_lookup(|key| match key {
        "JWT_SECRET" => Some(SECRET.to_string()),
        "DELIVERY_TIMEOUT_MS" => Some("500".to_string()),
        _ => None,
    })
    .expect("config");
    let directory = Arc::new(InMemoryChatDirectory::new());
    let state = AppState::new(&config, directory.clone()).expect("state");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    TestServer {
        addr,
        state,
        directory,
    }
}

fn token_for(uid: UserId) -> String {
    encode(
        &Header::default(),
        &Claims {
            sub: uid.0,
            exp: Utc::now().timestamp() + 600,
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

async fn connect(server: &TestServer, uid: UserId) -> WsStream {
    let url = format!("ws://{}/ws?access_token={}", server.addr, token_for(uid));
    let (ws, _) = connect_async(url).await.expect("ws connect");
    wait_until(|| server.state.presence().is_online(&uid)).await;
    ws
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server event");
        }
    }
}

async fn send(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

#[tokio::test]
async fn rejects_upgrade_without_valid_token() {
    let server = start_server().await;

    let err = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .expect_err("missing token must be rejected");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401)
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = connect_async(format!("ws://{}/ws?access_token=garbage", server.addr))
        .await
        .expect_err("garbage token must be rejected");
    assert!(matches!(
        err,
        tokio_tungstenite::tungstenite::Error::Http(_)
    ));
}

#[tokio::test]
async fn participant_chats_are_subscribed_on_connect() {
    let server = start_server().await;
    let alice = UserId::new();
    let chat = RoomId::new();
    server.directory.add_participant(chat, alice);

    let mut ws = connect(&server, alice).await;
    wait_until(|| server.state.presence().rooms().subscriber_count(&chat) == 1).await;

    let message = json!({"id": "m1", "text": "hello"});
    server
        .state
        .notifier
        .message_received(chat, message.clone())
        .await;

    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::MessageReceived {
            chat_id: chat,
            message
        }
    );
}

#[tokio::test]
async fn join_requires_participation_and_leave_stops_events() {
    let server = start_server().await;
    let bob = UserId::new();
    let chat = RoomId::new();
    let mut ws = connect(&server, bob).await;

    send(&mut ws, json!({"type": "join_chat", "chat_id": chat})).await;
    assert!(matches!(next_event(&mut ws).await, ServerEvent::Error { .. }));

    server.directory.add_participant(chat, bob);
    send(&mut ws, json!({"type": "join_chat", "chat_id": chat})).await;
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::Subscribed { chat_id: chat }
    );

    let report = server.state.notifier.chat_updated(chat, json!({"name": "renamed"})).await;
    assert_eq!(report.delivered, 1);
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::ChatUpdated { .. }
    ));

    send(&mut ws, json!({"type": "leave_chat", "chat_id": chat})).await;
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::Unsubscribed { chat_id: chat }
    );
    let report = server.state.notifier.chat_updated(chat, json!({})).await;
    assert_eq!(report.delivered, 0);

    send(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(next_event(&mut ws).await, ServerEvent::Pong);
}

#[tokio::test]
async fn every_device_of_a_user_gets_direct_events() {
    let server = start_server().await;
    let carol = UserId::new();
    let mut phone = connect(&server, carol).await;
    let mut laptop = connect(&server, carol).await;
    wait_until(|| server.state.presence().registry().connections(&carol).len() == 2).await;

    let chat = RoomId::new();
    let report = server
        .state
        .notifier
        .new_chat_created(chat, vec![carol, UserId::new()], json!({"id": chat}))
        .await;

    assert_eq!(report.delivered, 2);
    for ws in [&mut phone, &mut laptop] {
        assert!(matches!(
            next_event(ws).await,
            ServerEvent::NewChatCreated { chat_id, .. } if chat_id == chat
        ));
    }
}

#[tokio::test]
async fn added_member_receives_own_addition() {
    let server = start_server().await;
    let admin = UserId::new();
    let newcomer = UserId::new();
    let chat = RoomId::new();
    server.directory.add_participant(chat, admin);

    let mut admin_ws = connect(&server, admin).await;
    let mut newcomer_ws = connect(&server, newcomer).await;
    wait_until(|| server.state.presence().rooms().subscriber_count(&chat) == 1).await;

    server.directory.add_participant(chat, newcomer);
    server
        .state
        .notifier
        .new_member_added(chat, newcomer, json!({"uid": newcomer}))
        .await;

    assert!(matches!(
        next_event(&mut newcomer_ws).await,
        ServerEvent::NewMemberAdded { .. }
    ));
    assert!(matches!(
        next_event(&mut admin_ws).await,
        ServerEvent::NewMemberAdded { .. }
    ));
    assert_eq!(server.state.presence().rooms().subscriber_count(&chat), 2);
}

#[tokio::test]
async fn closing_socket_cleans_up_presence_and_rooms() {
    let server = start_server().await;
    let dave = UserId::new();
    let chat = RoomId::new();
    server.directory.add_participant(chat, dave);

    let mut ws = connect(&server, dave).await;
    wait_until(|| server.state.presence().rooms().subscriber_count(&chat) == 1).await;

    ws.close(None).await.expect("close");

    wait_until(|| !server.state.presence().is_online(&dave)).await;
    assert_eq!(server.state.presence().rooms().room_count(), 0);
}
