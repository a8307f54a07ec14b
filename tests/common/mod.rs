#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use ccbridge::{
    api,
    attachments::DirAttachmentStore,
    auth::JwtAuthenticator,
    bridge::{Bridge, BridgeDeps, BridgeOptions},
    pty::CliCommand,
    sanitize::StandardSanitizer,
    session::SpawnOptions,
    shutdown::ShutdownCoordinator,
    store::MemoryStore,
};

pub const SECRET: &[u8] = b"integration-test-secret";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running server plus the handles tests poke at.
pub struct TestServer {
    pub addr: SocketAddr,
    pub authenticator: Arc<JwtAuthenticator>,
    pub bridge: Bridge,
    pub shutdown: ShutdownCoordinator,
    /// Directory sessions are created in.
    pub workdir: TempDir,
    pub uploads: TempDir,
}

/// Options that run `sh` instead of the assistant.
pub fn sh_options() -> BridgeOptions {
    BridgeOptions {
        spawn: SpawnOptions {
            command: CliCommand {
                shell: "/bin/sh".to_string(),
                program: "sh".to_string(),
            },
            ..SpawnOptions::default()
        },
        ..BridgeOptions::default()
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(sh_options()).await
}

pub async fn start_server_with(options: BridgeOptions) -> TestServer {
    let uploads = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let authenticator = Arc::new(JwtAuthenticator::new(SECRET));

    let bridge = Bridge::spawn(
        options,
        BridgeDeps {
            store: Arc::new(MemoryStore::new()),
            sanitizer: Arc::new(StandardSanitizer),
            attachments: Arc::new(DirAttachmentStore::new(uploads.path())),
        },
    )
    .await
    .expect("bridge should start");

    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState::new(bridge.clone(), authenticator.clone(), shutdown.clone());
    let app = api::router(state, api::RouterConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        authenticator,
        bridge,
        shutdown,
        workdir,
        uploads,
    }
}

impl TestServer {
    pub fn token(&self) -> String {
        self.authenticator
            .issue("tester", "laptop", chrono::Duration::hours(1))
            .unwrap()
    }

    pub fn ws_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    pub fn workdir(&self) -> String {
        self.workdir.path().display().to_string()
    }

    /// Connect with a valid token and consume the initial session list.
    pub async fn connect(&self) -> Ws {
        let (mut ws, _) = connect_async(self.ws_url(Some(&self.token())))
            .await
            .expect("websocket should connect");
        let first = recv_event(&mut ws).await;
        assert_eq!(first["event"], "session:list", "got {first}");
        ws
    }
}

pub async fn send(ws: &mut Ws, message: Value) {
    ws.send(Message::Text(message.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, failing the test after five seconds.
pub async fn recv_event(ws: &mut Ws) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Skip events until one satisfies `pred`, failing after ten seconds.
pub async fn wait_for(ws: &mut Ws, mut pred: impl FnMut(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = recv_event(ws).await;
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

pub fn is_event(event: &Value, name: &str) -> bool {
    event["event"] == name
}

/// Create a session and return its id once `session:created` arrives.
pub async fn create_session(ws: &mut Ws, name: &str, cwd: &str) -> String {
    send(
        ws,
        serde_json::json!({"event": "session:create", "data": {"name": name, "cwd": cwd}}),
    )
    .await;
    let created = wait_for(ws, |e| is_event(e, "session:created")).await;
    assert_eq!(created["data"]["name"], name);
    assert_eq!(created["data"]["status"], "active");
    created["data"]["id"].as_str().unwrap().to_string()
}
