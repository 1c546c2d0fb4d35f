#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabctl::browser::MemoryBrowser;
use tabctl::config::ServerConfig;
use tabctl::handlers::builtin_handlers;
use tabctl::server::Server;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::http::Response, tungstenite::Message, MaybeTlsStream,
    WebSocketStream,
};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Config bound to an ephemeral loopback port.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

/// Start a server over a fresh in-memory browser.
pub async fn start_server(config: ServerConfig) -> (Server, Arc<MemoryBrowser>) {
    let browser = Arc::new(MemoryBrowser::new());
    let server = Server::bind(&config, browser.clone(), builtin_handlers())
        .await
        .expect("server should bind");
    (server, browser)
}

/// Connect on `path` and return the socket plus the session id header.
pub async fn connect(server: &Server, path: &str) -> (Ws, String) {
    let (ws, response) = connect_async(format!("{}{}", server.url(), path))
        .await
        .expect("connect failed");
    let session = header(&response, "x-tabctl-session").expect("missing session header");
    (ws, session)
}

pub fn header<T>(response: &Response<T>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Thin request/response client over one socket.
pub struct Client {
    pub ws: Ws,
    pub session_id: String,
    next_id: u64,
}

impl Client {
    pub async fn new_session(server: &Server) -> Self {
        let (ws, session_id) = connect(server, "/new").await;
        Self {
            ws,
            session_id,
            next_id: 0,
        }
    }

    pub async fn join(server: &Server, session_id: &str) -> Self {
        let (ws, joined) = connect(server, &format!("/session/{session_id}")).await;
        assert_eq!(joined, session_id);
        Self {
            ws,
            session_id: joined,
            next_id: 0,
        }
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send failed");
    }

    /// Next text message as JSON.
    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream ended")
                .expect("ws error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text message, got {:?}", other),
            }
        }
    }

    /// Send a request and return the full response envelope.
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.send_raw(&json!({"id": id, "method": method, "params": params}).to_string())
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], id, "response id mismatch: {response}");
        response
    }

    /// Send a request and unwrap its result.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let response = self.request(method, params).await;
        assert!(response.get("error").is_none(), "{method} failed: {response}");
        response["result"].clone()
    }

    /// Wait for the server to close the socket. Returns the close code if a
    /// close frame arrived.
    pub async fn expect_closed(&mut self) -> Option<u16> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timeout waiting for close");
            match next {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(Message::Text(text))) => panic!("unexpected message after close: {text}"),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }
}
