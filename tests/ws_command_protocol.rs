//! End-to-end tests for the command protocol over a real socket.

mod common;

use common::{start_server, test_config, Client};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn ping_reports_session_and_connection() {
    let (server, _browser) = start_server(test_config()).await;
    let mut c = Client::new_session(&server).await;

    let pong = c.call("ping", json!({})).await;
    assert_eq!(pong["pong"], true);
    assert_eq!(pong["session_id"], c.session_id.as_str());
    assert!(pong["connection_id"].as_str().unwrap().starts_with("conn-"));

    server.stop().await;
}

#[tokio::test]
async fn request_ids_are_echoed_verbatim() {
    let (server, _browser) = start_server(test_config()).await;
    let mut c = Client::new_session(&server).await;

    c.send_raw(r#"{"id":"abc-1","method":"ping"}"#).await;
    assert_eq!(c.recv().await["id"], "abc-1");

    c.send_raw(r#"{"id":{"nested":[1,2]},"method":"ping","params":null}"#).await;
    assert_eq!(c.recv().await["id"], json!({"nested": [1, 2]}));

    server.stop().await;
}

#[tokio::test]
async fn protocol_errors_use_their_codes() {
    let (server, _browser) = start_server(test_config()).await;
    let mut c = Client::new_session(&server).await;

    c.send_raw("{not json").await;
    let parse = c.recv().await;
    assert_eq!(parse["id"], json!(null));
    assert_eq!(parse["error"]["code"], -32700);

    let unknown = c.request("teleport", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);
    assert!(unknown["error"]["message"]
        .as_str()
        .unwrap()
        .contains("teleport"));

    let no_tab = c.request("reload", json!({})).await;
    assert_eq!(no_tab["error"]["code"], -1);

    // The connection is still usable after every failure above.
    assert_eq!(c.call("ping", json!({})).await["pong"], true);

    server.stop().await;
}

#[tokio::test]
async fn timed_out_command_does_not_block_the_next_one() {
    let mut config = test_config();
    config.command_timeout = Duration::from_millis(200);
    let (server, _browser) = start_server(config).await;
    let mut c = Client::new_session(&server).await;

    let slow = c.request("wait", json!({"seconds": 5})).await;
    assert_eq!(slow["error"]["code"], -1);
    assert!(slow["error"]["message"]
        .as_str()
        .unwrap()
        .contains("timed out"));

    let quick = c.call("ping", json!({})).await;
    assert_eq!(quick["pong"], true);

    server.stop().await;
}

#[tokio::test]
async fn unknown_session_gets_404() {
    let (server, _browser) = start_server(test_config()).await;

    let err = tokio_tungstenite::connect_async(format!("{}/session/does-not-exist", server.url()))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 404);
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn handshake_without_nonce_is_dropped_silently() {
    let (server, _browser) = start_server(test_config()).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /new HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf))
        .await
        .expect("server should close the socket")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn tabs_and_navigation_round_trip() {
    let (server, _browser) = start_server(test_config()).await;
    let mut c = Client::new_session(&server).await;

    let tab = c.call("create_tab", json!({"url": "https://a.example/"})).await;
    let tab_id = tab["tab_id"].as_str().unwrap().to_string();

    let nav = c.call("navigate", json!({"url": "https://b.example/"})).await;
    assert_eq!(nav["tab_id"], tab_id.as_str());
    assert_eq!(nav["url"], "https://b.example/");

    let back = c.call("go_back", json!({})).await;
    assert_eq!(back["url"], "https://a.example/");

    let tabs = c.call("list_tabs", json!({})).await;
    assert_eq!(tabs.as_array().unwrap().len(), 1);

    let closed = c.call("close_tab", json!({"tab_id": tab_id})).await;
    assert_eq!(closed["success"], true);
    assert_eq!(c.call("list_tabs", json!({})).await, json!([]));

    server.stop().await;
}
