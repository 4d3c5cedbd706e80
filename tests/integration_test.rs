//! Black-box tests against an in-process server.
//!
//! Happy paths go through the `redis` client; wire-exact assertions (error
//! line shape, subscription confirmations, published message framing) use a
//! raw TCP stream, because those surfaces deviate from RESP on purpose.

use std::sync::Arc;
use std::time::Duration;

use murex::config::Config;
use murex::server::Server;
use redis::Commands;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MESSAGE_FRAME: usize = 1024;

async fn start_server_with(config: Config) -> Arc<Server> {
    let port = config.port;
    let server = Server::new(Arc::new(config)).expect("server init");
    tokio::spawn(Arc::clone(&server).run());

    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return server;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not start on port {port}");
}

async fn start_server(port: u16) -> Arc<Server> {
    start_server_with(Config {
        port,
        server_id: format!("test-{port}"),
        ..Config::default()
    })
    .await
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.expect("connect")
}

async fn send(stream: &mut TcpStream, parts: &[&str]) {
    let mut frame = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        frame.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    stream.write_all(&frame).await.expect("send command");
}

/// Read exactly the expected reply, failing loudly on a mismatch or stall.
async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut got))
        .await
        .expect("timed out waiting for reply")
        .expect("read reply");
    assert_eq!(
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected)
    );
}

/// Read one null-padded pub/sub frame and decode the JSON triple.
async fn read_message(stream: &mut TcpStream) -> Vec<String> {
    let mut frame = vec![0u8; MESSAGE_FRAME];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut frame))
        .await
        .expect("timed out waiting for message")
        .expect("read message");
    let trimmed: Vec<u8> = frame.into_iter().take_while(|&b| b != 0).collect();
    serde_json::from_slice(&trimmed).expect("message is a JSON triple")
}

#[tokio::test]
async fn set_get_roundtrip_with_redis_client() {
    let port = 17801;
    let _server = start_server(port).await;

    tokio::task::spawn_blocking(move || {
        let client = redis::Client::open(format!("redis://127.0.0.1:{port}/")).unwrap();
        let mut conn = client.get_connection().unwrap();

        let pong: String = redis::cmd("PING").query(&mut conn).unwrap();
        assert_eq!(pong, "PONG");

        let _: () = conn.set("foo", "1").unwrap();
        let value: String = conn.get("foo").unwrap();
        assert_eq!(value, "1");

        let _: () = conn.lpush("jobs", "b").unwrap();
        let _: () = conn.lpush("jobs", "a").unwrap();
        let range: Vec<String> = conn.lrange("jobs", 0, -1).unwrap();
        assert_eq!(range, vec!["a", "b"]);

        let added: i64 = conn.sadd("tags", "x").unwrap();
        assert_eq!(added, 1);
        let is_member: bool = conn.sismember("tags", "x").unwrap();
        assert!(is_member);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn wire_level_set_get() {
    let port = 17802;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["SET", "foo", "1"]).await;
    expect_reply(&mut conn, b"+OK\r\n").await;

    send(&mut conn, &["GET", "foo"]).await;
    expect_reply(&mut conn, b"$1\r\n1\r\n").await;

    send(&mut conn, &["GET", "missing"]).await;
    expect_reply(&mut conn, b"$-1\r\n").await;
}

#[tokio::test]
async fn unknown_command_error_line() {
    let port = 17803;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["FOOBAR"]).await;
    expect_reply(&mut conn, b"-command FOOBAR not supported\r\n\n").await;

    // The connection stays open after an error.
    send(&mut conn, &["PING"]).await;
    expect_reply(&mut conn, b"+PONG\r\n").await;
}

#[tokio::test]
async fn decode_error_keeps_connection_open() {
    let port = 17804;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    conn.write_all(b"*x\r\n").await.unwrap();
    expect_reply(&mut conn, b"-Error invalid multibulk length\r\n\n").await;

    send(&mut conn, &["PING"]).await;
    expect_reply(&mut conn, b"+PONG\r\n").await;
}

#[tokio::test]
async fn wrongtype_error_line() {
    let port = 17805;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["LPUSH", "mylist", "a"]).await;
    expect_reply(&mut conn, b":1\r\n").await;

    send(&mut conn, &["GET", "mylist"]).await;
    expect_reply(
        &mut conn,
        b"-Error operation against a key holding the wrong kind of value\r\n\n",
    )
    .await;
}

#[tokio::test]
async fn pipelined_commands_answer_in_order() {
    let port = 17806;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    let burst = b"*2\r\n$4\r\nECHO\r\n$1\r\na\r\n*2\r\n$4\r\nECHO\r\n$1\r\nb\r\n*2\r\n$4\r\nECHO\r\n$1\r\nc\r\n";
    conn.write_all(burst).await.unwrap();
    expect_reply(&mut conn, b"$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n").await;
}

#[tokio::test]
async fn subscribe_confirmations_then_messages() {
    let port = 17807;
    let _server = start_server(port).await;

    let mut subscriber = connect(port).await;
    send(&mut subscriber, &["SUBSCRIBE", "a", "b"]).await;

    assert_eq!(read_message(&mut subscriber).await, vec!["subscribe", "a", "1"]);
    assert_eq!(read_message(&mut subscriber).await, vec!["subscribe", "b", "2"]);

    let mut publisher = connect(port).await;
    send(&mut publisher, &["PUBLISH", "a", "hello"]).await;
    expect_reply(&mut publisher, b":1\r\n").await;

    assert_eq!(read_message(&mut subscriber).await, vec!["message", "a", "hello"]);
}

#[tokio::test]
async fn pattern_subscribers_receive_pmessage() {
    let port = 17808;
    let _server = start_server(port).await;

    let mut subscriber = connect(port).await;
    send(&mut subscriber, &["PSUBSCRIBE", "news.*"]).await;
    assert_eq!(
        read_message(&mut subscriber).await,
        vec!["psubscribe", "news.*", "1"]
    );

    let mut publisher = connect(port).await;
    send(&mut publisher, &["PUBLISH", "news.sports", "goal"]).await;
    expect_reply(&mut publisher, b":1\r\n").await;

    assert_eq!(
        read_message(&mut subscriber).await,
        vec!["pmessage", "news.*", "goal"]
    );
}

#[tokio::test]
async fn publisher_and_subscriber_stay_fifo() {
    let port = 17809;
    let _server = start_server(port).await;

    let mut subscriber = connect(port).await;
    send(&mut subscriber, &["SUBSCRIBE", "seq"]).await;
    read_message(&mut subscriber).await;

    let mut publisher = connect(port).await;
    for i in 0..20 {
        send(&mut publisher, &["PUBLISH", "seq", &i.to_string()]).await;
        expect_reply(&mut publisher, b":1\r\n").await;
    }

    for i in 0..20 {
        let msg = read_message(&mut subscriber).await;
        assert_eq!(msg, vec!["message".to_string(), "seq".to_string(), i.to_string()]);
    }
}

#[tokio::test]
async fn auth_unknown_user_error() {
    let port = 17810;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["AUTH", "wronguser", "wrongpass"]).await;
    expect_reply(&mut conn, b"-Error user not found\r\n\n").await;
}

#[tokio::test]
async fn restricted_user_is_denied_writes() {
    let port = 17811;
    let acl_path = std::env::temp_dir().join(format!("murex-acl-{port}.json"));
    std::fs::write(
        &acl_path,
        r#"[{
            "username": "reader",
            "no_password": true,
            "commands": ["get", "auth"],
            "categories": ["read", "connection"],
            "read_key_patterns": ["app:*"],
            "write_key_patterns": [],
            "channel_patterns": []
        }]"#,
    )
    .unwrap();

    let _server = start_server_with(Config {
        port,
        server_id: format!("test-{port}"),
        acl_file: acl_path.display().to_string(),
        ..Config::default()
    })
    .await;

    let mut conn = connect(port).await;
    send(&mut conn, &["AUTH", "reader", "anything"]).await;
    expect_reply(&mut conn, b"+OK\r\n").await;

    send(&mut conn, &["GET", "app:profile"]).await;
    expect_reply(&mut conn, b"$-1\r\n").await;

    send(&mut conn, &["GET", "secret:profile"]).await;
    expect_reply(&mut conn, b"-not authorized to read the key secret:profile\r\n\n").await;

    send(&mut conn, &["SET", "app:profile", "1"]).await;
    expect_reply(&mut conn, b"-not authorized to write the key app:profile\r\n\n").await;

    std::fs::remove_file(acl_path).ok();
}

#[tokio::test]
async fn expired_keys_read_as_absent() {
    let port = 17812;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["SET", "short", "lived"]).await;
    expect_reply(&mut conn, b"+OK\r\n").await;
    send(&mut conn, &["PEXPIRE", "short", "150"]).await;
    expect_reply(&mut conn, b":1\r\n").await;

    send(&mut conn, &["TTL", "short"]).await;
    expect_reply(&mut conn, b":1\r\n").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    send(&mut conn, &["GET", "short"]).await;
    expect_reply(&mut conn, b"$-1\r\n").await;
}

#[tokio::test]
async fn loaded_module_serves_commands() {
    let port = 17813;
    let module_path = std::env::temp_dir().join(format!("murex-module-{port}.lua"));
    std::fs::write(
        &module_path,
        r#"
command = {
    name = "module.set",
    categories = { "write", "fast" },
    description = "Set a key through a module",
    sync = true,
    key_extract = function(cmd)
        return { read = {}, write = { cmd[2] } }
    end,
    handler = function(cmd, keys_exist, get_value, set_value)
        set_value(cmd[2], tonumber(cmd[3]))
        return "+OK\r\n"
    end,
}
"#,
    )
    .unwrap();

    let _server = start_server_with(Config {
        port,
        server_id: format!("test-{port}"),
        modules: vec![module_path.display().to_string()],
        ..Config::default()
    })
    .await;

    let mut conn = connect(port).await;
    send(&mut conn, &["MODULE.SET", "k", "42"]).await;
    expect_reply(&mut conn, b"+OK\r\n").await;

    send(&mut conn, &["GET", "k"]).await;
    expect_reply(&mut conn, b":42\r\n").await;

    std::fs::remove_file(module_path).ok();
}

#[tokio::test]
async fn acl_and_pubsub_subcommands() {
    let port = 17814;
    let _server = start_server(port).await;
    let mut conn = connect(port).await;

    send(&mut conn, &["ACL", "WHOAMI"]).await;
    expect_reply(&mut conn, b"$7\r\ndefault\r\n").await;

    send(&mut conn, &["PUBSUB", "NUMPAT"]).await;
    expect_reply(&mut conn, b":0\r\n").await;
}
