use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sharp_core::gateway_ipc::{Frame, RequestFrame};
use sharp_gateway::{
    ConnectionStatus, GatewayClient, GatewayConfig, GatewayError, GatewayEvent, ReconnectPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Millisecond-scale timers; each test overrides what it exercises.
fn fast_config(url: String) -> GatewayConfig {
    GatewayConfig {
        reconnect: ReconnectPolicy {
            schedule: vec![Duration::from_millis(50)],
            max_attempts: 3,
        },
        ..GatewayConfig::with_url(url)
    }
}

/// Reads until the client's close frame and returns its code and reason.
async fn next_close(ws: &mut ServerSocket) -> (u16, String) {
    loop {
        match ws.next().await.expect("client stayed connected").expect("read") {
            Message::Close(Some(frame)) => return (u16::from(frame.code), frame.reason.to_string()),
            Message::Close(None) => panic!("close without code"),
            Message::Text(text) => panic!("unexpected frame before close: {text}"),
            _ => {}
        }
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, format!("ws://{addr}"))
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("ws accept")
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("server send");
}

async fn next_request(ws: &mut ServerSocket) -> RequestFrame {
    loop {
        let message = ws
            .next()
            .await
            .expect("client stayed connected")
            .expect("read");
        if let Message::Text(text) = message {
            match serde_json::from_str::<Frame>(&text).expect("client frame") {
                Frame::Req(req) => return req,
                other => panic!("expected request, got {other:?}"),
            }
        }
    }
}

async fn reply_ok(ws: &mut ServerSocket, id: &str, payload: Value) {
    send_json(ws, json!({"type": "res", "id": id, "ok": true, "payload": payload})).await;
}

async fn challenge(ws: &mut ServerSocket, nonce: &str) {
    send_json(
        ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": nonce, "ts": 1}}),
    )
    .await;
}

/// Runs the server side of a successful handshake and answers the active-run resync.
async fn complete_handshake(ws: &mut ServerSocket, runs: Value) {
    challenge(ws, "nonce-1").await;
    let connect = next_request(ws).await;
    assert_eq!(connect.method, "connect");
    reply_ok(
        ws,
        &connect.id,
        json!({"type": "hello-ok", "protocol": 3, "server": {"version": "test"}}),
    )
    .await;
    let resync = next_request(ws).await;
    assert_eq!(resync.method, "chat.activeRuns");
    reply_ok(ws, &resync.id, json!({ "runs": runs })).await;
}

async fn wait_for_status(
    rx: &mut watch::Receiver<ConnectionStatus>,
    predicate: impl Fn(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    timeout(WAIT, async {
        loop {
            let current = rx.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            rx.changed().await.expect("status sender alive");
        }
    })
    .await
    .expect("status reached in time")
}

async fn wait_for_runs(client: &GatewayClient, predicate: impl Fn(&sharp_core::ActiveRunSet) -> bool) {
    let mut rx = client.watch_active_runs();
    timeout(WAIT, async {
        loop {
            if predicate(&rx.borrow_and_update().clone()) {
                return;
            }
            rx.changed().await.expect("runs sender alive");
        }
    })
    .await
    .expect("active runs reached in time");
}

async fn next_event(
    events: &mut broadcast::Receiver<GatewayEvent>,
    predicate: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_then_out_of_order_responses() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        challenge(&mut ws, "nonce-1").await;
        challenge(&mut ws, "nonce-2").await;
        let connect = next_request(&mut ws).await;
        assert_eq!(connect.method, "connect");
        assert_eq!(connect.params["maxProtocol"], json!(3));
        reply_ok(&mut ws, &connect.id, json!({"type": "hello-ok", "protocol": 3})).await;

        // A second connect here would mean the duplicate challenge was answered.
        let resync = next_request(&mut ws).await;
        assert_eq!(resync.method, "chat.activeRuns");
        reply_ok(
            &mut ws,
            &resync.id,
            json!({"runs": [{"sessionKey": "agent:main:telegram:1", "runId": "run-1"}]}),
        )
        .await;

        let first = next_request(&mut ws).await;
        let second = next_request(&mut ws).await;
        for req in [&second, &first] {
            reply_ok(&mut ws, &req.id, json!({ "echo": req.method })).await;
        }

        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "runId": "run-2", "sessionKey": "agent:main:slack:2",
                "stream": "lifecycle", "data": {"phase": "start"}
            }}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat", "payload": {
                "runId": "run-1", "sessionKey": "agent:main:telegram:1", "state": "final"
            }}),
        )
        .await;

        // Hold the socket until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = GatewayClient::create(GatewayConfig::with_url(url)).expect("client");
    let mut status = client.watch_status();
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    wait_for_status(&mut status, ConnectionStatus::is_connected).await;
    let connected = next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;
    let GatewayEvent::Connected(hello) = connected else {
        panic!("expected hello");
    };
    assert_eq!(hello.protocol, 3);
    wait_for_runs(&client, |runs| runs.contains("agent:main:telegram:1")).await;

    let (status_reply, sessions_reply) = tokio::join!(
        client.request("status", json!({})),
        client.request("sessions.list", json!({"limit": 5}))
    );
    assert_eq!(status_reply.expect("status"), json!({"echo": "status"}));
    assert_eq!(
        sessions_reply.expect("sessions"),
        json!({"echo": "sessions.list"})
    );

    wait_for_runs(&client, |runs| {
        runs.contains("agent:main:slack:2") && !runs.contains("agent:main:telegram:1")
    })
    .await;
    let chat = next_event(&mut events, |event| matches!(event, GatewayEvent::Chat(_))).await;
    let GatewayEvent::Chat(chat) = chat else {
        panic!("expected chat event");
    };
    assert_eq!(chat.session_key, "agent:main:telegram:1");

    client.dispose().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_rejects_pending_requests() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([{"sessionKey": "agent:main:telegram:1", "runId": "r"}]))
            .await;
        let pending = next_request(&mut ws).await;
        assert_eq!(pending.method, "chat.history");
        ws.close(None).await.expect("close");
    });

    let client = GatewayClient::create(GatewayConfig::with_url(url)).expect("client");
    let mut status = client.watch_status();
    let mut events = client.subscribe();
    client.connect().await.expect("connect");
    wait_for_status(&mut status, ConnectionStatus::is_connected).await;

    let err = client
        .chat_history("agent:main:telegram:1", 20)
        .await
        .expect_err("socket closed before reply");
    assert_eq!(err, GatewayError::ConnectionClosed);
    next_event(&mut events, |event| matches!(event, GatewayEvent::Disconnected { .. })).await;
    assert!(client.active_run_set().is_empty());
    assert!(!client.status().is_connected());

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_before_handshake_fail_fast() {
    let client =
        GatewayClient::create(GatewayConfig::with_url("ws://127.0.0.1:9")).expect("client");
    assert_eq!(
        client.request("status", json!({})).await,
        Err(GatewayError::NotConnected)
    );
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    client.dispose().await;
    assert_eq!(client.connect().await, Err(GatewayError::Disposed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_connect_reports_auth_failure() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        challenge(&mut ws, "nonce-1").await;
        let connect = next_request(&mut ws).await;
        assert_eq!(connect.params["auth"]["token"], json!("wrong"));
        send_json(
            &mut ws,
            json!({"type": "res", "id": connect.id, "ok": false,
                   "error": {"code": "UNAUTHORIZED", "message": "bad token"}}),
        )
        .await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = GatewayConfig {
        token: Some("wrong".to_string()),
        ..GatewayConfig::with_url(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut status = client.watch_status();
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    let failed = next_event(&mut events, |event| matches!(event, GatewayEvent::AuthFailed(_))).await;
    assert_eq!(failed, GatewayEvent::AuthFailed("bad token".to_string()));
    let current = wait_for_status(&mut status, |status| status.message().is_some()).await;
    assert_eq!(
        current,
        ConnectionStatus::Error {
            message: "bad token".to_string()
        }
    );
    assert_eq!(
        client.request("status", json!({})).await,
        Err(GatewayError::NotConnected)
    );

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_upgrade_times_out_then_gives_up() {
    let (listener, url) = listen().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let server = tokio::spawn({
        let accepted = accepted.clone();
        async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.expect("accept");
                accepted.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        }
    });

    let config = GatewayConfig {
        connect_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            schedule: vec![Duration::from_millis(50)],
            max_attempts: 2,
        },
        ..GatewayConfig::with_url(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut status = client.watch_status();
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    next_event(&mut events, |event| *event == GatewayEvent::HandshakeTimeout).await;
    let current = wait_for_status(&mut status, |status| status.message().is_some()).await;
    assert!(!current.is_connected());
    let gave_up = next_event(&mut events, |event| {
        matches!(event, GatewayEvent::MaxAttemptsReached { .. })
    })
    .await;
    assert_eq!(gave_up, GatewayEvent::MaxAttemptsReached { attempts: 2 });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 3);

    client.dispose().await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_challenge_closes_with_handshake_timeout() {
    let (listener, url) = listen().await;
    let (redialed_tx, redialed_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // No challenge: the only thing the client may send is its close frame.
        let (code, reason) = next_close(&mut ws).await;
        assert_eq!(code, 4008);
        assert_eq!(reason, "connect timeout");
        drop(ws);
        let _second = accept(&listener).await;
        let _ = redialed_tx.send(());
    });

    let config = GatewayConfig {
        connect_timeout: Duration::from_millis(300),
        keepalive_interval: Duration::from_millis(50),
        ..fast_config(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    next_event(&mut events, |event| *event == GatewayEvent::HandshakeTimeout).await;
    let closed = next_event(&mut events, |event| {
        matches!(event, GatewayEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        closed,
        GatewayEvent::Disconnected {
            code: Some(4008),
            reason: "connect timeout".to_string()
        }
    );
    timeout(WAIT, redialed_rx)
        .await
        .expect("redial in time")
        .expect("server saw redial");

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_socket_is_closed_and_redialed() {
    let (listener, url) = listen().await;
    let (redialed_tx, redialed_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([])).await;
        // Read keepalives without answering until the watchdog gives up on us.
        let mut keepalives = 0;
        let (code, reason) = loop {
            match ws.next().await.expect("client stayed connected").expect("read") {
                Message::Text(text) => match serde_json::from_str::<Frame>(&text).expect("frame") {
                    Frame::Req(req) => {
                        assert_eq!(req.method, "status");
                        keepalives += 1;
                    }
                    other => panic!("unexpected frame {other:?}"),
                },
                Message::Close(Some(frame)) => break (u16::from(frame.code), frame.reason.to_string()),
                _ => {}
            }
        };
        assert!(keepalives >= 1, "keepalive sent while authenticated");
        assert_eq!(code, 4000);
        assert_eq!(reason, "stale connection");
        drop(ws);
        let _second = accept(&listener).await;
        let _ = redialed_tx.send(());
    });

    let config = GatewayConfig {
        keepalive_interval: Duration::from_millis(100),
        stale_after: Duration::from_millis(500),
        request_timeout: Duration::from_secs(2),
        ..fast_config(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;
    let closed = next_event(&mut events, |event| {
        matches!(event, GatewayEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        closed,
        GatewayEvent::Disconnected {
            code: Some(4000),
            reason: "stale connection".to_string()
        }
    );
    timeout(WAIT, redialed_rx)
        .await
        .expect("redial in time")
        .expect("server saw redial");

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_reconnects_automatically() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([])).await;
        ws.close(None).await.expect("close");
        while let Some(Ok(_)) = ws.next().await {}

        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([{"sessionKey": "agent:main:telegram:1", "runId": "r2"}]))
            .await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = GatewayClient::create(fast_config(url)).expect("client");
    let mut events = client.subscribe();
    client.connect().await.expect("connect");

    next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;
    next_event(&mut events, |event| matches!(event, GatewayEvent::Disconnected { .. })).await;
    next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;
    wait_for_runs(&client, |runs| runs.run_id("agent:main:telegram:1") == Some("r2")).await;
    assert!(client.status().is_connected());

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_peer_does_not_block_timeouts() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([])).await;
        // Stop reading and writing; the socket stays open.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(ws);
    });

    let config = GatewayConfig {
        request_timeout: Duration::from_millis(300),
        stale_after: Duration::from_secs(1),
        ..fast_config(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut events = client.subscribe();
    client.connect().await.expect("connect");
    next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;

    let bulk = "x".repeat(1 << 20);
    let sends: Vec<_> = (0..40)
        .map(|_| {
            let client = client.clone();
            let bulk = bulk.clone();
            tokio::spawn(async move { client.chat_send("agent:main:telegram:1", &bulk).await })
        })
        .collect();

    let reply = timeout(Duration::from_secs(2), client.request("status", json!({})))
        .await
        .expect("request settles while the peer is stalled");
    assert!(
        matches!(reply, Err(GatewayError::Timeout { .. })),
        "unexpected reply {reply:?}"
    );
    next_event(&mut events, |event| {
        matches!(event, GatewayEvent::Disconnected { code: Some(4000), .. })
    })
    .await;
    for send in sends {
        let result = timeout(WAIT, send).await.expect("send settled").expect("join");
        assert!(result.is_err());
    }

    client.dispose().await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pings_keep_the_socket_alive_and_runs_track_lifecycle() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!([])).await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {
                "sessionKey": "agent:main:slack:7", "stream": "lifecycle", "data": {"phase": "start"}
            }}),
        )
        .await;
        for _ in 0..10 {
            ws.send(Message::Ping(Vec::new())).await.expect("ping");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let status = next_request(&mut ws).await;
        assert_eq!(status.method, "status");
        reply_ok(&mut ws, &status.id, json!({"ok": true})).await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "chat", "payload": {
                "runId": "run-7", "sessionKey": "agent:main:slack:7", "state": "final"
            }}),
        )
        .await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = GatewayConfig {
        stale_after: Duration::from_millis(400),
        ..fast_config(url)
    };
    let client = GatewayClient::create(config).expect("client");
    let mut events = client.subscribe();
    client.connect().await.expect("connect");
    next_event(&mut events, |event| matches!(event, GatewayEvent::Connected(_))).await;
    wait_for_runs(&client, |runs| runs.contains("agent:main:slack:7")).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(client.status().is_connected());
    assert_eq!(
        client.request("status", json!({})).await,
        Ok(json!({"ok": true}))
    );
    wait_for_runs(&client, |runs| runs.is_empty()).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, GatewayEvent::Disconnected { .. }),
            "socket dropped while pinged"
        );
    }

    client.dispose().await;
    timeout(WAIT, server).await.expect("server done").expect("server ok");
}
