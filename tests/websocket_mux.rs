//! End-to-end tests for multiplexed WebSocket channels.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use rpc_mux_gateway::frame::{encode_message, Frame, Metadata, Payload};
use rpc_mux_gateway::http::WEBSOCKET_PROTOCOL;
use rpc_mux_gateway::services::echo::{STREAM, UNARY};
use rpc_mux_gateway::GatewayConfig;

mod common;
use common::{connect_channel, message, open, recv_frame, send_frame, start_gateway};

#[tokio::test]
async fn test_unary_call_over_channel() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect_channel(gateway.addr).await;

    send_frame(&mut ws, open(7, UNARY)).await;
    send_frame(&mut ws, message(7, b"hi", true)).await;

    assert_eq!(recv_frame(&mut ws).await, Frame::header(7, "", Metadata::new(), 200));
    assert_eq!(recv_frame(&mut ws).await, message(7, b"hi", false));
    assert_eq!(recv_frame(&mut ws).await, Frame::complete(7));
}

#[tokio::test]
async fn test_streams_are_independent() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect_channel(gateway.addr).await;

    send_frame(&mut ws, open(1, STREAM)).await;
    send_frame(&mut ws, open(3, STREAM)).await;
    for (id, payload) in [(3, "x1"), (1, "a"), (3, "x2"), (1, "b"), (1, "c")] {
        send_frame(&mut ws, message(id, payload.as_bytes(), false)).await;
    }
    send_frame(&mut ws, Frame::complete(1)).await;
    send_frame(&mut ws, Frame::complete(3)).await;

    let mut bodies: HashMap<u32, Vec<Vec<u8>>> = HashMap::new();
    let mut completed = 0;
    while completed < 2 {
        let frame = recv_frame(&mut ws).await;
        match frame.payload {
            Payload::Header(h) => assert_eq!(h.status, 200),
            Payload::Body(b) => bodies.entry(frame.stream_id).or_default().push(b.data),
            Payload::Complete => completed += 1,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    let framed = |s: &str| encode_message(0, s.as_bytes()).to_vec();
    assert_eq!(bodies[&1], vec![framed("a"), framed("b"), framed("c")]);
    assert_eq!(bodies[&3], vec![framed("x1"), framed("x2")]);
}

#[tokio::test]
async fn test_stream_limit() {
    let mut config = GatewayConfig::default();
    config.websocket.max_stream_count = 1;
    let gateway = start_gateway(config).await;
    let mut ws = connect_channel(gateway.addr).await;

    send_frame(&mut ws, open(1, STREAM)).await;
    send_frame(&mut ws, open(2, STREAM)).await;
    match recv_frame(&mut ws).await.payload {
        Payload::Failure(f) => assert_eq!(f.error_status, "8"),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_stream_is_forgotten() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect_channel(gateway.addr).await;

    send_frame(&mut ws, open(5, STREAM)).await;
    send_frame(&mut ws, Frame::cancel(5)).await;
    send_frame(&mut ws, message(5, b"late", false)).await;

    match recv_frame(&mut ws).await {
        Frame { stream_id: 5, payload: Payload::Failure(f) } => {
            assert_eq!(f.error_message, "stream does not exist");
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_answered() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect_channel(gateway.addr).await;

    send_frame(&mut ws, Frame::ping(0, false)).await;
    assert_eq!(recv_frame(&mut ws).await, Frame::ping(0, true));
}

#[tokio::test]
async fn test_keepalive_ping() {
    let mut config = GatewayConfig::default();
    config.websocket.ping_interval_secs = 1;
    let gateway = start_gateway(config).await;
    let mut ws = connect_channel(gateway.addr).await;

    assert_eq!(recv_frame(&mut ws).await, Frame::ping(0, true));
}

#[tokio::test]
async fn test_subprotocol_required() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let result = connect_async(format!("ws://{}/", gateway.addr)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cross_origin_upgrade_rejected() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut request = format!("ws://{}/", gateway.addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_static(WEBSOCKET_PROTOCOL),
    );
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_channel() {
    let gateway = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect_channel(gateway.addr).await;
    send_frame(&mut ws, open(1, STREAM)).await;

    gateway.shutdown.trigger();
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("channel stayed open after shutdown");
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}
