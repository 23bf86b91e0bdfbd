//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rpc_mux_gateway::frame::{encode_message, Frame, Metadata};
use rpc_mux_gateway::http::WEBSOCKET_PROTOCOL;
use rpc_mux_gateway::services::EchoService;
use rpc_mux_gateway::{Gateway, GatewayConfig, HttpServer, Shutdown};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A gateway serving the echo service on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let gateway = Gateway::new(Arc::new(EchoService), config.clone())
        .with_endpoints(EchoService::lister())
        .with_shutdown(shutdown.token());
    let server = HttpServer::new(config, gateway);
    let signal = shutdown.subscribe();
    tokio::spawn(async move {
        server.run(listener, signal).await.unwrap();
    });

    TestGateway { addr, shutdown }
}

/// Open a multiplexed channel, asserting the subprotocol was accepted.
pub async fn connect_channel(addr: SocketAddr) -> WsClient {
    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_static(WEBSOCKET_PROTOCOL),
    );
    let (ws, response) = connect_async(request).await.unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], WEBSOCKET_PROTOCOL);
    ws
}

pub async fn send_frame(ws: &mut WsClient, frame: Frame) {
    ws.send(Message::Binary(frame.encode())).await.unwrap();
}

/// Next frame from the gateway, skipping transport pings.
pub async fn recv_frame(ws: &mut WsClient) -> Frame {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame");
        match next {
            Some(Ok(Message::Binary(data))) => return Frame::decode(&data).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("unexpected websocket message: {:?}", other),
        }
    }
}

/// Header frame opening `operation` on `stream_id`.
pub fn open(stream_id: u32, operation: &str) -> Frame {
    Frame::header(stream_id, operation, Metadata::new(), 0)
}

/// Body frame carrying one framed message.
pub fn message(stream_id: u32, payload: &[u8], complete: bool) -> Frame {
    Frame::body(stream_id, encode_message(0, payload).to_vec(), complete)
}
