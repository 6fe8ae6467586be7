use std::time::Duration;

use fanout_common::protocol::ws::WireMessage;
use fanout_relay::{server, Broker, BrokerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestRelay {
    addr: std::net::SocketAddr,
    broker: Broker,
    stop: Option<oneshot::Sender<()>>,
    server_task: JoinHandle<()>,
}

impl TestRelay {
    async fn start(shards: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let broker = Broker::new(BrokerConfig { shards, pool_retain: 64 });
        let (stop, stopped) = oneshot::channel::<()>();

        let broker_for_server = broker.clone();
        let server_task = tokio::spawn(async move {
            server::serve(listener, broker_for_server, 64 * 1024, async {
                let _ = stopped.await;
            })
            .await
            .expect("relay server should run");
        });

        Self { addr, broker, stop: Some(stop), server_task }
    }

    /// Connects and waits until the broker has registered the device.
    async fn connect(&self, user: &str, device: &str) -> ClientSocket {
        let (socket, _) = connect_async(format!("ws://{}/ws?user={user}&device={device}", self.addr))
            .await
            .expect("client should connect");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.broker.devices_of(user).iter().any(|registered| registered == device) {
            assert!(Instant::now() < deadline, "{user}/{device} was never admitted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        socket
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(5), self.server_task)
            .await
            .expect("server should stop in time")
            .expect("server task should not panic");
    }
}

async fn send_json(socket: &mut ClientSocket, value: Value) {
    socket
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .expect("client should send frame");
}

async fn recv_envelope(socket: &mut ClientSocket) -> WireMessage {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = timeout(remaining, socket.next())
            .await
            .expect("delivery should arrive in time")
            .expect("socket should stay open")
            .expect("frame should be readable");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("delivered frame should be an envelope");
        }
    }
}

/// True when the server closes the socket within the deadline.
async fn closed_by_server(socket: &mut ClientSocket) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, socket.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn message_reaches_receivers_and_sender_siblings_only() {
    let relay = TestRelay::start(4).await;
    let mut u1_web = relay.connect("u1", "web").await;
    let mut u1_mobile = relay.connect("u1", "mobile").await;
    let mut u2_web = relay.connect("u2", "web").await;
    let mut u3_web = relay.connect("u3", "web").await;

    send_json(&mut u1_web, json!({ "payload": { "text": "hi" }, "receivers": ["u2"] })).await;

    let to_u2 = recv_envelope(&mut u2_web).await;
    assert_eq!(to_u2.sender, "u1");
    assert_eq!(to_u2.device, "web");
    assert_eq!(to_u2.receivers, vec!["u2".to_string()]);
    assert!(to_u2.timestamp > 0);
    assert_eq!(to_u2.payload_value().expect("payload"), json!({ "text": "hi" }));
    let to_mobile = recv_envelope(&mut u1_mobile).await;
    assert_eq!(to_mobile.payload_value().expect("payload"), json!({ "text": "hi" }));

    // u3 sees the marker first, so "hi" was never written to it.
    send_json(&mut u2_web, json!({ "payload": "marker", "receivers": ["u1", "u3"] })).await;
    assert_eq!(recv_envelope(&mut u3_web).await.payload_value().expect("payload"), json!("marker"));
    assert_eq!(recv_envelope(&mut u1_web).await.payload_value().expect("payload"), json!("marker"));

    relay.stop().await;
}

#[tokio::test]
async fn binary_frames_are_accepted_and_delivered_as_text() {
    let relay = TestRelay::start(2).await;
    let mut u1_web = relay.connect("u1", "web").await;
    let mut u2_web = relay.connect("u2", "web").await;

    u1_web
        .send(WsMessage::Binary(br#"{"payload":[1,2,3],"receivers":["u2"]}"#.to_vec().into()))
        .await
        .expect("client should send binary frame");

    let delivered = recv_envelope(&mut u2_web).await;
    assert_eq!(delivered.payload_value().expect("payload"), json!([1, 2, 3]));

    relay.stop().await;
}

#[tokio::test]
async fn missing_user_is_rejected_with_validation_error() {
    let relay = TestRelay::start(1).await;

    match connect_async(format!("ws://{}/ws?device=web", relay.addr)).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        Err(other) => panic!("expected an HTTP rejection, got {other:?}"),
        Ok(_) => panic!("upgrade without a user should fail"),
    }
    assert_eq!(relay.broker.connection_count(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn reconnecting_device_replaces_previous_socket() {
    let relay = TestRelay::start(2).await;
    let mut u1_web = relay.connect("u1", "web").await;
    let mut first = relay.connect("u2", "web").await;
    let replaced_before = relay.broker.metrics().snapshot().connections_replaced_total;
    let (mut second, _) = connect_async(format!("ws://{}/ws?user=u2&device=web", relay.addr))
        .await
        .expect("second client should connect");

    assert!(closed_by_server(&mut first).await);
    let deadline = Instant::now() + Duration::from_secs(2);
    while relay.broker.metrics().snapshot().connections_replaced_total == replaced_before {
        assert!(Instant::now() < deadline, "replacement was never registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(relay.broker.devices_of("u2"), vec!["web".to_string()]);

    send_json(&mut u1_web, json!({ "payload": "after reconnect", "receivers": ["u2"] })).await;
    let delivered = recv_envelope(&mut second).await;
    assert_eq!(delivered.payload_value().expect("payload"), json!("after reconnect"));

    relay.stop().await;
}

#[tokio::test]
async fn decode_failure_closes_only_the_offending_socket() {
    let relay = TestRelay::start(2).await;
    let mut u1_web = relay.connect("u1", "web").await;
    let mut u2_web = relay.connect("u2", "web").await;

    u1_web.send(WsMessage::Text("not json".into())).await.expect("client should send frame");
    assert!(closed_by_server(&mut u1_web).await);

    let mut u1_again = relay.connect("u1", "web").await;
    send_json(&mut u1_again, json!({ "payload": 1, "receivers": ["u2"] })).await;
    assert_eq!(recv_envelope(&mut u2_web).await.sender, "u1");

    relay.stop().await;
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let relay = TestRelay::start(2).await;
    let mut u1_web = relay.connect("u1", "web").await;
    let broker = relay.broker.clone();

    relay.stop().await;

    assert!(broker.is_shut_down());
    assert_eq!(broker.connection_count(), 0);
    assert!(closed_by_server(&mut u1_web).await);
}
