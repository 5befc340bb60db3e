use futures::{SinkExt, StreamExt};
use persona_rt::protocol::{SessionDescription, SignalBody, SignalMessage};
use persona_rt::sdk::{ChannelEvent, ChannelPolicy, ChannelState, SignallingChannel};
use persona_rt::transport::ws::WsConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

const SESSION: &str = "ws-session";

async fn next_channel_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("channel events ended")
}

#[tokio::test]
async fn signalling_round_trip_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local test server");
    let addr = listener.local_addr().expect("local addr");

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept connection");
        let mut ws = tokio_tungstenite::accept_async(socket).await.expect("websocket handshake");

        let received = loop {
            let frame = ws.next().await.expect("client message").expect("websocket frame");
            if let Message::Text(text) = frame {
                let message: SignalMessage = serde_json::from_str(&text).expect("valid signal message");
                if message.body != SignalBody::Heartbeat {
                    break message;
                }
            }
        };

        let foreign = SignalMessage::new("another-session", SignalBody::Warning("not for you".into()));
        let answer = SignalMessage::new(SESSION, SignalBody::Answer(SessionDescription::answer("v=0 from server")));
        for message in [foreign, answer] {
            let text = serde_json::to_string(&message).expect("serialize");
            ws.send(Message::Text(text.into())).await.expect("send");
        }
        ws.send(Message::Text("{ not json".to_string().into())).await.expect("send");
        ws.close(None).await.expect("close");
        received
    });

    let url = Url::parse(&format!("ws://{addr}/ws?session_id={SESSION}")).unwrap();
    let policy = ChannelPolicy {
        max_reconnect_attempts: 0,
        ..ChannelPolicy::default()
    };
    let (channel, mut events) = SignallingChannel::spawn(SESSION, Arc::new(WsConnector::new(url)), policy);

    channel.send(SignalBody::Warning("queued before connect".into()));
    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(next_channel_event(&mut events).await, ChannelEvent::Connected);

    match next_channel_event(&mut events).await {
        ChannelEvent::Message(message) => {
            assert_eq!(message.session_id, SESSION);
            assert_eq!(message.body, SignalBody::Answer(SessionDescription::answer("v=0 from server")));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // The server hangs up and no reconnect budget is left.
    assert_eq!(next_channel_event(&mut events).await, ChannelEvent::ConnectionFailed);
    assert_eq!(channel.state(), ChannelState::Failed);

    let received = server.await.unwrap();
    assert_eq!(received.session_id, SESSION);
    assert_eq!(received.body, SignalBody::Warning("queued before connect".into()));
}
