mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(state: std::sync::Arc<px_bridge::ApiState>) -> String {
    let router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn connect(addr: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
        .await
        .unwrap();
    stream
}

async fn subscribe(ws: &mut WsStream, topics: &[&str]) {
    let frame = serde_json::json!({"type": "subscribe", "topics": topics});
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
    // No ack frame; give the server a beat to apply the subscription.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Read frames until a data-bearing `event` frame arrives (transport pings
/// are skipped), or time out.
async fn next_event(ws: &mut WsStream) -> Option<serde_json::Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "event" {
                    return Some(value);
                }
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn event_fan_out_respects_subscriptions() {
    // Seed scenario 5: C1 subscribes to experiment.*, C2 to
    // metrics.update; each receives only its own topics.
    let state = dev_state().await;
    let addr = serve(state.clone()).await;

    let mut c1 = connect(&addr).await;
    let mut c2 = connect(&addr).await;
    subscribe(&mut c1, &["experiment.*"]).await;
    subscribe(&mut c2, &["metrics.update"]).await;

    // Creating an experiment publishes experiment.created on the bus.
    let app = app(state.clone());
    let (_, created) = send(&app, post_json("/api/v1/experiments", experiment_body())).await;
    let experiment_id = created["id"].as_str().unwrap();

    let event = next_event(&mut c1).await.expect("c1 should see the event");
    assert_eq!(event["payload"]["type"], "experiment.created");
    assert_eq!(event["payload"]["data"]["experiment_id"], experiment_id);
    assert!(event["timestamp"].is_string());

    // A metrics event reaches only C2.
    state.bus.publish(px_core::bus::Event::new(
        "metrics.update",
        serde_json::json!({"experiment_id": experiment_id}),
    ));
    let event = next_event(&mut c2).await.expect("c2 should see metrics");
    assert_eq!(event["payload"]["type"], "metrics.update");

    // Neither client sees the other's topic.
    assert!(next_event(&mut c2).await.is_none());
    assert!(next_event(&mut c1).await.is_none());
}

#[tokio::test]
async fn ping_frame_gets_pong_with_timestamp() {
    let state = dev_state().await;
    let addr = serve(state).await;
    let mut ws = connect(&addr).await;

    ws.send(Message::Text(
        serde_json::json!({"type": "ping"}).to_string().into(),
    ))
    .await
    .unwrap();

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "pong");
            assert!(value["timestamp"].is_string());
            break;
        }
    }
}

#[tokio::test]
async fn malformed_frame_gets_error_frame() {
    let state = dev_state().await;
    let addr = serve(state).await;
    let mut ws = connect(&addr).await;

    ws.send(Message::Text("{\"type\":\"nonsense\"}".into()))
        .await
        .unwrap();

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "error");
            assert_eq!(value["code"], "bad_frame");
            break;
        }
    }
}

#[tokio::test]
async fn unsubscribe_stops_the_stream() {
    let state = dev_state().await;
    let addr = serve(state.clone()).await;
    let mut ws = connect(&addr).await;
    subscribe(&mut ws, &["task.failed"]).await;

    state.bus.publish(px_core::bus::Event::new(
        "task.failed",
        serde_json::json!({"task_id": "task-1"}),
    ));
    assert!(next_event(&mut ws).await.is_some());

    let frame = serde_json::json!({"type": "unsubscribe", "topics": ["task.failed"]});
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    state.bus.publish(px_core::bus::Event::new(
        "task.failed",
        serde_json::json!({"task_id": "task-2"}),
    ));
    assert!(next_event(&mut ws).await.is_none());
}
