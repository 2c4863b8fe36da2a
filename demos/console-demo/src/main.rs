//! Console session walkthrough against the loopback host.
//!
//! Run with: cargo run -p console-demo
//!
//! Set `RUST_LOG=debug` to see per-message traffic.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use numinon_core::{ConsoleConfig, EventBus, MessageType, TransportHost};
use numinon_session::SessionManager;
use numinon_transport::{LoopbackHost, NotificationPump, PresentationAdapter};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ConsoleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Could not load config, using defaults");
        ConsoleConfig::default()
    });
    let url = config.connection.server_url.clone();

    let bus = EventBus::new();
    let (notifications, pump) = NotificationPump::new(bus.clone());
    let pump = pump.spawn();

    let host = Arc::new(LoopbackHost::new(notifications, config.connection.reconnect));
    let dyn_host: Arc<dyn TransportHost> = host.clone();
    let session = SessionManager::from_config(dyn_host, bus, &config);

    let adapter = PresentationAdapter::new(session.clone());
    adapter.activate();

    let mut status = adapter.status_stream();
    let watcher = tokio::spawn(async move {
        while let Some(status) = status.next().await {
            println!(
                "[status] {} attempt={} latency={:?}",
                status.phase, status.reconnect_attempt, status.latency_ms
            );
        }
    });

    // Queued while offline, delivered on connect.
    let receipt = adapter.send("ping", json!({})).await?;
    println!("ping before connect: {receipt:?}");

    adapter.connect(&url).await?;
    println!("delivered after connect: {}", host.sent().len());

    host.report_latency(24);
    host.report_latency(31);
    settle().await;
    println!("average latency: {} ms", adapter.average_latency_ms());

    let params = HashMap::from([("command".to_string(), json!("whoami"))]);
    let task_id = adapter.dispatch_task("agent_001", "cmd", params).await?;
    host.complete_task(&task_id, json!("operator"));
    settle().await;
    if let Some(result) = adapter.latest("task:result") {
        println!("task result: {}", result.data);
    }

    host.drop_link(1);
    settle().await;
    adapter
        .send(MessageType::Notification.as_str(), json!({"text": "sent while reconnecting"}))
        .await?;
    println!("queued during reconnect: {}", session.queued_messages().await.len());

    host.restore_link();
    settle().await;
    println!("delivered after restore: {}", host.sent().len());

    let stats = session.queue_stats().await;
    println!("queue: {stats:?}");

    adapter.disconnect().await?;
    settle().await;

    drop(adapter);
    drop(session);
    drop(host);
    pump.await?;
    watcher.abort();
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
