use super::store::{Batch, FieldMetadata};
use super::subscriptions::{FieldFilter, SubscriberId};
use super::CachedDataHub;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Outbound queue depth per subscriber; overflow evicts the subscriber.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    Subscribe { fields: HashMap<String, FieldFilter> },
    Ready,
    Publish {
        data: Batch,
        #[serde(default)]
        metadata: Option<HashMap<String, FieldMetadata>>,
    },
    Describe,
}

/// Accept loop: one cooperative task per client connection.
pub async fn serve(hub: Arc<CachedDataHub>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(hub, stream).await {
                        eprintln!("[cache] connection {peer} closed: {e}");
                    }
                });
            }
            Err(e) => {
                eprintln!("[cache] accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

async fn send_json(writer: &mut OwnedWriteHalf, value: serde_json::Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(&value)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Per-connection state machine: CONNECTED -> (subscribe)* -> DELIVERING.
/// Malformed requests are answered with a non-200 status on that request
/// without closing the connection; only disconnect is terminal.
async fn handle_connection(hub: Arc<CachedDataHub>, stream: TcpStream) -> std::io::Result<()> {
    let id = SubscriberId::new();
    let (tx, mut rx) = mpsc::channel::<Batch>(SUBSCRIBER_QUEUE);
    hub.subs.register(id, tx);

    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Flow control: after a data message goes out we hold further batches in
    // `pending` until the client acknowledges with {"type":"ready"}.
    let mut ready = true;
    let mut pending = Batch::new();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break Ok(()) };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientRequest>(&line) {
                    Ok(ClientRequest::Subscribe { fields }) => {
                        let initial = hub.subscribe(id, fields);
                        send_json(&mut writer, json!({"type": "subscribe", "status": 200})).await?;
                        merge(&mut pending, initial);
                        flush(&mut writer, &mut pending, &mut ready).await?;
                    }
                    Ok(ClientRequest::Ready) => {
                        ready = true;
                        flush(&mut writer, &mut pending, &mut ready).await?;
                    }
                    Ok(ClientRequest::Publish { data, metadata }) => {
                        hub.publish(data, metadata);
                    }
                    Ok(ClientRequest::Describe) => {
                        let described = hub.store.describe();
                        send_json(&mut writer, json!({
                            "type": "describe",
                            "status": 200,
                            "data": described,
                        })).await?;
                    }
                    Err(e) => {
                        send_json(&mut writer, json!({
                            "type": "error",
                            "status": 400,
                            "message": format!("bad request: {e}"),
                        })).await?;
                    }
                }
            }
            batch = rx.recv() => {
                // None: the fan-out evicted us for falling behind.
                let Some(batch) = batch else { break Ok(()) };
                merge(&mut pending, batch);
                flush(&mut writer, &mut pending, &mut ready).await?;
            }
        }
    };

    hub.unsubscribe(id);
    result
}

/// Appends newly-arrived points behind whatever is already queued for the
/// field, preserving per-field delivery order.
fn merge(pending: &mut Batch, incoming: Batch) {
    for (field, points) in incoming {
        pending.entry(field).or_default().extend(points);
    }
}

/// Takes the queued batch and restores timestamp order per field: merges
/// across publishes can interleave a late-timestamped publish behind a newer
/// one. Stable sort, so equal timestamps keep arrival order.
fn drain_sorted(pending: &mut Batch) -> Batch {
    let mut data = std::mem::take(pending);
    for points in data.values_mut() {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    data
}

async fn flush(
    writer: &mut OwnedWriteHalf,
    pending: &mut Batch,
    ready: &mut bool,
) -> std::io::Result<()> {
    if !*ready || pending.is_empty() {
        return Ok(());
    }
    let data = drain_sorted(pending);
    *ready = false;
    send_json(writer, json!({"type": "data", "status": 200, "data": data})).await
}
