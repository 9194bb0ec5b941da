//! Minimal publish-only client for the kernel's cached data server.
//!
//! Speaks the same JSON-lines protocol as any console, but only ever sends
//! publish messages; server replies are ignored.

use anyhow::{Context, Result};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct CdsClient {
    stream: TcpStream,
}

impl CdsClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to cached data server at {addr}"))?;
        Ok(Self { stream })
    }

    pub async fn publish(&mut self, field: &str, value: serde_json::Value) -> Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let msg = json!({ "type": "publish", "data": { field: [[ts, value]] } });
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        self.stream
            .write_all(&line)
            .await
            .context("writing publish to cached data server")?;
        Ok(())
    }
}
