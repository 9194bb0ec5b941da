//! Writer stages. Every record that comes out of the transform chain is
//! handed to each sink in turn; a sink error is fatal for the pipeline.

use crate::cds::CdsClient;
use crate::spec::WriterStage;
use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub enum Sink {
    File(tokio::fs::File),
    Udp { socket: UdpSocket, addr: String },
    CachedData { client: CdsClient, field: String },
}

impl Sink {
    pub async fn write(&mut self, record: &str) -> Result<()> {
        match self {
            Sink::File(file) => {
                file.write_all(record.as_bytes()).await?;
                file.write_all(b"\n").await?;
                Ok(())
            }
            Sink::Udp { socket, addr } => {
                socket
                    .send_to(record.as_bytes(), addr.as_str())
                    .await
                    .with_context(|| format!("sending datagram to {addr}"))?;
                Ok(())
            }
            Sink::CachedData { client, field } => {
                client
                    .publish(field, serde_json::Value::String(record.to_string()))
                    .await
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Sink::File(file) = self {
            file.flush().await?;
        }
        Ok(())
    }
}

pub async fn build_sinks(writers: &[WriterStage], cds_addr: Option<&str>) -> Result<Vec<Sink>> {
    let mut sinks = Vec::with_capacity(writers.len());
    for writer in writers {
        let sink = match writer {
            WriterStage::File { path } => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening {path} for append"))?;
                Sink::File(file)
            }
            WriterStage::Udp { addr } => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .context("binding udp writer socket")?;
                Sink::Udp { socket, addr: addr.clone() }
            }
            WriterStage::CachedData { field } => {
                let Some(addr) = cds_addr else {
                    bail!("cached_data writer configured but PELORUS_CDS not set");
                };
                let client = CdsClient::connect(addr).await?;
                Sink::CachedData { client, field: field.clone() }
            }
        };
        sinks.push(sink);
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let spec = vec![WriterStage::File { path: path.to_string_lossy().into_owned() }];

        let mut sinks = build_sinks(&spec, None).await.unwrap();
        sinks[0].write("first").await.unwrap();
        sinks[0].write("second").await.unwrap();
        sinks[0].flush().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_udp_sink_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap().to_string();

        let spec = vec![WriterStage::Udp { addr }];
        let mut sinks = build_sinks(&spec, None).await.unwrap();
        sinks[0].write("$WIMWV,214,R,7.2,N,A*0F").await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$WIMWV,214,R,7.2,N,A*0F");
    }

    #[tokio::test]
    async fn test_cached_data_sink_requires_address() {
        let spec = vec![WriterStage::CachedData { field: "raw:gyr1".into() }];
        let err = build_sinks(&spec, None).await.unwrap_err();
        assert!(err.to_string().contains("PELORUS_CDS"));
    }

    #[tokio::test]
    async fn test_cached_data_sink_publishes_json_line() {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let spec = vec![WriterStage::CachedData { field: "raw:gyr1".into() }];
        let mut sinks = build_sinks(&spec, Some(&addr)).await.unwrap();

        let (server_side, _) = listener.accept().await.unwrap();
        sinks[0].write("$HEHDT,235.18,T*1b").await.unwrap();

        let mut lines = BufReader::new(server_side).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(msg["type"], "publish");
        let point = &msg["data"]["raw:gyr1"][0];
        assert!(point[0].as_f64().unwrap() > 0.0);
        assert_eq!(point[1], "$HEHDT,235.18,T*1b");
    }
}
