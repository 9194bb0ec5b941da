//! Reader stages: each one turns an input source into a stream of text
//! records pushed onto the pipeline channel. Readers for live sources
//! (serial, udp, tcp, tail, exec) run until the process is told to quit;
//! a plain file reader finishes at EOF, which ends the pipeline cleanly.

use crate::spec::ReaderStage;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::net::{TcpStream, UdpSocket};
use tokio::process::Command;
use tokio::sync::mpsc;

pub async fn run_reader(stage: ReaderStage, tx: mpsc::Sender<String>) -> Result<()> {
    match stage {
        ReaderStage::Serial { port, baud } => read_serial(&port, baud, tx).await,
        ReaderStage::Udp { port } => read_udp(port, tx).await,
        ReaderStage::Tcp { addr } => read_tcp(&addr, tx).await,
        ReaderStage::File { path, tail } => read_file(&path, tail, tx).await,
        ReaderStage::Exec { command } => read_exec(&command, tx).await,
    }
}

/// Forwards lines from a buffered source until EOF or until the pipeline
/// channel closes (the main loop is quitting).
async fn forward_lines<R>(reader: R, tx: &mpsc::Sender<String>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn read_serial(port: &str, baud: u32, tx: mpsc::Sender<String>) -> Result<()> {
    // Put the device in raw mode at the requested speed, then consume it as
    // a line-oriented byte stream. A failed stty is logged but not fatal:
    // simulated devices (pty pairs) reject it while working fine otherwise.
    let stty = Command::new("stty")
        .args(["-F", port, "raw", &baud.to_string()])
        .status()
        .await;
    match stty {
        Ok(status) if status.success() => {}
        _ => warn!("stty setup failed for {port}, reading device as-is"),
    }

    let device = tokio::fs::File::open(port)
        .await
        .with_context(|| format!("opening serial device {port}"))?;
    debug!("serial reader attached to {port} at {baud} baud");
    forward_lines(BufReader::new(device), &tx).await
}

async fn read_udp(port: u16, tx: mpsc::Sender<String>) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding udp reader on port {port}"))?;
    debug!("udp reader listening on {port}");
    // One datagram per record; instruments pad with trailing newlines.
    let mut buf = vec![0u8; 65_536];
    loop {
        let (n, _peer) = socket.recv_from(&mut buf).await?;
        let record = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
        if tx.send(record).await.is_err() {
            return Ok(());
        }
    }
}

async fn read_tcp(addr: &str, tx: mpsc::Sender<String>) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting tcp reader to {addr}"))?;
    debug!("tcp reader connected to {addr}");
    forward_lines(BufReader::new(stream), &tx).await
}

async fn read_file(path: &str, tail: bool, tx: mpsc::Sender<String>) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {path}"))?;
    if !tail {
        return forward_lines(BufReader::new(file), &tx).await;
    }

    // Tail mode: start at the current end and poll for appended lines.
    file.seek(SeekFrom::End(0)).await?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        }
        let record = line.trim_end().to_string();
        if tx.send(record).await.is_err() {
            return Ok(());
        }
    }
}

async fn read_exec(command: &str, tx: mpsc::Sender<String>) -> Result<()> {
    let parts = shell_words::split(command)
        .with_context(|| format!("parsing exec command {command:?}"))?;
    let Some((program, args)) = parts.split_first() else {
        bail!("empty exec command");
    };
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    let stdout = child.stdout.take().context("exec child has no stdout")?;
    forward_lines(BufReader::new(stdout), &tx).await?;

    let status = child.wait().await?;
    if !status.success() {
        bail!("exec command {command:?} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_reader_streams_stdout() {
        let (tx, mut rx) = mpsc::channel(16);
        run_reader(
            ReaderStage::Exec { command: "printf 'one\\ntwo\\n'".into() },
            tx,
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_exec_reader_reports_failing_command() {
        let (tx, _rx) = mpsc::channel(16);
        let err = run_reader(ReaderStage::Exec { command: "false".into() }, tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn test_file_reader_finishes_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.log");
        tokio::fs::write(&path, "a\nb\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        run_reader(
            ReaderStage::File { path: path.to_string_lossy().into_owned(), tail: false },
            tx,
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tail_reader_sees_appended_lines() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.log");
        tokio::fs::write(&path, "old line\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let reader = tokio::spawn(run_reader(
            ReaderStage::File { path: path.to_string_lossy().into_owned(), tail: true },
            tx,
        ));

        // Give the tail a moment to seek past the existing content.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"new line\n").await.unwrap();
        file.flush().await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "new line");
        reader.abort();
    }
}
