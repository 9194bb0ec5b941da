/**
 * PELORUS RUNNER - One pipeline, one process
 *
 * ROLE:
 * The kernel spawns one runner per active logger and hands it the full
 * pipeline spec through the environment:
 *
 *   PELORUS_LOGGER       logger name (for log lines)
 *   PELORUS_CONFIG_NAME  name of the selected config
 *   PELORUS_CONFIG       pipeline spec as JSON (see spec.rs)
 *   PELORUS_LOG_LEVEL    env_logger filter string
 *   PELORUS_CDS          cached data server address (optional)
 *
 * The runner reads from every reader concurrently, applies the transforms
 * in order, and fans each record out to every writer. It exits 0 when its
 * stdin reaches EOF (the kernel's graceful quit) or when a finite reader
 * set drains; any pipeline error is logged and exits nonzero so the
 * kernel's monitor can pick it up.
 */

mod cds;
mod readers;
mod spec;
mod transforms;
mod writers;

use crate::spec::PipelineSpec;
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Records buffered between readers and the write loop.
const PIPELINE_QUEUE: usize = 1024;

#[tokio::main]
async fn main() {
    let level = std::env::var("PELORUS_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    env_logger::Builder::new().parse_filters(&level).init();

    let logger = std::env::var("PELORUS_LOGGER").unwrap_or_else(|_| "unnamed".into());
    let config_name = std::env::var("PELORUS_CONFIG_NAME").unwrap_or_default();

    match run(&logger, &config_name).await {
        Ok(()) => info!("[{logger}] pipeline stopped cleanly"),
        Err(e) => {
            error!("[{logger}] pipeline failed: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(logger: &str, config_name: &str) -> Result<()> {
    let config_json = std::env::var("PELORUS_CONFIG").context("PELORUS_CONFIG not set")?;
    let spec: PipelineSpec =
        serde_json::from_str(&config_json).context("parsing PELORUS_CONFIG")?;
    let cds_addr = std::env::var("PELORUS_CDS").ok();

    info!(
        "[{logger}] starting config '{config_name}' ({} readers, {} transforms, {} writers)",
        spec.readers.len(),
        spec.transforms.len(),
        spec.writers.len()
    );

    let mut sinks = writers::build_sinks(&spec.writers, cds_addr.as_deref()).await?;

    let (tx, mut rx) = mpsc::channel::<String>(PIPELINE_QUEUE);
    let mut reader_tasks = JoinSet::new();
    for reader in spec.readers.iter().cloned() {
        let tx = tx.clone();
        reader_tasks.spawn(readers::run_reader(reader, tx));
    }
    // The loop's `rx` closes once every reader is done.
    drop(tx);

    let mut quit = std::pin::pin!(wait_for_quit());

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    let record = transforms::apply(&spec.transforms, line);
                    for sink in &mut sinks {
                        sink.write(&record).await?;
                    }
                }
                // All readers finished (e.g. a non-tail file reader hit EOF).
                None => break,
            },
            Some(joined) = reader_tasks.join_next() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(anyhow!("reader task panicked: {e}")),
                }
            }
            _ = &mut quit => {
                info!("[{logger}] quit requested");
                break;
            }
        }
    }

    reader_tasks.shutdown().await;
    for sink in &mut sinks {
        sink.flush().await?;
    }
    Ok(())
}

/// Resolves when stdin reaches EOF: the kernel closes our stdin to ask for
/// a graceful stop before it escalates to a kill.
async fn wait_for_quit() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
