/**
 * PIPELINE SPEC - Closed set of pipeline stage kinds
 *
 * ROLE:
 * The kernel never interprets pipeline internals; it only validates, compares
 * and serializes them for hand-off to the runner process. The runner carries
 * its own copy of these structs against the same JSON contract.
 *
 * A config with neither readers nor writers is a placeholder ("off"): the
 * logger is registered as intentionally not running instead of being spawned.
 */

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderStage {
    /// Line-oriented read from a serial device node.
    Serial { port: String, baud: u32 },
    /// One datagram per record.
    Udp { port: u16 },
    /// Line-oriented read from a TCP endpoint.
    Tcp { addr: String },
    /// Read (or tail) a file on disk.
    File {
        path: String,
        #[serde(default)]
        tail: bool,
    },
    /// Run a sampling command and read its stdout.
    Exec { command: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformStage {
    /// Prepend an RFC3339 timestamp to each record.
    Timestamp,
    /// Prepend a fixed tag to each record.
    Prefix { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriterStage {
    /// Append records to a file.
    File { path: String },
    /// Send each record as a UDP datagram.
    Udp { addr: String },
    /// Publish each record into the cached data server under a field name.
    CachedData { field: String },
}

/// One named, complete pipeline specification a logger can be assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoggerConfig {
    #[serde(default)]
    pub readers: Vec<ReaderStage>,
    #[serde(default)]
    pub transforms: Vec<TransformStage>,
    #[serde(default)]
    pub writers: Vec<WriterStage>,
    /// When set, only the kernel claiming this host identity may run the config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

impl LoggerConfig {
    /// Placeholder configs (the universal "off") have neither readers nor writers.
    pub fn is_runnable(&self) -> bool {
        !self.readers.is_empty() || !self.writers.is_empty()
    }
}
