//! Pipeline spec contract, mirrored from the kernel.
//!
//! The kernel serializes a `LoggerConfig` into the PELORUS_CONFIG
//! environment variable as JSON; these structs deserialize the same
//! tagged shape. Keep the two sides in sync.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReaderStage {
    Serial { port: String, baud: u32 },
    Udp { port: u16 },
    Tcp { addr: String },
    File {
        path: String,
        #[serde(default)]
        tail: bool,
    },
    Exec { command: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformStage {
    Timestamp,
    Prefix { prefix: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriterStage {
    File { path: String },
    Udp { addr: String },
    CachedData { field: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineSpec {
    #[serde(default)]
    pub readers: Vec<ReaderStage>,
    #[serde(default)]
    pub transforms: Vec<TransformStage>,
    #[serde(default)]
    pub writers: Vec<WriterStage>,
}
