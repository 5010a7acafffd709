use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not load run options because file {0:?} does not exist")]
    Missing(PathBuf),
    #[error("Run options failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Malformed '{directive}' directive: {reason}")]
    Malformed { directive: String, reason: String },
    #[error("Run mode document is not an object")]
    BadDocument,
}

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("Channel block at word {index} runs past the end of the BLT ({size_words} words)")]
    OutOfBounds { index: usize, size_words: usize },
    #[error("Invalid channel {0} found while splitting a BLT")]
    BadChannel(u8),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Document store at {0} is unreachable")]
    Unavailable(String),
    #[error("Document store operation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink has no connection and reconnecting failed: {0}")]
    Unavailable(#[from] StoreError),
    #[error("Sink insert failed: {0}")]
    InsertFailed(String),
    #[error("Payload compression failed: {0}")]
    Compression(#[from] snap::Error),
}

#[derive(Debug, Error)]
pub enum FileSinkError {
    #[error("File sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("File sink failed to encode an event: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("File sink was given unknown event handle {0}")]
    BadHandle(i32),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unrecognized control command '{0}'")]
    Invalid(String),
    #[error("A run named {name} already exists for detector {detector}")]
    RunDuplicate { name: String, detector: String },
    #[error("Run mode '{0}' could not be resolved")]
    ModeMissing(String),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Provisioner failed due to store error: {0}")]
    Store(#[from] StoreError),
    #[error("Bad shard configuration: {0}")]
    BadShardConfig(String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Processor failed due to sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Processor failed due to file sink error: {0}")]
    File(#[from] FileSinkError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator failed due to store error: {0}")]
    Store(#[from] StoreError),
    #[error("Orchestrator failed due to command error: {0}")]
    Command(#[from] CommandError),
    #[error("Orchestrator failed due to provisioning error: {0}")]
    Provision(#[from] ProvisionError),
    #[error("Orchestrator failed due to configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Orchestrator has no connection to the {0} database")]
    NoConnection(&'static str),
}
