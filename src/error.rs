//! Error types.

/// Error type for the archiver.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Archiver config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Dedup store is corrupted: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bad endpoint {0:?}: expected <protocol>:<host>:<port> or <protocol>:unix:<path>")]
    BadEndpoint(String),
    #[error("Unknown protocol {protocol:?} for stage {stage}")]
    UnknownProtocol { stage: String, protocol: String },
    #[error("Unknown backend {0:?}")]
    BadBackendType(String),
    #[error("Backend {backend} does not support the {stage} stage")]
    StorageTypeNotSupported { backend: String, stage: String },
    #[error("Bad storage directory {0:?}")]
    BadStorageDir(std::path::PathBuf),
    #[error("Stage {0} is not configured")]
    MissingStage(String),
    #[error("Stage {0} is missing the {1} setting")]
    MissingSetting(String, &'static str),
}
