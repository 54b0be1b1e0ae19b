//! Pluggable archival backends and their static registry.

use crate::config::{StageConfig, StageKind};
use crate::error::Error;
use crate::message::{ArchiveId, Attachment};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::sync::Arc;

pub(crate) mod debug;
pub(crate) mod filesystem;

use debug::DebugBackend;
use filesystem::FilesystemBackend;

/// Metadata extracted by the archive stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub message_id: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub date: DateTime<Local>,
    pub attachments: Vec<Attachment>,
    /// Local mailboxes allowed to read this message.
    pub mailboxes: BTreeSet<String>,
    pub size: usize,
}

/// A message the storage stage received already stamped with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMetadata<'a> {
    pub data: &'a [u8],
    pub id: ArchiveId,
    pub date: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata<'a> {
    Archive(ArchiveMetadata),
    Storage(StorageMetadata<'a>),
}

/// Reply a backend wants relayed to the upstream peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct BackendFailure {
    pub code: u16,
    pub message: String,
}

impl BackendFailure {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Trait implemented by every archival backend.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Archives or stores one message, returning the id it is known under.
    async fn process(&self, metadata: &Metadata<'_>) -> Result<ArchiveId, BackendFailure>;

    /// Releases backend resources at stage teardown.
    async fn shutdown(&self) {}
}

type Constructor = fn(&StageConfig) -> Result<Arc<dyn Backend>, Error>;

/// Every backend selectable by name in a stage section.
const REGISTRY: &[(&str, Constructor)] = &[
    ("debug", DebugBackend::create),
    ("filesystem", FilesystemBackend::create),
];

/// Builds the backend named in the stage configuration.
pub fn create(config: &StageConfig) -> Result<Arc<dyn Backend>, Error> {
    let (_, constructor) = REGISTRY
        .iter()
        .find(|(name, _)| *name == config.backend)
        .ok_or_else(|| Error::BadBackendType(config.backend.clone()))?;
    constructor(config)
}

fn unsupported(backend: &str, stage: StageKind) -> Error {
    Error::StorageTypeNotSupported {
        backend: backend.to_string(),
        stage: stage.to_string(),
    }
}
