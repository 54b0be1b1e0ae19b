use super::{Backend, BackendFailure, Metadata};
use crate::config::{StageConfig, StageKind};
use crate::error::Error;
use crate::message::ArchiveId;
use async_trait::async_trait;
use chrono::{Datelike, Local};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logs what it is given and hands out sequential ids for the current year.
#[derive(Debug)]
pub struct DebugBackend {
    stage: StageKind,
    sequence: AtomicU64,
}

impl DebugBackend {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            sequence: AtomicU64::new(0),
        }
    }

    pub(super) fn create(config: &StageConfig) -> Result<Arc<dyn Backend>, Error> {
        log::info!("Debug Backend ({})", config.kind);
        Ok(Arc::new(Self::new(config.kind)))
    }
}

#[async_trait]
impl Backend for DebugBackend {
    async fn process(&self, metadata: &Metadata<'_>) -> Result<ArchiveId, BackendFailure> {
        match metadata {
            Metadata::Archive(archive) => {
                let attachments: Vec<String> = archive
                    .attachments
                    .iter()
                    .map(|a| format!("{} ({})", a.name, a.content_type))
                    .collect();
                log::info!(
                    "[DebugBackend] {}: {} from {:?} to {:?} cc {:?} subject {:?} date {} size {}",
                    self.stage,
                    archive.message_id,
                    archive.from,
                    archive.to,
                    archive.cc,
                    archive.subject,
                    archive.date.to_rfc2822(),
                    archive.size
                );
                log::info!(
                    "[DebugBackend] {}: attachments {attachments:?} mailboxes {:?}",
                    self.stage,
                    archive.mailboxes
                );
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(ArchiveId::new(Local::now().year(), sequence))
            }
            Metadata::Storage(storage) => {
                log::info!(
                    "[DebugBackend] {}: {} - {} bytes",
                    self.stage,
                    storage.id,
                    storage.data.len()
                );
                Ok(storage.id)
            }
        }
    }

    async fn shutdown(&self) {
        log::info!("Debug Backend ({}): shutting down", self.stage);
    }
}
