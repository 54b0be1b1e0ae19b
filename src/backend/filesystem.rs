use super::{Backend, BackendFailure, Metadata, unsupported};
use crate::config::{StageConfig, StageKind};
use crate::error::Error;
use crate::message::ArchiveId;
use async_trait::async_trait;
use chrono::Datelike;
use std::path::PathBuf;
use std::sync::Arc;

/// Stores raw messages as `<storagedir>/<year>/<month>/<sequence>`.
#[derive(Debug)]
pub struct FilesystemBackend {
    storagedir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(storagedir: PathBuf) -> Result<Self, Error> {
        if !storagedir.is_dir() {
            return Err(Error::BadStorageDir(storagedir));
        }
        Ok(Self { storagedir })
    }

    pub(super) fn create(config: &StageConfig) -> Result<Arc<dyn Backend>, Error> {
        if config.kind != StageKind::Storage {
            return Err(unsupported("filesystem", config.kind));
        }
        let storagedir = config
            .storagedir
            .clone()
            .ok_or_else(|| Error::MissingSetting(config.kind.to_string(), "storagedir"))?;
        let backend = Self::new(storagedir)?;
        log::info!(
            "Filesystem Backend ({}) at {}",
            config.kind,
            backend.storagedir.display()
        );
        Ok(Arc::new(backend))
    }

    fn paths(&self, id: ArchiveId, month: u32) -> (PathBuf, PathBuf) {
        let mailpath = self
            .storagedir
            .join(id.year.to_string())
            .join(month.to_string());
        let filename = mailpath.join(id.sequence.to_string());
        (mailpath, filename)
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    async fn process(&self, metadata: &Metadata<'_>) -> Result<ArchiveId, BackendFailure> {
        let Metadata::Storage(storage) = metadata else {
            return Err(BackendFailure::new(443, "Filesystem Backend: archive metadata not supported"));
        };
        let (mailpath, filename) = self.paths(storage.id, storage.date.month());

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        if let Err(e) = builder.create(&mailpath).await {
            log::error!("Filesystem Backend: Cannot create storage directory: {e}");
            return Err(BackendFailure::new(443, format!("Cannot create storage directory: {e}")));
        }

        if let Err(e) = tokio::fs::write(&filename, storage.data).await {
            log::error!("Filesystem Backend: Cannot write mail file: {e}");
            return Err(BackendFailure::new(443, format!("Cannot write mail file: {e}")));
        }
        log::debug!("Filesystem Backend: wrote {}", filename.display());
        Ok(storage.id)
    }

    async fn shutdown(&self) {
        log::info!("Filesystem Backend: shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageMetadata;
    use chrono::{Local, TimeZone};
    use testresult::TestResult;

    #[tokio::test]
    async fn test_writes_mail_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::new(dir.path().to_path_buf())?;
        let date = Local.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let metadata = Metadata::Storage(StorageMetadata {
            data: b"Subject: hi\r\n\r\nhello",
            id: ArchiveId::new(2024, 1),
            date,
        });

        assert_eq!(backend.process(&metadata).await, Ok(ArchiveId::new(2024, 1)));
        let stored = std::fs::read(dir.path().join("2024").join("3").join("1"))?;
        assert_eq!(stored, b"Subject: hi\r\n\r\nhello");
        Ok(())
    }

    #[test]
    fn test_missing_storage_dir() {
        assert!(FilesystemBackend::new(PathBuf::from("/nonexistent/archiver")).is_err());
    }
}
