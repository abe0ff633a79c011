// SPDX-License-Identifier: Apache-2.0

//! File-based backend.
//!
//! One directory per target, one file per region. Region files are named by
//! the hex form of a 16-byte id minted at create time, their length is the
//! region's declared size, and `persist` maps to `sync_data`. Migration
//! exports the target directory; recovery adopts the migrated directory as
//! the new target root.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use super::{
    validate_payload, validate_spans, Backend, BackendFactory, GateState, MigrationHandle,
    ReadableRegion, TargetGate, WritableRegion,
};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::types::{span_total, RegionId, Span};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileTargetConfig {
    path: String,
    #[serde(default)]
    create_if_missing: bool,
    #[serde(default)]
    override_if_exists: bool,
}

fn parse_config(config: &Value) -> Result<FileTargetConfig> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Config(format!("invalid file target configuration: {e}")))
}

fn io_error(what: &str, path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("{what} {} not found", path.display()))
    } else {
        Error::Backend(format!("{what} {}: {e}", path.display()))
    }
}

/// Factory for the `"file"` backend type.
pub struct FileFactory;

#[async_trait]
impl BackendFactory for FileFactory {
    fn validate(&self, config: &Value) -> Result<()> {
        let cfg = parse_config(config)?;
        if !Path::new(&cfg.path).exists() && !cfg.create_if_missing {
            return Err(Error::Config(format!(
                "directory {} does not exist and \"create_if_missing\" was not set",
                cfg.path
            )));
        }
        Ok(())
    }

    async fn create(&self, _engine: Arc<Engine>, config: Value) -> Result<Arc<dyn Backend>> {
        let cfg = parse_config(&config)?;
        let dir = PathBuf::from(&cfg.path);
        if dir.exists() && cfg.override_if_exists {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::Backend(format!("could not clear {}: {e}", dir.display())))?;
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Backend(format!(
                "could not create target directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Arc::new(FileTarget {
            dir,
            config,
            gate: TargetGate::new(),
        }))
    }

    async fn recover(
        &self,
        _engine: Arc<Engine>,
        mut config: Value,
        files: Vec<String>,
    ) -> Result<Arc<dyn Backend>> {
        // The directory entry in the file set names the new target root.
        let dir = files
            .iter()
            .find(|f| f.ends_with('/'))
            .map(|f| PathBuf::from(f.trim_end_matches('/')))
            .ok_or_else(|| {
                Error::Backend("migrated file set does not contain a target directory".into())
            })?;
        if !dir.is_dir() {
            return Err(Error::Backend(format!(
                "migrated target directory {} is missing",
                dir.display()
            )));
        }
        if let Some(obj) = config.as_object_mut() {
            obj.insert("path".into(), Value::String(dir.display().to_string()));
        }
        Ok(Arc::new(FileTarget {
            dir,
            config,
            gate: TargetGate::new(),
        }))
    }
}

struct FileTarget {
    dir: PathBuf,
    config: Value,
    gate: TargetGate,
}

impl FileTarget {
    fn region_path(&self, id: &RegionId) -> PathBuf {
        self.dir.join(id.to_hex())
    }
}

struct FileRegion {
    id: RegionId,
    size: u64,
    path: PathBuf,
    _gate: OwnedRwLockReadGuard<GateState>,
}

#[async_trait]
impl WritableRegion for FileRegion {
    fn id(&self) -> RegionId {
        self.id.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn write(&self, spans: &[Span], data: &[u8], persist: bool) -> Result<()> {
        validate_spans(spans, self.size)?;
        validate_payload(spans, data.len())?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error("region file", &self.path, e))?;
        let mut cursor = 0usize;
        for span in spans {
            if span.len == 0 {
                continue;
            }
            let len = span.len as usize;
            file.seek(SeekFrom::Start(span.offset))
                .await
                .map_err(|e| io_error("failed to seek in", &self.path, e))?;
            file.write_all(&data[cursor..cursor + len])
                .await
                .map_err(|e| io_error("failed to write", &self.path, e))?;
            cursor += len;
        }
        if persist {
            file.sync_data()
                .await
                .map_err(|e| io_error("failed to sync", &self.path, e))?;
        }
        Ok(())
    }

    async fn persist(&self, spans: &[Span]) -> Result<()> {
        validate_spans(spans, self.size)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error("region file", &self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| io_error("failed to sync", &self.path, e))
    }
}

#[async_trait]
impl ReadableRegion for FileRegion {
    fn id(&self) -> RegionId {
        self.id.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, spans: &[Span]) -> Result<Vec<u8>> {
        validate_spans(spans, self.size)?;
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error("region file", &self.path, e))?;
        let mut out = vec![0u8; span_total(spans) as usize];
        let mut cursor = 0usize;
        for span in spans {
            if span.len == 0 {
                continue;
            }
            let len = span.len as usize;
            file.seek(SeekFrom::Start(span.offset))
                .await
                .map_err(|e| io_error("failed to seek in", &self.path, e))?;
            file.read_exact(&mut out[cursor..cursor + len])
                .await
                .map_err(|e| io_error("failed to read", &self.path, e))?;
            cursor += len;
        }
        Ok(out)
    }
}

#[async_trait]
impl Backend for FileTarget {
    fn name(&self) -> &'static str {
        "file"
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    async fn create(&self, size: u64) -> Result<Box<dyn WritableRegion>> {
        let gate = self.gate.enter().await?;
        let id = RegionId::new(uuid::Uuid::new_v4().into_bytes().to_vec());
        let path = self.region_path(&id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::Backend(format!("could not create {}: {e}", path.display())))?;
        file.set_len(size)
            .await
            .map_err(|e| Error::Backend(format!("could not size {}: {e}", path.display())))?;
        Ok(Box::new(FileRegion {
            id,
            size,
            path,
            _gate: gate,
        }))
    }

    async fn write(&self, id: &RegionId, _persist_hint: bool) -> Result<Box<dyn WritableRegion>> {
        let gate = self.gate.enter().await?;
        let path = self.region_path(id);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::NotFound(format!("region {id} not found")))?;
        Ok(Box::new(FileRegion {
            id: id.clone(),
            size: meta.len(),
            path,
            _gate: gate,
        }))
    }

    async fn read(&self, id: &RegionId) -> Result<Box<dyn ReadableRegion>> {
        let gate = self.gate.enter().await?;
        let path = self.region_path(id);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::NotFound(format!("region {id} not found")))?;
        Ok(Box::new(FileRegion {
            id: id.clone(),
            size: meta.len(),
            path,
            _gate: gate,
        }))
    }

    async fn erase(&self, id: &RegionId) -> Result<()> {
        let _gate = self.gate.enter().await?;
        let path = self.region_path(id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| Error::NotFound(format!("region {id} not found")))
    }

    async fn destroy(&self) -> Result<()> {
        let mut gate = self.gate.freeze().await?;
        gate.mark_destroyed();
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Backend(format!("could not remove {}: {e}", self.dir.display())))
    }

    async fn start_migration(&self, remove_source: bool) -> Result<Box<dyn MigrationHandle>> {
        let guard = self.gate.freeze().await?;

        let dir_name = self
            .dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Backend("target directory has no name".into()))?
            .to_string();
        let root = self
            .dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Backend("target directory has no parent".into()))?;

        let mut files = vec![format!("{dir_name}/")];
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Backend(format!("could not list {}: {e}", self.dir.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Backend(format!("could not list {}: {e}", self.dir.display())))?
        {
            files.push(format!("{dir_name}/{}", entry.file_name().to_string_lossy()));
        }

        Ok(Box::new(FileMigrationHandle {
            guard: Some(guard),
            root,
            files,
            dir: self.dir.clone(),
            remove_source,
            cancelled: false,
        }))
    }
}

struct FileMigrationHandle {
    guard: Option<OwnedRwLockWriteGuard<GateState>>,
    root: PathBuf,
    files: Vec<String>,
    dir: PathBuf,
    remove_source: bool,
    cancelled: bool,
}

impl MigrationHandle for FileMigrationHandle {
    fn root(&self) -> &Path {
        &self.root
    }

    fn files(&self) -> &[String] {
        &self.files
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

impl Drop for FileMigrationHandle {
    fn drop(&mut self) {
        if !self.cancelled {
            if let Some(mut guard) = self.guard.take() {
                guard.mark_migrated();
                if self.remove_source {
                    let _ = std::fs::remove_dir_all(&self.dir);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_target(dir: &Path) -> Arc<dyn Backend> {
        let engine = Engine::new("127.0.0.1:0").await.unwrap();
        FileFactory
            .create(
                engine,
                serde_json::json!({
                    "path": dir.join("target").display().to_string(),
                    "create_if_missing": true,
                }),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_write_read_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let target = make_target(tmp.path()).await;

        let region = target.create(32).await.unwrap();
        let id = region.id();
        region
            .write(&[Span::new(4, 5)], b"hello", true)
            .await
            .unwrap();
        region.persist(&[Span::new(4, 5)]).await.unwrap();
        drop(region);

        let region = target.read(&id).await.unwrap();
        assert_eq!(region.size(), 32);
        // Unwritten bytes read back as zeros.
        assert_eq!(
            region.read(&[Span::new(0, 10)]).await.unwrap(),
            b"\0\0\0\0hello\0"
        );
    }

    #[tokio::test]
    async fn test_unknown_region_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let target = make_target(tmp.path()).await;
        let bogus = RegionId::new(vec![9u8; 16]);
        assert!(matches!(target.read(&bogus).await, Err(Error::NotFound(_))));
        assert!(matches!(
            target.erase(&bogus).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_erase_finality() {
        let tmp = tempfile::tempdir().unwrap();
        let target = make_target(tmp.path()).await;
        let region = target.create(8).await.unwrap();
        let id = region.id();
        drop(region);
        target.erase(&id).await.unwrap();
        assert!(matches!(target.read(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_validate_requires_existing_or_creatable_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope").display().to_string();
        let err = FileFactory
            .validate(&serde_json::json!({ "path": missing }))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(FileFactory
            .validate(&serde_json::json!({ "path": tmp.path().join("nope").display().to_string(), "create_if_missing": true }))
            .is_ok());
        assert!(matches!(
            FileFactory.validate(&serde_json::json!({})),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let target = make_target(tmp.path()).await;
        let region = target.create(8).await.unwrap();
        drop(region);
        target.destroy().await.unwrap();
        assert!(!tmp.path().join("target").exists());
        assert!(matches!(target.create(8).await, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_migration_manifest_lists_regions() {
        let tmp = tempfile::tempdir().unwrap();
        let target = make_target(tmp.path()).await;
        let region = target.create(8).await.unwrap();
        let id = region.id();
        drop(region);

        let mut handle = target.start_migration(false).await.unwrap();
        assert_eq!(handle.root(), tmp.path());
        assert!(handle.files().contains(&"target/".to_string()));
        assert!(handle
            .files()
            .contains(&format!("target/{}", id.to_hex())));
        handle.cancel();
        drop(handle);

        // Cancelled: the target still works.
        assert!(target.read(&id).await.is_ok());
    }
}
