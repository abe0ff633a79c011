// SPDX-License-Identifier: Apache-2.0

//! Memory-based backend.
//!
//! Regions live in a mutex-guarded map keyed by an 8-byte counter id.
//! Migration spills every region to a temporary directory so memory targets
//! move between providers like any other; the receiving side loads the
//! files back into RAM and discards them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;

use super::{
    validate_payload, validate_spans, Backend, BackendFactory, GateState, MigrationHandle,
    ReadableRegion, TargetGate, WritableRegion,
};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::types::{span_total, RegionId, Span};

type RegionMap = Arc<Mutex<HashMap<RegionId, Arc<Mutex<Vec<u8>>>>>>;

/// Factory for the `"memory"` backend type.
pub struct MemoryFactory;

#[async_trait]
impl BackendFactory for MemoryFactory {
    fn validate(&self, config: &Value) -> Result<()> {
        if !config.is_object() {
            return Err(Error::Config(
                "memory target configuration must be an object".into(),
            ));
        }
        Ok(())
    }

    async fn create(&self, _engine: Arc<Engine>, config: Value) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(MemoryTarget {
            config,
            regions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            gate: TargetGate::new(),
        }))
    }

    async fn recover(
        &self,
        _engine: Arc<Engine>,
        config: Value,
        files: Vec<String>,
    ) -> Result<Arc<dyn Backend>> {
        let mut regions = HashMap::new();
        let mut next_id = 1u64;
        let mut spill_dir: Option<PathBuf> = None;

        for entry in &files {
            if entry.ends_with('/') {
                spill_dir = Some(PathBuf::from(entry.trim_end_matches('/')));
                continue;
            }
            let path = PathBuf::from(entry);
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::Backend(format!("unexpected entry \"{entry}\" in migrated memory target"))
                })?;
            let id = RegionId::from_hex(name)?;
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                Error::Backend(format!("failed to load migrated region {name}: {e}"))
            })?;
            if let Ok(raw) = <[u8; 8]>::try_from(id.as_bytes()) {
                next_id = next_id.max(u64::from_le_bytes(raw) + 1);
            }
            regions.insert(id, Arc::new(Mutex::new(bytes)));
        }

        // The regions now live in RAM; the files were only transport.
        if let Some(dir) = spill_dir {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }

        debug!(regions = regions.len(), "recovered memory target");
        Ok(Arc::new(MemoryTarget {
            config,
            regions: Arc::new(Mutex::new(regions)),
            next_id: AtomicU64::new(next_id),
            gate: TargetGate::new(),
        }))
    }
}

struct MemoryTarget {
    config: Value,
    regions: RegionMap,
    next_id: AtomicU64,
    gate: TargetGate,
}

struct MemoryRegion {
    id: RegionId,
    size: u64,
    data: Arc<Mutex<Vec<u8>>>,
    _gate: OwnedRwLockReadGuard<GateState>,
}

#[async_trait]
impl WritableRegion for MemoryRegion {
    fn id(&self) -> RegionId {
        self.id.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn write(&self, spans: &[Span], data: &[u8], _persist: bool) -> Result<()> {
        validate_spans(spans, self.size)?;
        validate_payload(spans, data.len())?;
        let mut region = self.data.lock();
        let mut cursor = 0usize;
        for span in spans {
            if span.len == 0 {
                continue;
            }
            let len = span.len as usize;
            let offset = span.offset as usize;
            region[offset..offset + len].copy_from_slice(&data[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    async fn persist(&self, spans: &[Span]) -> Result<()> {
        // Nothing to flush; bounds are still checked like a real flush.
        validate_spans(spans, self.size)
    }
}

#[async_trait]
impl ReadableRegion for MemoryRegion {
    fn id(&self) -> RegionId {
        self.id.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, spans: &[Span]) -> Result<Vec<u8>> {
        validate_spans(spans, self.size)?;
        let region = self.data.lock();
        let mut out = Vec::with_capacity(span_total(spans) as usize);
        for span in spans {
            if span.len == 0 {
                continue;
            }
            let offset = span.offset as usize;
            out.extend_from_slice(&region[offset..offset + span.len as usize]);
        }
        Ok(out)
    }
}

impl MemoryTarget {
    fn lookup(&self, id: &RegionId) -> Result<Arc<Mutex<Vec<u8>>>> {
        self.regions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("region {id} not found")))
    }
}

#[async_trait]
impl Backend for MemoryTarget {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    async fn create(&self, size: u64) -> Result<Box<dyn WritableRegion>> {
        let gate = self.gate.enter().await?;
        let id = RegionId::new(
            self.next_id
                .fetch_add(1, Ordering::Relaxed)
                .to_le_bytes()
                .to_vec(),
        );
        let data = Arc::new(Mutex::new(vec![0u8; size as usize]));
        self.regions.lock().insert(id.clone(), data.clone());
        Ok(Box::new(MemoryRegion {
            id,
            size,
            data,
            _gate: gate,
        }))
    }

    async fn write(&self, id: &RegionId, _persist_hint: bool) -> Result<Box<dyn WritableRegion>> {
        let gate = self.gate.enter().await?;
        let data = self.lookup(id)?;
        let size = data.lock().len() as u64;
        Ok(Box::new(MemoryRegion {
            id: id.clone(),
            size,
            data,
            _gate: gate,
        }))
    }

    async fn read(&self, id: &RegionId) -> Result<Box<dyn ReadableRegion>> {
        let gate = self.gate.enter().await?;
        let data = self.lookup(id)?;
        let size = data.lock().len() as u64;
        Ok(Box::new(MemoryRegion {
            id: id.clone(),
            size,
            data,
            _gate: gate,
        }))
    }

    async fn erase(&self, id: &RegionId) -> Result<()> {
        let _gate = self.gate.enter().await?;
        self.regions
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("region {id} not found")))
    }

    async fn destroy(&self) -> Result<()> {
        let mut gate = self.gate.freeze().await?;
        gate.mark_destroyed();
        self.regions.lock().clear();
        Ok(())
    }

    async fn start_migration(&self, remove_source: bool) -> Result<Box<dyn MigrationHandle>> {
        let guard = self.gate.freeze().await?;

        let spill_name = format!("memory-{}", uuid::Uuid::new_v4().simple());
        let root = std::env::temp_dir();
        let spill_dir = root.join(&spill_name);
        tokio::fs::create_dir_all(&spill_dir)
            .await
            .map_err(|e| Error::Backend(format!("failed to create spill directory: {e}")))?;

        let snapshot: Vec<(RegionId, Arc<Mutex<Vec<u8>>>)> = self
            .regions
            .lock()
            .iter()
            .map(|(id, data)| (id.clone(), data.clone()))
            .collect();

        let mut files = vec![format!("{spill_name}/")];
        for (id, data) in snapshot {
            let bytes = data.lock().clone();
            let name = id.to_hex();
            if let Err(e) = tokio::fs::write(spill_dir.join(&name), bytes).await {
                let _ = tokio::fs::remove_dir_all(&spill_dir).await;
                return Err(Error::Backend(format!("failed to spill region {id}: {e}")));
            }
            files.push(format!("{spill_name}/{name}"));
        }

        Ok(Box::new(MemoryMigrationHandle {
            guard: Some(guard),
            root,
            files,
            spill_dir,
            regions: self.regions.clone(),
            remove_source,
            cancelled: false,
        }))
    }
}

struct MemoryMigrationHandle {
    guard: Option<OwnedRwLockWriteGuard<GateState>>,
    root: PathBuf,
    files: Vec<String>,
    spill_dir: PathBuf,
    regions: RegionMap,
    remove_source: bool,
    cancelled: bool,
}

impl MigrationHandle for MemoryMigrationHandle {
    fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn files(&self) -> &[String] {
        &self.files
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

impl Drop for MemoryMigrationHandle {
    fn drop(&mut self) {
        // The spill directory is transport residue either way.
        let _ = std::fs::remove_dir_all(&self.spill_dir);
        if !self.cancelled {
            if let Some(mut guard) = self.guard.take() {
                guard.mark_migrated();
                if self.remove_source {
                    self.regions.lock().clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_target() -> Arc<dyn Backend> {
        let engine = Engine::new("127.0.0.1:0").await.unwrap();
        MemoryFactory
            .create(engine, serde_json::json!({}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let target = make_target().await;
        let region = target.create(16).await.unwrap();
        let id = region.id();
        region
            .write(&[Span::new(0, 5)], b"hello", false)
            .await
            .unwrap();
        drop(region);

        let region = target.read(&id).await.unwrap();
        assert_eq!(region.size(), 16);
        assert_eq!(region.read(&[Span::new(0, 5)]).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_list_order_overlap() {
        let target = make_target().await;
        let region = target.create(8).await.unwrap();
        // The second span overwrites part of the first: list order wins.
        region
            .write(&[Span::new(0, 4), Span::new(2, 4)], b"aaaabbbb", false)
            .await
            .unwrap();
        assert_eq!(
            target
                .read(&region.id())
                .await
                .unwrap()
                .read(&[Span::new(0, 6)])
                .await
                .unwrap(),
            b"aabbbb"
        );
    }

    #[tokio::test]
    async fn test_out_of_bounds_write_fails() {
        let target = make_target().await;
        let region = target.create(4).await.unwrap();
        let err = region
            .write(&[Span::new(2, 4)], b"xxxx", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_erase_finality() {
        let target = make_target().await;
        let region = target.create(4).await.unwrap();
        let id = region.id();
        drop(region);

        target.erase(&id).await.unwrap();
        assert!(matches!(target.read(&id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            target.write(&id, false).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(target.erase(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_blocks_further_access() {
        let target = make_target().await;
        target.destroy().await.unwrap();
        assert!(matches!(target.create(4).await, Err(Error::Backend(_))));
    }
}
