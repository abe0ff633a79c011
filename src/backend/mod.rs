// SPDX-License-Identifier: Apache-2.0

//! Storage backend abstraction.
//!
//! A backend owns the regions of one target. Region handles perform local
//! byte I/O only; moving bytes to or from remote memory is the job of the
//! transfer managers. Backends register themselves in a process-wide
//! factory table keyed by type name, with three entry points per type:
//! config validation, target creation, and target recovery from a set of
//! migrated files.

mod file;
mod memory;

pub use file::FileFactory;
pub use memory::MemoryFactory;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::types::{span_total, RegionId, Span};

/// Writable handle to a region. Obtained from [`Backend::create`] or
/// [`Backend::write`]; holds shared access to the target for its lifetime.
#[async_trait]
pub trait WritableRegion: Send + Sync {
    fn id(&self) -> RegionId;

    /// The fixed length declared when the region was created.
    fn size(&self) -> u64;

    /// Copy `data` into the region at each span, in list order. With
    /// `persist` the spans are durable when the call returns.
    async fn write(&self, spans: &[Span], data: &[u8], persist: bool) -> Result<()>;

    /// Flush the listed spans to stable media.
    async fn persist(&self, spans: &[Span]) -> Result<()>;
}

/// Readable handle to a region.
#[async_trait]
pub trait ReadableRegion: Send + Sync {
    fn id(&self) -> RegionId;

    fn size(&self) -> u64;

    /// Copy the spans out, concatenated in list order.
    async fn read(&self, spans: &[Span]) -> Result<Vec<u8>>;
}

/// Scoped lock-and-manifest freezing a target for migration.
///
/// While a handle is live, every region operation on the target blocks.
/// Dropping the handle commits: the target is marked migrated out and, if
/// `remove_source` was requested, its storage is removed. Calling
/// [`MigrationHandle::cancel`] first restores the target instead.
pub trait MigrationHandle: Send {
    /// Directory the file list is relative to.
    fn root(&self) -> &Path;

    /// Relative file names; a trailing `/` marks a directory entry.
    fn files(&self) -> &[String];

    /// Abort the migration so that dropping the handle rolls back.
    fn cancel(&mut self);
}

/// A storage engine hosting the regions of one target.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The registered type name, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    /// The target's configuration document.
    fn config(&self) -> Value;

    /// Allocate a region of exactly `size` bytes.
    async fn create(&self, size: u64) -> Result<Box<dyn WritableRegion>>;

    /// Writable handle to an existing region. `persist_hint` advertises
    /// that the caller intends to persist.
    async fn write(&self, id: &RegionId, persist_hint: bool) -> Result<Box<dyn WritableRegion>>;

    /// Readable handle to an existing region.
    async fn read(&self, id: &RegionId) -> Result<Box<dyn ReadableRegion>>;

    /// Remove a region; unknown ids are an error.
    async fn erase(&self, id: &RegionId) -> Result<()>;

    /// Free all persistent state owned by the target.
    async fn destroy(&self) -> Result<()>;

    /// Freeze the target and export its file manifest for migration.
    async fn start_migration(&self, remove_source: bool) -> Result<Box<dyn MigrationHandle>>;
}

/// Constructors registered for one backend type.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    fn validate(&self, config: &Value) -> Result<()>;

    async fn create(&self, engine: Arc<Engine>, config: Value) -> Result<Arc<dyn Backend>>;

    /// Rebuild a target from the files it exported through a
    /// [`MigrationHandle`], now living under the destination root. Entries
    /// keep the trailing `/` convention for directories.
    async fn recover(
        &self,
        engine: Arc<Engine>,
        config: Value,
        files: Vec<String>,
    ) -> Result<Arc<dyn Backend>>;
}

static BACKENDS: Lazy<RwLock<HashMap<String, Arc<dyn BackendFactory>>>> = Lazy::new(|| {
    let mut table: HashMap<String, Arc<dyn BackendFactory>> = HashMap::new();
    table.insert("memory".into(), Arc::new(MemoryFactory));
    table.insert("file".into(), Arc::new(FileFactory));
    RwLock::new(table)
});

/// Register an additional backend type.
pub fn register_backend(name: impl Into<String>, factory: Arc<dyn BackendFactory>) {
    BACKENDS.write().insert(name.into(), factory);
}

fn factory(name: &str) -> Result<Arc<dyn BackendFactory>> {
    BACKENDS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Config(format!("unknown backend type \"{name}\"")))
}

/// Validate a target configuration against its backend type.
pub fn validate_config(name: &str, config: &Value) -> Result<()> {
    factory(name)?.validate(config)
}

/// Instantiate a target.
pub async fn create_target(
    name: &str,
    engine: Arc<Engine>,
    config: Value,
) -> Result<Arc<dyn Backend>> {
    factory(name)?.create(engine, config).await
}

/// Reconstitute a migrated target from its file set.
pub async fn recover_target(
    name: &str,
    engine: Arc<Engine>,
    config: Value,
    files: Vec<String>,
) -> Result<Arc<dyn Backend>> {
    factory(name)?.recover(engine, config, files).await
}

/// Check a span list against a region's declared size.
pub(crate) fn validate_spans(spans: &[Span], size: u64) -> Result<()> {
    for span in spans {
        if span.len == 0 {
            continue;
        }
        let end = span
            .offset
            .checked_add(span.len)
            .ok_or_else(|| Error::Backend("region span overflows".into()))?;
        if end > size {
            return Err(Error::Backend(
                "trying to access region outside of its bounds".into(),
            ));
        }
    }
    Ok(())
}

/// Check that a payload covers a span list.
pub(crate) fn validate_payload(spans: &[Span], payload_len: usize) -> Result<()> {
    if span_total(spans) > payload_len as u64 {
        return Err(Error::Backend(
            "data buffer smaller than the span list it covers".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub(crate) struct GateState {
    migrated: bool,
    destroyed: bool,
}

/// Per-target access gate. Region operations hold it shared for the
/// lifetime of their handle; a live migration (or a destroy) holds it
/// exclusive. The flags make entries captured by in-flight requests fail
/// cleanly after the target is gone instead of touching moved storage.
#[derive(Debug, Clone, Default)]
pub(crate) struct TargetGate {
    lock: Arc<tokio::sync::RwLock<GateState>>,
}

impl TargetGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for one region operation.
    pub async fn enter(&self) -> Result<OwnedRwLockReadGuard<GateState>> {
        let guard = self.lock.clone().read_owned().await;
        if guard.migrated {
            return Err(Error::Backend("target has been migrated out".into()));
        }
        if guard.destroyed {
            return Err(Error::Backend("target has been destroyed".into()));
        }
        Ok(guard)
    }

    /// Exclusive access for migration or destruction. Blocks until every
    /// outstanding region handle is dropped.
    pub async fn freeze(&self) -> Result<OwnedRwLockWriteGuard<GateState>> {
        let guard = self.lock.clone().write_owned().await;
        if guard.migrated {
            return Err(Error::Backend("target has been migrated out".into()));
        }
        if guard.destroyed {
            return Err(Error::Backend("target has been destroyed".into()));
        }
        Ok(guard)
    }
}

impl GateState {
    pub fn mark_migrated(&mut self) {
        self.migrated = true;
    }

    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }
}
