// SPDX-License-Identifier: Apache-2.0

//! File-set transfer subsystem used by target migration.
//!
//! A source provider freezes a target, wraps its exported files and
//! metadata in a [`FileSet`] bound to the class string
//! `"warabi/<destProviderID>"`, and hands it to the [`MigrationClient`].
//! The client drives three engine ops on the destination: `fileset_offer`
//! (runs the class's before-callback and lays out the files under the new
//! root), `fileset_data` (streamed chunks), and `fileset_commit` (runs the
//! after-callback that installs the target). `fileset_abort` discards a
//! partial session.
//!
//! The [`MigrationServer`] owns the destination side: the class registry
//! (providers register with weak references, so the provider owns the
//! registration and the callbacks borrow) and the in-flight session table.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::engine::{call, Connection, Engine, RequestContext, RequestService, ENGINE_PROVIDER_ID};
use crate::error::{Error, Result};
use crate::provider::ProviderState;
use crate::wire;

/// Chunk size used when the caller leaves `transfer_size` at 0.
const DEFAULT_XFER_SIZE: u64 = 1024 * 1024;

/// Upper bound on one streamed chunk, below the wire frame cap.
const MAX_XFER_SIZE: u64 = 32 * 1024 * 1024;

/// A target's exported files and metadata, bound to a migration class.
pub struct FileSet {
    /// Migration class string, `"warabi/<destProviderID>"`.
    pub class: String,
    /// Directory the file names are relative to.
    pub root: PathBuf,
    /// Relative entries; a trailing `/` marks a directory.
    pub files: Vec<String>,
    /// String metadata: `uuid`, `type`, `config`, `migration_config`.
    pub metadata: BTreeMap<String, String>,
    /// Block transfer size; 0 means the subsystem default.
    pub xfer_size: u64,
}

/// Options of a `migrate_target` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Directory on the destination under which the file set is installed.
    #[serde(default)]
    pub new_root: String,
    /// Block transfer size; 0 picks the subsystem default.
    #[serde(default)]
    pub transfer_size: u64,
    /// JSON document overlaid onto the target's config at the destination.
    #[serde(default = "default_extra_config")]
    pub extra_config: String,
    /// Remove the source target's storage once the migration commits.
    #[serde(default)]
    pub remove_source: bool,
}

fn default_extra_config() -> String {
    "{}".into()
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            new_root: String::new(),
            transfer_size: 0,
            extra_config: default_extra_config(),
            remove_source: false,
        }
    }
}

/// Overlay `overlay` onto `base`: objects merge recursively, everything
/// else is overwritten.
pub(crate) fn merge_overlay(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_overlay(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn check_relative(entry: &str) -> Result<()> {
    let path = Path::new(entry.trim_end_matches('/'));
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
    if escapes || entry.trim_end_matches('/').is_empty() {
        return Err(Error::Transfer(format!("illegal file-set entry \"{entry}\"")));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct FilesetOffer {
    class: String,
    metadata: BTreeMap<String, String>,
    files: Vec<String>,
    new_root: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferReply {
    status: i32,
    session: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FilesetData {
    session: u64,
    file: String,
    offset: u64,
    data: Vec<u8>,
}

/// Source-side handle on the file-set transfer subsystem.
pub struct MigrationClient {
    engine: Arc<Engine>,
}

impl MigrationClient {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    /// Resolve the destination endpoint (a provider-to-provider transfer
    /// handle in file-set terms).
    pub async fn connect(&self, address: &str) -> Result<Arc<Connection>> {
        self.engine.lookup(address).await
    }

    /// Stream a file set to the destination and return the status code of
    /// its migration callbacks: 0 on success, the rejecting callback's
    /// code otherwise.
    pub async fn migrate(
        &self,
        dest: &Connection,
        fileset: &FileSet,
        new_root: &str,
    ) -> Result<i32> {
        let offer = FilesetOffer {
            class: fileset.class.clone(),
            metadata: fileset.metadata.clone(),
            files: fileset.files.clone(),
            new_root: new_root.to_string(),
        };
        let reply: OfferReply = call(dest, ENGINE_PROVIDER_ID, "fileset_offer", &offer).await?;
        if reply.status != 0 {
            return Ok(reply.status);
        }
        let session = reply.session;

        let chunk_size = match fileset.xfer_size {
            0 => DEFAULT_XFER_SIZE,
            n => n.min(MAX_XFER_SIZE),
        } as usize;

        for file in fileset.files.iter().filter(|f| !f.ends_with('/')) {
            if let Err(e) = self.stream_file(dest, session, fileset, file, chunk_size).await {
                let _ = call::<_, ()>(dest, ENGINE_PROVIDER_ID, "fileset_abort", &(session,)).await;
                return Err(e);
            }
        }

        match call::<_, i32>(dest, ENGINE_PROVIDER_ID, "fileset_commit", &(session,)).await {
            Ok(status) => Ok(status),
            Err(e) => {
                let _ = call::<_, ()>(dest, ENGINE_PROVIDER_ID, "fileset_abort", &(session,)).await;
                Err(e)
            }
        }
    }

    async fn stream_file(
        &self,
        dest: &Connection,
        session: u64,
        fileset: &FileSet,
        file: &str,
        chunk_size: usize,
    ) -> Result<()> {
        let path = fileset.root.join(file);
        let mut source = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Transfer(format!("failed to open {}: {e}", path.display())))?;

        let mut offset = 0u64;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| Error::Transfer(format!("failed to read {}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            call::<_, ()>(
                dest,
                ENGINE_PROVIDER_ID,
                "fileset_data",
                &FilesetData {
                    session,
                    file: file.to_string(),
                    offset,
                    data: buf[..n].to_vec(),
                },
            )
            .await?;
            offset += n as u64;
        }
        trace!(file, bytes = offset, "streamed file-set entry");
        Ok(())
    }
}

/// Destination-side half of the file-set transfer subsystem.
pub struct MigrationServer {
    state: Arc<MigrationServerState>,
}

impl MigrationServer {
    /// Create the server and register it for the engine's `fileset_*` ops.
    pub fn new(engine: &Arc<Engine>) -> Result<Arc<Self>> {
        let state = Arc::new(MigrationServerState {
            classes: DashMap::new(),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        });
        engine.set_migration_server(Arc::downgrade(&state) as Weak<dyn RequestService>)?;
        Ok(Arc::new(Self { state }))
    }

    pub(crate) fn register_class(&self, class: String, provider: Weak<ProviderState>) -> Result<()> {
        match self.state.classes.entry(class) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().upgrade().is_some() {
                    return Err(Error::Config(format!(
                        "migration class \"{}\" is already registered",
                        e.key()
                    )));
                }
                e.insert(provider);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(provider);
            }
        }
        Ok(())
    }

    pub(crate) fn deregister_class(&self, class: &str) {
        self.state.classes.remove(class);
    }
}

pub(crate) struct MigrationServerState {
    classes: DashMap<String, Weak<ProviderState>>,
    sessions: DashMap<u64, FilesetSession>,
    next_session: AtomicU64,
}

struct FilesetSession {
    class: String,
    root: PathBuf,
    files: Vec<String>,
    metadata: BTreeMap<String, String>,
    created_files: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl FilesetSession {
    /// Remove whatever the session wrote; files first, then directories.
    async fn cleanup(self) {
        for file in &self.created_files {
            let _ = tokio::fs::remove_file(file).await;
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}

/// Create the root, the directory entries, and an empty file per file
/// entry. Everything created is recorded so the caller can undo a partial
/// layout.
async fn lay_out_fileset(
    root: &Path,
    entries: &[String],
    created_dirs: &mut Vec<PathBuf>,
    created_files: &mut Vec<PathBuf>,
) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| Error::Transfer(format!("failed to create {}: {e}", root.display())))?;
    for entry in entries {
        let path = root.join(entry.trim_end_matches('/'));
        if entry.ends_with('/') {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| Error::Transfer(format!("failed to create {}: {e}", path.display())))?;
            created_dirs.push(path);
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Transfer(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            tokio::fs::File::create(&path)
                .await
                .map_err(|e| Error::Transfer(format!("failed to create {}: {e}", path.display())))?;
            created_files.push(path);
        }
    }
    Ok(())
}

impl MigrationServerState {
    fn provider_for(&self, class: &str) -> Result<Arc<ProviderState>> {
        self.classes
            .get(class)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| {
                Error::Transfer(format!(
                    "no migration class \"{class}\" registered on this endpoint"
                ))
            })
    }

    async fn offer(&self, offer: FilesetOffer) -> Result<OfferReply> {
        let provider = self.provider_for(&offer.class)?;
        for entry in &offer.files {
            check_relative(entry)?;
        }

        let root = PathBuf::from(&offer.new_root);
        let fileset = FileSet {
            class: offer.class.clone(),
            root: root.clone(),
            files: offer.files.clone(),
            metadata: offer.metadata.clone(),
            xfer_size: 0,
        };
        let status = provider.before_migration(&fileset);
        if status != 0 {
            debug!(class = %offer.class, status, "migration offer rejected");
            return Ok(OfferReply { status, session: 0 });
        }

        // Lay out the file set under the new root so data chunks can land.
        // On failure partway through, whatever was already created must go
        // with the error; no session exists yet for the client to abort.
        let root_existed = root.exists();
        let mut created_dirs = Vec::new();
        let mut created_files = Vec::new();
        if let Err(e) =
            lay_out_fileset(&root, &offer.files, &mut created_dirs, &mut created_files).await
        {
            if root_existed {
                for file in &created_files {
                    let _ = tokio::fs::remove_file(file).await;
                }
                for dir in created_dirs.iter().rev() {
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
            } else {
                let _ = tokio::fs::remove_dir_all(&root).await;
            }
            return Err(e);
        }

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            session,
            FilesetSession {
                class: offer.class,
                root,
                files: offer.files,
                metadata: offer.metadata,
                created_files,
                created_dirs,
            },
        );
        Ok(OfferReply { status: 0, session })
    }

    async fn data(&self, msg: FilesetData) -> Result<()> {
        let (root, known) = {
            let session = self
                .sessions
                .get(&msg.session)
                .ok_or_else(|| Error::Transfer("unknown file-set session".into()))?;
            (session.root.clone(), session.files.contains(&msg.file))
        };
        if !known {
            return Err(Error::Transfer(format!(
                "file \"{}\" is not part of this file set",
                msg.file
            )));
        }
        check_relative(&msg.file)?;

        let path = root.join(&msg.file);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::Transfer(format!("failed to open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(msg.offset))
            .await
            .map_err(|e| Error::Transfer(format!("failed to seek in {}: {e}", path.display())))?;
        file.write_all(&msg.data)
            .await
            .map_err(|e| Error::Transfer(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    async fn commit(&self, session: u64) -> Result<i32> {
        let (_, state) = self
            .sessions
            .remove(&session)
            .ok_or_else(|| Error::Transfer("unknown file-set session".into()))?;
        let provider = self.provider_for(&state.class)?;

        let fileset = FileSet {
            class: state.class.clone(),
            root: state.root.clone(),
            files: state.files.clone(),
            metadata: state.metadata.clone(),
            xfer_size: 0,
        };
        let status = provider.after_migration(&fileset).await;
        if status != 0 {
            debug!(class = %state.class, status, "migration commit rejected");
            state.cleanup().await;
        }
        Ok(status)
    }

    async fn abort(&self, session: u64) {
        if let Some((_, state)) = self.sessions.remove(&session) {
            debug!(session, "aborting file-set session");
            state.cleanup().await;
        }
    }
}

#[async_trait]
impl RequestService for MigrationServerState {
    async fn handle(&self, op: &str, payload: Bytes, _ctx: RequestContext) -> Result<Vec<u8>> {
        match op {
            "fileset_offer" => {
                let offer: FilesetOffer = wire::decode(&payload)?;
                let reply = self.offer(offer).await?;
                wire::encode(&reply)
            }
            "fileset_data" => {
                let msg: FilesetData = wire::decode(&payload)?;
                self.data(msg).await?;
                wire::encode(&())
            }
            "fileset_commit" => {
                let (session,): (u64,) = wire::decode(&payload)?;
                let status = self.commit(session).await?;
                wire::encode(&status)
            }
            "fileset_abort" => {
                let (session,): (u64,) = wire::decode(&payload)?;
                self.abort(session).await;
                wire::encode(&())
            }
            _ => Err(Error::Internal(format!(
                "unknown file-set operation \"{op}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overlay_is_recursive() {
        let mut base = json!({
            "path": "/data/a",
            "nested": { "x": 1, "y": 2 },
            "keep": true,
        });
        merge_overlay(
            &mut base,
            &json!({ "path": "/data/b", "nested": { "y": 3, "z": 4 } }),
        );
        assert_eq!(
            base,
            json!({
                "path": "/data/b",
                "nested": { "x": 1, "y": 3, "z": 4 },
                "keep": true,
            })
        );
    }

    #[test]
    fn test_merge_overlay_replaces_mismatched_shapes() {
        let mut base = json!({ "a": { "b": 1 } });
        merge_overlay(&mut base, &json!({ "a": 5 }));
        assert_eq!(base, json!({ "a": 5 }));
    }

    #[test]
    fn test_check_relative() {
        assert!(check_relative("target/region1").is_ok());
        assert!(check_relative("target/").is_ok());
        assert!(check_relative("/etc/passwd").is_err());
        assert!(check_relative("../escape").is_err());
        assert!(check_relative("a/../../b").is_err());
        assert!(check_relative("/").is_err());
    }

    #[test]
    fn test_migration_options_defaults() {
        let options: MigrationOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.new_root, "");
        assert_eq!(options.transfer_size, 0);
        assert_eq!(options.extra_config, "{}");
        assert!(!options.remove_source);
    }
}
