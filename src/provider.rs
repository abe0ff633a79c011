// SPDX-License-Identifier: Apache-2.0

//! The provider: target registry, request dispatch, and migration driver.
//!
//! A provider owns two registries behind independent mutexes: targets by
//! UUID and transfer managers by name. Locks are held only for lookup,
//! insert and remove, never across a backend or transfer call; handlers
//! copy the [`TargetEntry`] out under the lock and operate on the clone.
//! When both locks are needed (target registration), the order is always
//! targets first, then transfer managers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, trace, warn};

use crate::backend::{self, Backend};
use crate::bulk::BulkHandle;
use crate::engine::{Connection, Engine, RequestContext, RequestService};
use crate::error::{Error, Result};
use crate::migration::{
    merge_overlay, FileSet, MigrationClient, MigrationOptions, MigrationServer,
};
use crate::transfer::{self, TransferManager, DEFAULT_TRANSFER_MANAGER};
use crate::types::{RegionId, Span, TargetId};
use crate::wire;

/// A registered target: its backend plus its bound transfer manager. The
/// manager's name is kept so configurations round-trip.
#[derive(Clone)]
pub(crate) struct TargetEntry {
    pub backend: Arc<dyn Backend>,
    pub transfer_manager: Arc<dyn TransferManager>,
    pub transfer_manager_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderConfig {
    #[serde(default)]
    targets: Vec<TargetDecl>,
    #[serde(default)]
    transfer_managers: BTreeMap<String, ManagerDecl>,
}

#[derive(Debug, Deserialize)]
struct TargetDecl {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ManagerDecl {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    config: Map<String, Value>,
}

/// A provider hosted on an engine under a numeric provider id.
///
/// Dropping the provider deregisters it from the engine and from the
/// migration subsystem; in-flight requests that already captured a target
/// entry run to completion.
pub struct Provider {
    state: Arc<ProviderState>,
    migration_registration: Option<(Arc<MigrationServer>, String)>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("provider_id", &self.state.provider_id)
            .finish()
    }
}

impl Provider {
    /// Create a provider from a JSON configuration document (empty string
    /// means an empty object). Configuration errors are fatal: the
    /// provider is not created.
    pub async fn new(
        engine: Arc<Engine>,
        provider_id: u16,
        config: &str,
        migration_client: Option<Arc<MigrationClient>>,
        migration_server: Option<Arc<MigrationServer>>,
    ) -> Result<Self> {
        let raw: Value = if config.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(config).map_err(|e| {
                Error::Config(format!("could not parse provider configuration: {e}"))
            })?
        };
        let parsed: ProviderConfig = serde_json::from_value(raw)
            .map_err(|e| Error::Config(format!("invalid provider configuration: {e}")))?;

        match (&migration_client, &migration_server) {
            (Some(_), None) => warn!(
                provider_id,
                "provider wired with only a migration client; it can only send targets to other providers"
            ),
            (None, Some(_)) => warn!(
                provider_id,
                "provider wired with only a migration server; it can only receive targets from other providers"
            ),
            _ => {}
        }

        let state = Arc::new(ProviderState {
            engine: engine.clone(),
            provider_id,
            targets: Mutex::new(HashMap::new()),
            transfer_managers: Mutex::new(HashMap::new()),
            migration_client,
        });

        engine.register_provider(
            provider_id,
            Arc::downgrade(&state) as Weak<dyn RequestService>,
        )?;

        let migration_registration = match &migration_server {
            Some(server) => {
                let class = format!("warabi/{provider_id}");
                if let Err(e) = server.register_class(class.clone(), Arc::downgrade(&state)) {
                    engine.deregister_provider(provider_id);
                    return Err(e);
                }
                Some((server.clone(), class))
            }
            None => None,
        };

        if let Err(e) = state.initialize(parsed).await {
            engine.deregister_provider(provider_id);
            if let Some((server, class)) = &migration_registration {
                server.deregister_class(class);
            }
            return Err(e);
        }

        trace!(provider_id, "registered provider");
        Ok(Self {
            state,
            migration_registration,
        })
    }

    pub fn id(&self) -> u16 {
        self.state.provider_id
    }

    /// Serialize the live state: targets (with their server-issued ids and
    /// bound transfer manager names) and transfer managers, in a
    /// deterministic order.
    pub fn config(&self) -> String {
        self.state.config_json().to_string()
    }

    /// Register a target directly, bypassing the RPC layer.
    pub async fn add_target(&self, target_type: &str, config: &str) -> Result<TargetId> {
        self.state.add_target(target_type, config).await
    }

    /// Migrate a target to another provider, driving the source side of
    /// the file-set transfer.
    pub async fn migrate_target(
        &self,
        target_id: TargetId,
        dest_address: &str,
        dest_provider_id: u16,
        options: MigrationOptions,
    ) -> Result<()> {
        self.state
            .migrate_target(target_id, dest_address, dest_provider_id, options)
            .await
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.state.engine.deregister_provider(self.state.provider_id);
        if let Some((server, class)) = &self.migration_registration {
            server.deregister_class(class);
        }
        trace!(provider_id = self.state.provider_id, "deregistered provider");
    }
}

pub(crate) struct ProviderState {
    engine: Arc<Engine>,
    provider_id: u16,
    targets: Mutex<HashMap<TargetId, TargetEntry>>,
    transfer_managers: Mutex<HashMap<String, Arc<dyn TransferManager>>>,
    migration_client: Option<Arc<MigrationClient>>,
}

impl ProviderState {
    async fn initialize(&self, config: ProviderConfig) -> Result<()> {
        // Managers first: validate every declaration, then instantiate, so
        // a bad entry fails the constructor before anything is built.
        for (name, decl) in &config.transfer_managers {
            transfer::validate_config(&decl.type_name, &Value::Object(decl.config.clone()))
                .map_err(|e| {
                    Error::Config(format!("transfer manager \"{name}\": {e}"))
                })?;
        }
        for (name, decl) in config.transfer_managers {
            self.add_transfer_manager_value(name, &decl.type_name, decl.config)
                .await?;
        }
        let has_default = self
            .transfer_managers
            .lock()
            .contains_key(DEFAULT_TRANSFER_MANAGER);
        if !has_default {
            self.add_transfer_manager_value(
                DEFAULT_TRANSFER_MANAGER.to_string(),
                DEFAULT_TRANSFER_MANAGER,
                Map::new(),
            )
            .await?;
        }

        for decl in &config.targets {
            backend::validate_config(&decl.type_name, &Value::Object(decl.config.clone()))?;
        }
        for decl in config.targets {
            self.add_target_value(&decl.type_name, decl.config).await?;
        }
        Ok(())
    }

    fn find_target(&self, target_id: &TargetId) -> Result<TargetEntry> {
        self.targets
            .lock()
            .get(target_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("target {target_id} not found")))
    }

    async fn resolve_endpoint(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<Arc<Connection>> {
        if address.is_empty() {
            Ok(ctx.conn.clone())
        } else {
            self.engine.lookup(address).await
        }
    }

    async fn add_target(&self, target_type: &str, config: &str) -> Result<TargetId> {
        let parsed: Value = serde_json::from_str(config)
            .map_err(|e| Error::Config(format!("could not parse target configuration: {e}")))?;
        let config = parsed
            .as_object()
            .cloned()
            .ok_or_else(|| Error::Config("target configuration must be an object".into()))?;
        backend::validate_config(target_type, &Value::Object(config.clone()))?;
        self.add_target_value(target_type, config).await
    }

    async fn add_target_value(
        &self,
        target_type: &str,
        config: Map<String, Value>,
    ) -> Result<TargetId> {
        let backend = backend::create_target(
            target_type,
            self.engine.clone(),
            Value::Object(config.clone()),
        )
        .await?;
        let target_id = TargetId::generate();
        {
            // Lock order: targets, then transfer managers.
            let mut targets = self.targets.lock();
            let managers = self.transfer_managers.lock();
            let manager_name = config
                .get("transfer_manager")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TRANSFER_MANAGER)
                .to_string();
            let manager = managers.get(&manager_name).cloned().ok_or_else(|| {
                Error::Config(format!(
                    "could not find transfer manager named {manager_name}"
                ))
            })?;
            targets.insert(
                target_id,
                TargetEntry {
                    backend,
                    transfer_manager: manager,
                    transfer_manager_name: manager_name,
                },
            );
        }
        trace!(
            provider_id = self.provider_id,
            target = %target_id,
            target_type,
            "added target"
        );
        Ok(target_id)
    }

    fn remove_target(&self, target_id: &TargetId) -> Result<()> {
        self.targets
            .lock()
            .remove(target_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("target {target_id} not found")))?;
        trace!(provider_id = self.provider_id, target = %target_id, "removed target");
        Ok(())
    }

    async fn destroy_target(&self, target_id: &TargetId) -> Result<()> {
        let entry = self
            .targets
            .lock()
            .remove(target_id)
            .ok_or_else(|| Error::NotFound(format!("target {target_id} not found")))?;
        entry.backend.destroy().await?;
        trace!(provider_id = self.provider_id, target = %target_id, "destroyed target");
        Ok(())
    }

    async fn add_transfer_manager(
        &self,
        name: &str,
        manager_type: &str,
        config: &str,
    ) -> Result<()> {
        let parsed: Value = serde_json::from_str(config).map_err(|e| {
            Error::Config(format!("could not parse transfer manager configuration: {e}"))
        })?;
        let config = parsed.as_object().cloned().ok_or_else(|| {
            Error::Config("transfer manager configuration must be an object".into())
        })?;
        transfer::validate_config(manager_type, &Value::Object(config.clone()))?;
        self.add_transfer_manager_value(name.to_string(), manager_type, config)
            .await
    }

    async fn add_transfer_manager_value(
        &self,
        name: String,
        manager_type: &str,
        config: Map<String, Value>,
    ) -> Result<()> {
        if self.transfer_managers.lock().contains_key(&name) {
            return Err(Error::Config(format!(
                "a transfer manager named \"{name}\" already exists"
            )));
        }
        let manager =
            transfer::create_manager(manager_type, self.engine.clone(), Value::Object(config))
                .await?;
        {
            let mut managers = self.transfer_managers.lock();
            if managers.contains_key(&name) {
                return Err(Error::Config(format!(
                    "a transfer manager named \"{name}\" already exists"
                )));
            }
            managers.insert(name.clone(), manager);
        }
        trace!(
            provider_id = self.provider_id,
            name,
            manager_type,
            "added transfer manager"
        );
        Ok(())
    }

    async fn create(&self, target_id: TargetId, size: u64) -> Result<RegionId> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.create(size).await?;
        Ok(region.id())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        ctx: RequestContext,
        target_id: TargetId,
        region_id: RegionId,
        spans: Vec<Span>,
        bulk: BulkHandle,
        address: String,
        bulk_offset: u64,
        persist: bool,
    ) -> Result<()> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.write(&region_id, persist).await?;
        let source = self.resolve_endpoint(&ctx, &address).await?;
        entry
            .transfer_manager
            .pull(region.as_ref(), &spans, &bulk, &source, bulk_offset, persist)
            .await
    }

    async fn write_eager(
        &self,
        target_id: TargetId,
        region_id: RegionId,
        spans: Vec<Span>,
        data: Vec<u8>,
        persist: bool,
    ) -> Result<()> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.write(&region_id, persist).await?;
        region.write(&spans, &data, persist).await
    }

    async fn persist(
        &self,
        target_id: TargetId,
        region_id: RegionId,
        spans: Vec<Span>,
    ) -> Result<()> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.write(&region_id, true).await?;
        region.persist(&spans).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_write(
        &self,
        ctx: RequestContext,
        target_id: TargetId,
        bulk: BulkHandle,
        address: String,
        bulk_offset: u64,
        size: u64,
        persist: bool,
    ) -> Result<RegionId> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.create(size).await?;
        let region_id = region.id();
        let source = self.resolve_endpoint(&ctx, &address).await?;
        entry
            .transfer_manager
            .pull(
                region.as_ref(),
                &[Span::new(0, size)],
                &bulk,
                &source,
                bulk_offset,
                persist,
            )
            .await?;
        Ok(region_id)
    }

    async fn create_write_eager(
        &self,
        target_id: TargetId,
        data: Vec<u8>,
        persist: bool,
    ) -> Result<RegionId> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.create(data.len() as u64).await?;
        let region_id = region.id();
        region
            .write(&[Span::new(0, data.len() as u64)], &data, persist)
            .await?;
        Ok(region_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn read(
        &self,
        ctx: RequestContext,
        target_id: TargetId,
        region_id: RegionId,
        spans: Vec<Span>,
        bulk: BulkHandle,
        address: String,
        bulk_offset: u64,
    ) -> Result<()> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.read(&region_id).await?;
        let dest = self.resolve_endpoint(&ctx, &address).await?;
        entry
            .transfer_manager
            .push(region.as_ref(), &spans, &bulk, &dest, bulk_offset)
            .await
    }

    async fn read_eager(
        &self,
        target_id: TargetId,
        region_id: RegionId,
        spans: Vec<Span>,
    ) -> Result<Vec<u8>> {
        let entry = self.find_target(&target_id)?;
        let region = entry.backend.read(&region_id).await?;
        region.read(&spans).await
    }

    async fn erase(&self, target_id: TargetId, region_id: RegionId) -> Result<()> {
        let entry = self.find_target(&target_id)?;
        entry.backend.erase(&region_id).await
    }

    async fn migrate_target(
        &self,
        target_id: TargetId,
        dest_address: &str,
        dest_provider_id: u16,
        options: MigrationOptions,
    ) -> Result<()> {
        let client = self.migration_client.as_ref().ok_or_else(|| {
            Error::Config("this provider is not wired to a migration client".into())
        })?;
        if options.new_root.is_empty() {
            return Err(Error::Config("migration requires a non-empty new_root".into()));
        }

        let dest = client.connect(dest_address).await?;
        let entry = self.find_target(&target_id)?;

        // From here on the target is frozen.
        let mut handle = entry.backend.start_migration(options.remove_source).await?;

        let mut metadata = BTreeMap::new();
        metadata.insert("uuid".to_string(), target_id.to_string());
        metadata.insert("type".to_string(), entry.backend.name().to_string());
        metadata.insert("config".to_string(), entry.backend.config().to_string());
        metadata.insert("migration_config".to_string(), options.extra_config.clone());

        let fileset = FileSet {
            class: format!("warabi/{dest_provider_id}"),
            root: handle.root().to_path_buf(),
            files: handle.files().to_vec(),
            metadata,
            xfer_size: options.transfer_size,
        };

        match client.migrate(&dest, &fileset, &options.new_root).await {
            Ok(0) => {
                // Dropping the handle commits; the entry leaves the registry.
                drop(handle);
                self.targets.lock().remove(&target_id);
                trace!(
                    provider_id = self.provider_id,
                    target = %target_id,
                    "target migrated out"
                );
                Ok(())
            }
            Ok(status) => {
                handle.cancel();
                Err(Error::MigrationRejected(status))
            }
            Err(e) => {
                handle.cancel();
                Err(e)
            }
        }
    }

    /// Destination-side check run before any file lands: can this file set
    /// be installed here? Returns 0 to accept, a distinct code per failure.
    pub(crate) fn before_migration(&self, fileset: &FileSet) -> i32 {
        let Some((target_id, type_name, config)) = Self::parse_metadata(&fileset.metadata) else {
            return 1;
        };
        if let Some(manager_name) = config.get("transfer_manager").and_then(Value::as_str) {
            if !self.transfer_managers.lock().contains_key(manager_name) {
                return 2;
            }
        }
        if self.targets.lock().contains_key(&target_id) {
            return 3;
        }
        if backend::validate_config(&type_name, &config).is_err() {
            return 4;
        }
        0
    }

    /// Destination-side installation run once every file has landed.
    pub(crate) async fn after_migration(&self, fileset: &FileSet) -> i32 {
        let Some((target_id, type_name, config)) = Self::parse_metadata(&fileset.metadata) else {
            return 1;
        };

        let (manager, manager_name) = {
            let managers = self.transfer_managers.lock();
            let name = config
                .get("transfer_manager")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TRANSFER_MANAGER)
                .to_string();
            match managers.get(&name).cloned() {
                Some(manager) => (manager, name),
                None => return 2,
            }
        };

        let root = fileset.root.display().to_string();
        let sep = if root.ends_with('/') { "" } else { "/" };
        let files: Vec<String> = fileset
            .files
            .iter()
            .map(|f| format!("{root}{sep}{f}"))
            .collect();

        let backend = match backend::recover_target(
            &type_name,
            self.engine.clone(),
            config,
            files,
        )
        .await
        {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    provider_id = self.provider_id,
                    target = %target_id,
                    error = %e,
                    "failed to recover migrated target"
                );
                return 4;
            }
        };

        self.targets.lock().insert(
            target_id,
            TargetEntry {
                backend,
                transfer_manager: manager,
                transfer_manager_name: manager_name,
            },
        );
        trace!(
            provider_id = self.provider_id,
            target = %target_id,
            "installed migrated target"
        );
        0
    }

    /// Parse and merge the migration metadata; `None` means malformed.
    fn parse_metadata(metadata: &BTreeMap<String, String>) -> Option<(TargetId, String, Value)> {
        let uuid = metadata.get("uuid")?;
        let type_name = metadata.get("type")?;
        let config = metadata.get("config")?;
        let migration_config = metadata.get("migration_config")?;

        let target_id: TargetId = uuid.parse().ok()?;
        let mut config: Value = serde_json::from_str(config).ok()?;
        let overlay: Value = serde_json::from_str(migration_config).ok()?;
        merge_overlay(&mut config, &overlay);
        Some((target_id, type_name.clone(), config))
    }

    fn config_json(&self) -> Value {
        let targets = self.targets.lock();
        let managers = self.transfer_managers.lock();

        let mut target_list: Vec<(String, Value)> = targets
            .iter()
            .map(|(id, entry)| {
                let mut config = entry.backend.config();
                if let Some(obj) = config.as_object_mut() {
                    obj.insert(
                        "transfer_manager".into(),
                        Value::String(entry.transfer_manager_name.clone()),
                    );
                }
                (
                    id.to_string(),
                    serde_json::json!({
                        "__id__": id.to_string(),
                        "type": entry.backend.name(),
                        "config": config,
                    }),
                )
            })
            .collect();
        target_list.sort_by(|a, b| a.0.cmp(&b.0));

        let mut manager_pairs: Vec<(&String, &Arc<dyn TransferManager>)> =
            managers.iter().collect();
        manager_pairs.sort_by(|a, b| a.0.cmp(b.0));
        let mut manager_map = Map::new();
        for (name, manager) in manager_pairs {
            manager_map.insert(
                name.clone(),
                serde_json::json!({ "type": manager.name(), "config": manager.config() }),
            );
        }

        serde_json::json!({
            "targets": target_list.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
            "transfer_managers": Value::Object(manager_map),
        })
    }

    async fn dispatch(&self, op: &str, payload: &[u8], ctx: RequestContext) -> Result<Vec<u8>> {
        match op {
            "add_target" => {
                let (target_type, config): (String, String) = wire::decode(payload)?;
                let id = self.add_target(&target_type, &config).await?;
                wire::encode(&id)
            }
            "remove_target" => {
                let (target_id,): (TargetId,) = wire::decode(payload)?;
                self.remove_target(&target_id)?;
                wire::encode(&())
            }
            "destroy_target" => {
                let (target_id,): (TargetId,) = wire::decode(payload)?;
                self.destroy_target(&target_id).await?;
                wire::encode(&())
            }
            "add_transfer_manager" => {
                let (name, manager_type, config): (String, String, String) =
                    wire::decode(payload)?;
                self.add_transfer_manager(&name, &manager_type, &config).await?;
                wire::encode(&())
            }
            "migrate_target" => {
                let (target_id, dest_address, dest_provider_id, options): (
                    TargetId,
                    String,
                    u16,
                    MigrationOptions,
                ) = wire::decode(payload)?;
                self.migrate_target(target_id, &dest_address, dest_provider_id, options)
                    .await?;
                wire::encode(&())
            }
            "check_target" => {
                let (target_id,): (TargetId,) = wire::decode(payload)?;
                self.find_target(&target_id)?;
                wire::encode(&())
            }
            "create" => {
                let (target_id, size): (TargetId, u64) = wire::decode(payload)?;
                let region_id = self.create(target_id, size).await?;
                wire::encode(&region_id)
            }
            "write" => {
                let (target_id, region_id, spans, bulk, address, bulk_offset, persist): (
                    TargetId,
                    RegionId,
                    Vec<Span>,
                    BulkHandle,
                    String,
                    u64,
                    bool,
                ) = wire::decode(payload)?;
                self.write(ctx, target_id, region_id, spans, bulk, address, bulk_offset, persist)
                    .await?;
                wire::encode(&())
            }
            "write_eager" => {
                let (target_id, region_id, spans, data, persist): (
                    TargetId,
                    RegionId,
                    Vec<Span>,
                    Vec<u8>,
                    bool,
                ) = wire::decode(payload)?;
                self.write_eager(target_id, region_id, spans, data, persist).await?;
                wire::encode(&())
            }
            "persist" => {
                let (target_id, region_id, spans): (TargetId, RegionId, Vec<Span>) =
                    wire::decode(payload)?;
                self.persist(target_id, region_id, spans).await?;
                wire::encode(&())
            }
            "create_write" => {
                let (target_id, bulk, address, bulk_offset, size, persist): (
                    TargetId,
                    BulkHandle,
                    String,
                    u64,
                    u64,
                    bool,
                ) = wire::decode(payload)?;
                let region_id = self
                    .create_write(ctx, target_id, bulk, address, bulk_offset, size, persist)
                    .await?;
                wire::encode(&region_id)
            }
            "create_write_eager" => {
                let (target_id, data, persist): (TargetId, Vec<u8>, bool) =
                    wire::decode(payload)?;
                let region_id = self.create_write_eager(target_id, data, persist).await?;
                wire::encode(&region_id)
            }
            "read" => {
                let (target_id, region_id, spans, bulk, address, bulk_offset): (
                    TargetId,
                    RegionId,
                    Vec<Span>,
                    BulkHandle,
                    String,
                    u64,
                ) = wire::decode(payload)?;
                self.read(ctx, target_id, region_id, spans, bulk, address, bulk_offset)
                    .await?;
                wire::encode(&())
            }
            "read_eager" => {
                let (target_id, region_id, spans): (TargetId, RegionId, Vec<Span>) =
                    wire::decode(payload)?;
                let data = self.read_eager(target_id, region_id, spans).await?;
                wire::encode(&data)
            }
            "erase" => {
                let (target_id, region_id): (TargetId, RegionId) = wire::decode(payload)?;
                self.erase(target_id, region_id).await?;
                wire::encode(&())
            }
            _ => Err(Error::Internal(format!("unknown operation \"{op}\""))),
        }
    }
}

#[async_trait]
impl RequestService for ProviderState {
    async fn handle(&self, op: &str, payload: Bytes, ctx: RequestContext) -> Result<Vec<u8>> {
        trace!(provider_id = self.provider_id, op, "received request");
        let result = self.dispatch(op, &payload, ctx).await;
        if let Err(e) = &result {
            error!(provider_id = self.provider_id, op, error = %e, "request failed");
        }
        result
    }
}
