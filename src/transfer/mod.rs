// SPDX-License-Identifier: Apache-2.0

//! Bulk-data movers.
//!
//! A transfer manager brokers bytes between a remote memory descriptor and
//! a local region. Managers are named per provider; every target is bound
//! to exactly one manager at registration time. Like backends, manager
//! types live in a process-wide factory table.

mod default;
mod pipeline;

pub use default::DefaultFactory;
pub use pipeline::PipelineFactory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

use crate::backend::{ReadableRegion, WritableRegion};
use crate::bulk::BulkHandle;
use crate::engine::{Connection, Engine};
use crate::error::{Error, Result};
use crate::types::Span;

/// Name of the transfer manager every provider carries implicitly.
pub const DEFAULT_TRANSFER_MANAGER: &str = "__default__";

/// Moves bytes between a remote memory descriptor and a region.
///
/// The total byte count of a call equals the sum of the span lengths; the
/// remote buffer is addressed starting at `bulk_offset`. A manager may
/// batch, pipeline or split the transfer; ordering inside one call is not
/// observable.
#[async_trait]
pub trait TransferManager: Send + Sync {
    /// The registered type name.
    fn name(&self) -> &'static str;

    /// The manager's configuration document.
    fn config(&self) -> Value;

    /// Move bytes from the remote buffer into the region's spans. With
    /// `persist` the spans are durable on return.
    async fn pull(
        &self,
        region: &dyn WritableRegion,
        spans: &[Span],
        bulk: &BulkHandle,
        source: &Connection,
        bulk_offset: u64,
        persist: bool,
    ) -> Result<()>;

    /// Move bytes from the region's spans out to the remote buffer.
    async fn push(
        &self,
        region: &dyn ReadableRegion,
        spans: &[Span],
        bulk: &BulkHandle,
        dest: &Connection,
        bulk_offset: u64,
    ) -> Result<()>;
}

/// Constructors registered for one transfer manager type.
#[async_trait]
pub trait TransferManagerFactory: Send + Sync {
    fn validate(&self, config: &Value) -> Result<()>;

    async fn create(&self, engine: Arc<Engine>, config: Value) -> Result<Arc<dyn TransferManager>>;
}

static TRANSFER_MANAGERS: Lazy<RwLock<HashMap<String, Arc<dyn TransferManagerFactory>>>> =
    Lazy::new(|| {
        let mut table: HashMap<String, Arc<dyn TransferManagerFactory>> = HashMap::new();
        table.insert(DEFAULT_TRANSFER_MANAGER.into(), Arc::new(DefaultFactory));
        table.insert("pipeline".into(), Arc::new(PipelineFactory));
        RwLock::new(table)
    });

/// Register an additional transfer manager type.
pub fn register_transfer_manager(name: impl Into<String>, factory: Arc<dyn TransferManagerFactory>) {
    TRANSFER_MANAGERS.write().insert(name.into(), factory);
}

fn factory(name: &str) -> Result<Arc<dyn TransferManagerFactory>> {
    TRANSFER_MANAGERS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Config(format!("unknown transfer manager type \"{name}\"")))
}

/// Validate a manager configuration against its type.
pub fn validate_config(name: &str, config: &Value) -> Result<()> {
    factory(name)?.validate(config)
}

/// Instantiate a transfer manager.
pub async fn create_manager(
    name: &str,
    engine: Arc<Engine>,
    config: Value,
) -> Result<Arc<dyn TransferManager>> {
    factory(name)?.create(engine, config).await
}
