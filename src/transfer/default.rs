// SPDX-License-Identifier: Apache-2.0

//! The `__default__` transfer manager: one bulk round-trip covering the
//! whole span sum, then a single region call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{TransferManager, TransferManagerFactory, DEFAULT_TRANSFER_MANAGER};
use crate::backend::{ReadableRegion, WritableRegion};
use crate::bulk::BulkHandle;
use crate::engine::{remote_bulk_read, remote_bulk_write, Connection, Engine};
use crate::error::Result;
use crate::types::{span_total, Span};

/// Factory for the `"__default__"` transfer manager type.
pub struct DefaultFactory;

#[async_trait]
impl TransferManagerFactory for DefaultFactory {
    fn validate(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        _engine: Arc<Engine>,
        _config: Value,
    ) -> Result<Arc<dyn TransferManager>> {
        Ok(Arc::new(DefaultTransferManager))
    }
}

struct DefaultTransferManager;

#[async_trait]
impl TransferManager for DefaultTransferManager {
    fn name(&self) -> &'static str {
        DEFAULT_TRANSFER_MANAGER
    }

    fn config(&self) -> Value {
        serde_json::json!({})
    }

    async fn pull(
        &self,
        region: &dyn WritableRegion,
        spans: &[Span],
        bulk: &BulkHandle,
        source: &Connection,
        bulk_offset: u64,
        persist: bool,
    ) -> Result<()> {
        let total = span_total(spans);
        if total == 0 {
            return Ok(());
        }
        let data = remote_bulk_read(source, bulk.id, bulk_offset, total).await?;
        region.write(spans, &data, persist).await
    }

    async fn push(
        &self,
        region: &dyn ReadableRegion,
        spans: &[Span],
        bulk: &BulkHandle,
        dest: &Connection,
        bulk_offset: u64,
    ) -> Result<()> {
        let total = span_total(spans);
        if total == 0 {
            return Ok(());
        }
        let data = region.read(spans).await?;
        remote_bulk_write(dest, bulk.id, bulk_offset, data).await
    }
}
