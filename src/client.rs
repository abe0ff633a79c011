// SPDX-License-Identifier: Apache-2.0

//! Typed client surface over the provider RPC table.
//!
//! [`Client`] carries the admin calls; [`TargetHandle`] is the data-plane
//! handle bound to one target. Payloads at or below the handle's eager
//! thresholds ride inline in the RPC; larger ones go through an exposed
//! buffer and the provider's transfer manager.

use std::sync::Arc;

use crate::bulk::BulkMode;
use crate::engine::{call, Connection, Engine};
use crate::error::{Error, Result};
use crate::migration::MigrationOptions;
use crate::types::{span_total, RegionId, Span, TargetId};

/// Payload size at or below which I/O is inlined in the RPC.
const DEFAULT_EAGER_THRESHOLD: usize = 2048;

/// Client handle bound to an engine.
pub struct Client {
    engine: Arc<Engine>,
}

impl Client {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    async fn connect(&self, address: &str) -> Result<Arc<Connection>> {
        self.engine.lookup(address).await
    }

    /// Register a target on a remote provider; returns its new UUID.
    pub async fn add_target(
        &self,
        address: &str,
        provider_id: u16,
        target_type: &str,
        config: &str,
    ) -> Result<TargetId> {
        let conn = self.connect(address).await?;
        call(&conn, provider_id, "add_target", &(target_type, config)).await
    }

    /// Remove a target from the provider's registry, leaving its storage.
    pub async fn remove_target(
        &self,
        address: &str,
        provider_id: u16,
        target_id: TargetId,
    ) -> Result<()> {
        let conn = self.connect(address).await?;
        call(&conn, provider_id, "remove_target", &(target_id,)).await
    }

    /// Remove a target and free its persistent storage.
    pub async fn destroy_target(
        &self,
        address: &str,
        provider_id: u16,
        target_id: TargetId,
    ) -> Result<()> {
        let conn = self.connect(address).await?;
        call(&conn, provider_id, "destroy_target", &(target_id,)).await
    }

    /// Register a named transfer manager on a remote provider.
    pub async fn add_transfer_manager(
        &self,
        address: &str,
        provider_id: u16,
        name: &str,
        manager_type: &str,
        config: &str,
    ) -> Result<()> {
        let conn = self.connect(address).await?;
        call(
            &conn,
            provider_id,
            "add_transfer_manager",
            &(name, manager_type, config),
        )
        .await
    }

    /// Check that a target exists.
    pub async fn check_target(
        &self,
        address: &str,
        provider_id: u16,
        target_id: TargetId,
    ) -> Result<()> {
        let conn = self.connect(address).await?;
        call(&conn, provider_id, "check_target", &(target_id,)).await
    }

    /// Ask a provider to migrate one of its targets to another provider.
    pub async fn migrate_target(
        &self,
        address: &str,
        provider_id: u16,
        target_id: TargetId,
        dest_address: &str,
        dest_provider_id: u16,
        options: &MigrationOptions,
    ) -> Result<()> {
        let conn = self.connect(address).await?;
        call(
            &conn,
            provider_id,
            "migrate_target",
            &(target_id, dest_address, dest_provider_id, options),
        )
        .await
    }

    /// Build a data-plane handle for one target. With `check`, the target's
    /// existence is verified first.
    pub async fn make_target_handle(
        &self,
        address: &str,
        provider_id: u16,
        target_id: TargetId,
        check: bool,
    ) -> Result<TargetHandle> {
        let conn = self.connect(address).await?;
        if check {
            call::<_, ()>(&conn, provider_id, "check_target", &(target_id,)).await?;
        }
        Ok(TargetHandle {
            engine: self.engine.clone(),
            conn,
            provider_id,
            target_id,
            eager_write_threshold: DEFAULT_EAGER_THRESHOLD,
            eager_read_threshold: DEFAULT_EAGER_THRESHOLD,
        })
    }
}

/// Data-plane handle bound to one target of one provider.
pub struct TargetHandle {
    engine: Arc<Engine>,
    conn: Arc<Connection>,
    provider_id: u16,
    target_id: TargetId,
    eager_write_threshold: usize,
    eager_read_threshold: usize,
}

impl TargetHandle {
    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    /// Writes up to this many bytes ride inline in the RPC.
    pub fn set_eager_write_threshold(&mut self, bytes: usize) {
        self.eager_write_threshold = bytes;
    }

    /// Reads up to this many bytes ride inline in the response.
    pub fn set_eager_read_threshold(&mut self, bytes: usize) {
        self.eager_read_threshold = bytes;
    }

    /// Allocate a region of exactly `size` bytes.
    pub async fn create(&self, size: u64) -> Result<RegionId> {
        call(&self.conn, self.provider_id, "create", &(self.target_id, size)).await
    }

    /// Write `data` at `offset`.
    pub async fn write(
        &self,
        region_id: &RegionId,
        offset: u64,
        data: &[u8],
        persist: bool,
    ) -> Result<()> {
        self.write_spans(region_id, &[Span::new(offset, data.len() as u64)], data, persist)
            .await
    }

    /// Write `data` into the listed spans, in list order.
    pub async fn write_spans(
        &self,
        region_id: &RegionId,
        spans: &[Span],
        data: &[u8],
        persist: bool,
    ) -> Result<()> {
        if data.len() <= self.eager_write_threshold {
            call(
                &self.conn,
                self.provider_id,
                "write_eager",
                &(self.target_id, region_id, spans, data, persist),
            )
            .await
        } else {
            let handle = self.engine.bulk().expose(data.to_vec(), BulkMode::ReadOnly);
            let result = call(
                &self.conn,
                self.provider_id,
                "write",
                &(self.target_id, region_id, spans, handle, "", 0u64, persist),
            )
            .await;
            self.engine.bulk().take(handle.id);
            result
        }
    }

    /// Read `len` bytes at `offset`.
    pub async fn read(&self, region_id: &RegionId, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.read_spans(region_id, &[Span::new(offset, len)]).await
    }

    /// Read the listed spans, concatenated in list order.
    pub async fn read_spans(&self, region_id: &RegionId, spans: &[Span]) -> Result<Vec<u8>> {
        let total = span_total(spans) as usize;
        if total <= self.eager_read_threshold {
            call(
                &self.conn,
                self.provider_id,
                "read_eager",
                &(self.target_id, region_id, spans),
            )
            .await
        } else {
            let handle = self.engine.bulk().expose(vec![0u8; total], BulkMode::WriteOnly);
            let result: Result<()> = call(
                &self.conn,
                self.provider_id,
                "read",
                &(self.target_id, region_id, spans, handle, "", 0u64),
            )
            .await;
            let data = self.engine.bulk().take(handle.id);
            result?;
            data.ok_or_else(|| Error::Internal("exposed read buffer disappeared".into()))
        }
    }

    /// Flush `len` bytes at `offset` to stable media.
    pub async fn persist(&self, region_id: &RegionId, offset: u64, len: u64) -> Result<()> {
        call(
            &self.conn,
            self.provider_id,
            "persist",
            &(self.target_id, region_id, [Span::new(offset, len)]),
        )
        .await
    }

    /// Allocate a region sized to `data` and fill it in one round-trip.
    pub async fn create_and_write(&self, data: &[u8], persist: bool) -> Result<RegionId> {
        if data.len() <= self.eager_write_threshold {
            call(
                &self.conn,
                self.provider_id,
                "create_write_eager",
                &(self.target_id, data, persist),
            )
            .await
        } else {
            let handle = self.engine.bulk().expose(data.to_vec(), BulkMode::ReadOnly);
            let result = call(
                &self.conn,
                self.provider_id,
                "create_write",
                &(self.target_id, handle, "", 0u64, data.len() as u64, persist),
            )
            .await;
            self.engine.bulk().take(handle.id);
            result
        }
    }

    /// Remove a region.
    pub async fn erase(&self, region_id: &RegionId) -> Result<()> {
        call(
            &self.conn,
            self.provider_id,
            "erase",
            &(self.target_id, region_id),
        )
        .await
    }
}
