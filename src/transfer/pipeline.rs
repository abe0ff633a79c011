// SPDX-License-Identifier: Apache-2.0

//! The `pipeline` transfer manager.
//!
//! Splits the span list into chunks no larger than the largest pool buffer
//! and moves the chunks concurrently, bounded by a semaphore sized to the
//! configured pool. Overlaps wire transfers with region I/O for payloads
//! larger than one buffer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use validator::Validate;

use super::{TransferManager, TransferManagerFactory};
use crate::backend::{ReadableRegion, WritableRegion};
use crate::bulk::BulkHandle;
use crate::engine::{remote_bulk_read, remote_bulk_write, Connection, Engine};
use crate::error::{Error, Result};
use crate::types::{span_total, Span};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[validate(range(min = 1))]
    pub num_pools: u32,
    #[validate(range(min = 1))]
    pub num_buffers_per_pool: u32,
    #[validate(range(min = 1))]
    pub first_buffer_size: u64,
    #[validate(range(min = 2))]
    pub buffer_size_multiple: u64,
}

fn parse_config(config: &Value) -> Result<PipelineConfig> {
    let cfg: PipelineConfig = serde_json::from_value(config.clone()).map_err(|e| {
        Error::Config(format!(
            "invalid pipeline transfer manager configuration: {e}"
        ))
    })?;
    cfg.validate().map_err(|e| {
        Error::Config(format!(
            "invalid pipeline transfer manager configuration: {e}"
        ))
    })?;
    Ok(cfg)
}

/// Factory for the `"pipeline"` transfer manager type.
pub struct PipelineFactory;

#[async_trait]
impl TransferManagerFactory for PipelineFactory {
    fn validate(&self, config: &Value) -> Result<()> {
        parse_config(config).map(|_| ())
    }

    async fn create(
        &self,
        _engine: Arc<Engine>,
        config: Value,
    ) -> Result<Arc<dyn TransferManager>> {
        let cfg = parse_config(&config)?;
        let max_buffer_size = cfg
            .first_buffer_size
            .saturating_mul(cfg.buffer_size_multiple.saturating_pow(cfg.num_pools - 1));
        let permits = (cfg.num_pools as usize).saturating_mul(cfg.num_buffers_per_pool as usize);
        Ok(Arc::new(PipelineTransferManager {
            raw_config: config,
            max_buffer_size,
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }))
    }
}

struct PipelineTransferManager {
    raw_config: Value,
    max_buffer_size: u64,
    permits: Arc<Semaphore>,
}

/// Split a span list into chunks of at most `max_chunk` bytes, each paired
/// with its starting offset inside the remote buffer. Spans larger than
/// `max_chunk` are cut; chunks cover the bulk space contiguously.
fn split_chunks(spans: &[Span], bulk_offset: u64, max_chunk: u64) -> Vec<(u64, Vec<Span>)> {
    let mut chunks: Vec<(u64, Vec<Span>)> = Vec::new();
    let mut current: Vec<Span> = Vec::new();
    let mut current_size = 0u64;
    let mut current_offset = bulk_offset;
    let mut next_offset = bulk_offset;

    for span in spans {
        let mut offset = span.offset;
        let mut remaining = span.len;
        while remaining > 0 {
            let piece = remaining.min(max_chunk);
            if current_size + piece > max_chunk && !current.is_empty() {
                chunks.push((current_offset, std::mem::take(&mut current)));
                current_size = 0;
                current_offset = next_offset;
            }
            current.push(Span::new(offset, piece));
            current_size += piece;
            next_offset += piece;
            offset += piece;
            remaining -= piece;
        }
    }
    if !current.is_empty() {
        chunks.push((current_offset, current));
    }
    chunks
}

#[async_trait]
impl TransferManager for PipelineTransferManager {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn config(&self) -> Value {
        self.raw_config.clone()
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
        let chunks = split_chunks(spans, bulk_offset, self.max_buffer_size);
        let transfers = chunks.iter().map(|(chunk_offset, chunk_spans)| async move {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Transfer("transfer manager shut down".into()))?;
            let total = span_total(chunk_spans);
            let data = remote_bulk_read(source, bulk.id, *chunk_offset, total).await?;
            region.write(chunk_spans, &data, persist).await
        });
        futures::future::try_join_all(transfers).await?;
        Ok(())
    }

    async fn push(
        &self,
        region: &dyn ReadableRegion,
        spans: &[Span],
        bulk: &BulkHandle,
        dest: &Connection,
        bulk_offset: u64,
    ) -> Result<()> {
        let chunks = split_chunks(spans, bulk_offset, self.max_buffer_size);
        let transfers = chunks.iter().map(|(chunk_offset, chunk_spans)| async move {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Transfer("transfer manager shut down".into()))?;
            let data = region.read(chunk_spans).await?;
            remote_bulk_write(dest, bulk.id, *chunk_offset, data).await
        });
        futures::future::try_join_all(transfers).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_small_list_is_one_chunk() {
        let spans = [Span::new(0, 10), Span::new(20, 10)];
        let chunks = split_chunks(&spans, 0, 64);
        assert_eq!(chunks, vec![(0, spans.to_vec())]);
    }

    #[test]
    fn test_split_cuts_large_spans() {
        let chunks = split_chunks(&[Span::new(0, 100)], 0, 32);
        assert_eq!(
            chunks,
            vec![
                (0, vec![Span::new(0, 32)]),
                (32, vec![Span::new(32, 32)]),
                (64, vec![Span::new(64, 32)]),
                (96, vec![Span::new(96, 4)]),
            ]
        );
    }

    #[test]
    fn test_split_preserves_bulk_offsets() {
        let chunks = split_chunks(&[Span::new(0, 20), Span::new(40, 20)], 100, 24);
        // Chunks cover the bulk space contiguously starting at 100.
        let mut expected_offset = 100;
        for (offset, spans) in &chunks {
            assert_eq!(*offset, expected_offset);
            expected_offset += span_total(spans);
        }
        assert_eq!(expected_offset, 140);
    }

    #[test]
    fn test_split_skips_empty_spans() {
        let chunks = split_chunks(&[Span::new(0, 0), Span::new(4, 4)], 0, 8);
        assert_eq!(chunks, vec![(0, vec![Span::new(4, 4)])]);
    }

    #[test]
    fn test_config_validation() {
        assert!(parse_config(&serde_json::json!({
            "num_pools": 2, "num_buffers_per_pool": 8,
            "first_buffer_size": 1024, "buffer_size_multiple": 2,
        }))
        .is_ok());
        // Missing fields are rejected.
        assert!(parse_config(&serde_json::json!({ "num_pools": 2 })).is_err());
        // Range minima are enforced.
        assert!(parse_config(&serde_json::json!({
            "num_pools": 0, "num_buffers_per_pool": 8,
            "first_buffer_size": 1024, "buffer_size_multiple": 2,
        }))
        .is_err());
        assert!(parse_config(&serde_json::json!({
            "num_pools": 2, "num_buffers_per_pool": 8,
            "first_buffer_size": 1024, "buffer_size_multiple": 1,
        }))
        .is_err());
    }
}
