// SPDX-License-Identifier: Apache-2.0

//! Exposed-buffer registry backing the non-eager I/O path.
//!
//! A caller exposes a local buffer and sends the resulting [`BulkHandle`] in
//! an RPC; the remote side then moves bytes with the `bulk_read` /
//! `bulk_write` engine operations, addressing the buffer by id and offset.
//! The registry enforces the exposure mode: a `ReadOnly` buffer feeds the
//! write path (the provider pulls from it), a `WriteOnly` buffer receives
//! the read path (the provider pushes into it).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Remote memory descriptor for one exposed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHandle {
    pub id: u64,
    pub size: u64,
}

/// Access granted to remote peers on an exposed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Remote peers may read (source of a write/pull).
    ReadOnly,
    /// Remote peers may write (sink of a read/push).
    WriteOnly,
}

struct Exposed {
    mode: BulkMode,
    data: Mutex<Vec<u8>>,
}

/// Per-engine registry of exposed buffers.
pub struct BulkRegistry {
    buffers: DashMap<u64, Exposed>,
    next_id: AtomicU64,
}

/// Arguments of the `bulk_read` engine op.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BulkReadArgs {
    pub handle: u64,
    pub offset: u64,
    pub len: u64,
}

/// Arguments of the `bulk_write` engine op.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BulkWriteArgs {
    pub handle: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl BulkRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buffers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Expose a buffer to remote peers and return its descriptor.
    pub fn expose(&self, data: Vec<u8>, mode: BulkMode) -> BulkHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let size = data.len() as u64;
        self.buffers.insert(
            id,
            Exposed {
                mode,
                data: Mutex::new(data),
            },
        );
        BulkHandle { id, size }
    }

    /// Withdraw an exposed buffer and return its contents.
    pub fn take(&self, id: u64) -> Option<Vec<u8>> {
        self.buffers.remove(&id).map(|(_, e)| e.data.into_inner())
    }

    /// Read `len` bytes at `offset` from an exposed `ReadOnly` buffer.
    pub fn read(&self, id: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let entry = self
            .buffers
            .get(&id)
            .ok_or_else(|| Error::Transfer(format!("unknown bulk handle {id}")))?;
        if entry.mode != BulkMode::ReadOnly {
            return Err(Error::Transfer(format!(
                "bulk handle {id} was not exposed for reading"
            )));
        }
        let data = entry.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                Error::Transfer(format!(
                    "bulk read of {len} bytes at offset {offset} exceeds buffer of {} bytes",
                    data.len()
                ))
            })?;
        Ok(data[start..end].to_vec())
    }

    /// Write bytes at `offset` into an exposed `WriteOnly` buffer.
    pub fn write(&self, id: u64, offset: u64, bytes: &[u8]) -> Result<()> {
        let entry = self
            .buffers
            .get(&id)
            .ok_or_else(|| Error::Transfer(format!("unknown bulk handle {id}")))?;
        if entry.mode != BulkMode::WriteOnly {
            return Err(Error::Transfer(format!(
                "bulk handle {id} was not exposed for writing"
            )));
        }
        let mut data = entry.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                Error::Transfer(format!(
                    "bulk write of {} bytes at offset {offset} exceeds buffer of {} bytes",
                    bytes.len(),
                    data.len()
                ))
            })?;
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}
