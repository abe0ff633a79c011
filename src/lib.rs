// SPDX-License-Identifier: Apache-2.0

//! Warabi: a remote region storage service.
//!
//! A [`Provider`] hosts storage *targets*: UUID-identified pools of
//! fixed-length byte *regions* served by a pluggable [`backend`]. Clients
//! create regions, write bytes at offsets, persist them to stable media,
//! read them back, and erase them, either with payloads inlined in the
//! RPC (eager I/O) or through exposed buffers moved by a per-target
//! [`transfer`] manager. A live [`migration`] protocol moves an entire
//! target, files and identity, from one provider to another with
//! install-or-rollback semantics.
//!
//! Everything on a process shares one [`Engine`]: the listener, the
//! connection cache, the exposed-buffer registry and the worker pool.
//!
//! ```ignore
//! let engine = Engine::new("127.0.0.1:0").await?;
//! let provider = Provider::new(engine.clone(), 42, "{}", None, None).await?;
//!
//! let client = Client::new(engine.clone());
//! let target = client
//!     .add_target(engine.self_addr(), 42, "memory", "{}")
//!     .await?;
//! let handle = client
//!     .make_target_handle(engine.self_addr(), 42, target, true)
//!     .await?;
//! let region = handle.create(1024).await?;
//! handle.write(&region, 0, b"hello", true).await?;
//! assert_eq!(handle.read(&region, 0, 5).await?, b"hello");
//! ```

pub mod backend;
pub mod bulk;
pub mod client;
pub mod engine;
pub mod error;
pub mod migration;
pub mod provider;
pub mod transfer;
pub mod types;
pub mod wire;

pub use bulk::{BulkHandle, BulkMode};
pub use client::{Client, TargetHandle};
pub use engine::Engine;
pub use error::{Error, Result};
pub use migration::{MigrationClient, MigrationOptions, MigrationServer};
pub use provider::Provider;
pub use types::{RegionId, Span, TargetId};
