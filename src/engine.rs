// SPDX-License-Identifier: Apache-2.0

//! The per-process endpoint shared by providers, clients and the migration
//! layer.
//!
//! An [`Engine`] owns a TCP listener and a set of bidirectional
//! [`Connection`]s. Either side of a connection can issue requests; frames
//! are multiplexed by request id and responses are routed back through a
//! pending-request map. The first frame on every connection is a `Hello`
//! carrying the dialer's advertised address, which is how a provider later
//! resolves "the caller's endpoint" for bulk traffic without a fresh dial.
//!
//! Requests are routed by provider id. [`ENGINE_PROVIDER_ID`] is reserved
//! for engine-level operations: the bulk buffer ops and the file-set
//! transfer ops of the migration subsystem. Every dispatched request is
//! answered exactly once, including when a handler panics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::bulk::{BulkReadArgs, BulkRegistry, BulkWriteArgs};
use crate::error::{Error, Result};
use crate::wire::{self, FrameCodec, FrameType, HelloHeader, RequestHeader, ResponseHeader};

/// Provider id reserved for engine-level operations (bulk and file-set).
pub const ENGINE_PROVIDER_ID: u16 = u16::MAX;

/// Context handed to request services along with the decoded arguments.
pub(crate) struct RequestContext {
    /// The connection the request arrived on; also the answer to "the
    /// caller's endpoint" when an address argument is empty.
    pub conn: Arc<Connection>,
}

/// Anything that can be registered on an engine to receive requests.
#[async_trait]
pub(crate) trait RequestService: Send + Sync {
    async fn handle(&self, op: &str, payload: Bytes, ctx: RequestContext) -> Result<Vec<u8>>;
}

struct OutboundFrame {
    frame_type: FrameType,
    header: Vec<u8>,
    payload: Vec<u8>,
}

/// One framed, bidirectional link to a remote engine.
pub struct Connection {
    peer_address: OnceLock<String>,
    tx: mpsc::Sender<OutboundFrame>,
    pending: DashMap<u64, oneshot::Sender<Result<Vec<u8>>>>,
    next_request_id: AtomicU64,
}

impl Connection {
    /// The advertised address of the remote engine, once its Hello arrived.
    pub fn peer_address(&self) -> Option<&str> {
        self.peer_address.get().map(String::as_str)
    }

    /// Issue a raw request and await the response envelope.
    pub(crate) async fn request(
        &self,
        provider_id: u16,
        op: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let header = wire::encode(&RequestHeader {
            request_id,
            provider_id,
            op: op.to_string(),
        })?;
        let frame = OutboundFrame {
            frame_type: FrameType::Request,
            header,
            payload,
        };
        if self.tx.send(frame).await.is_err() {
            self.pending.remove(&request_id);
            return Err(Error::Internal("connection closed".into()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(
                "connection closed before response arrived".into(),
            )),
        }
    }

    async fn send(&self, frame_type: FrameType, header: Vec<u8>, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(OutboundFrame {
                frame_type,
                header,
                payload,
            })
            .await
            .map_err(|_| Error::Internal("connection closed".into()))
    }
}

/// Issue a typed request on a connection.
pub(crate) async fn call<Req, Resp>(
    conn: &Connection,
    provider_id: u16,
    op: &str,
    args: &Req,
) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = wire::encode(args)?;
    let value = conn.request(provider_id, op, payload).await?;
    wire::decode(&value)
}

/// The per-process endpoint.
pub struct Engine {
    self_addr: String,
    tracker: TaskTracker,
    cancel: CancellationToken,
    bulk: BulkRegistry,
    providers: DashMap<u16, Weak<dyn RequestService>>,
    migration_server: parking_lot::RwLock<Option<Weak<dyn RequestService>>>,
    connections: DashMap<String, Arc<Connection>>,
}

impl Engine {
    /// Bind a listener and start accepting connections.
    ///
    /// Pass `"127.0.0.1:0"` to let the OS pick a port; the advertised
    /// address is available from [`Engine::self_addr`].
    pub async fn new(bind_addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {bind_addr}: {e}")))?;
        let self_addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("failed to read local address: {e}")))?
            .to_string();

        let engine = Arc::new(Self {
            self_addr,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            bulk: BulkRegistry::new(),
            providers: DashMap::new(),
            migration_server: parking_lot::RwLock::new(None),
            connections: DashMap::new(),
        });

        let accept_engine = engine.clone();
        engine.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_engine.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            stream.set_nodelay(true).ok();
                            accept_engine.spawn_connection(stream);
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        });

        trace!(address = %engine.self_addr, "engine listening");
        Ok(engine)
    }

    /// The address remote engines can dial to reach this one.
    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// The exposed-buffer registry of this engine.
    pub fn bulk(&self) -> &BulkRegistry {
        &self.bulk
    }

    /// Resolve an address to a connection, reusing a cached one when the
    /// remote engine is already connected (in either direction).
    pub async fn lookup(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.get(address) {
            return Ok(conn.clone());
        }
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Internal(format!("failed to look up address {address}: {e}")))?;
        stream.set_nodelay(true).ok();
        let conn = self.spawn_connection(stream);
        self.connections.insert(address.to_string(), conn.clone());
        Ok(conn)
    }

    /// Stop accepting work and wait for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub(crate) fn register_provider(
        &self,
        provider_id: u16,
        service: Weak<dyn RequestService>,
    ) -> Result<()> {
        if provider_id == ENGINE_PROVIDER_ID {
            return Err(Error::Config(format!(
                "provider id {provider_id} is reserved for engine operations"
            )));
        }
        match self.providers.entry(provider_id) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().upgrade().is_some() {
                    return Err(Error::Config(format!(
                        "a provider with id {provider_id} is already registered on this engine"
                    )));
                }
                e.insert(service);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(service);
            }
        }
        Ok(())
    }

    pub(crate) fn deregister_provider(&self, provider_id: u16) {
        self.providers.remove(&provider_id);
    }

    pub(crate) fn set_migration_server(&self, service: Weak<dyn RequestService>) -> Result<()> {
        let mut slot = self.migration_server.write();
        if slot.as_ref().and_then(Weak::upgrade).is_some() {
            return Err(Error::Config(
                "a migration server is already registered on this engine".into(),
            ));
        }
        *slot = Some(service);
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream) -> Arc<Connection> {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(64);
        let conn = Arc::new(Connection {
            peer_address: OnceLock::new(),
            tx,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        });

        // Writer task: drains the outbound queue onto the socket.
        let writer_cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(f) => {
                            if let Err(e) = FrameCodec::encode_frame(
                                &mut write_half, f.frame_type, &f.header, &f.payload,
                            ).await {
                                debug!(error = %e, "connection writer stopped");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        // Greet the peer with our advertised address before anything else.
        if let Ok(header) = wire::encode(&HelloHeader {
            address: self.self_addr.clone(),
        }) {
            let _ = conn.tx.try_send(OutboundFrame {
                frame_type: FrameType::Hello,
                header,
                payload: Vec::new(),
            });
        }

        // Reader task: decodes frames and hands them to the dispatcher. The
        // loop never awaits a handler inline, so responses to nested
        // requests keep flowing while one is in progress.
        let engine = self.clone();
        let reader_conn = conn.clone();
        self.tracker.spawn(async move {
            let mut framed = FramedRead::new(read_half, FrameCodec::new());
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    frame = framed.next() => match frame {
                        Some(Ok((frame_type, header, payload))) => {
                            engine.process_frame(&reader_conn, frame_type, header, payload);
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "connection reader stopped");
                            break;
                        }
                        None => break,
                    }
                }
            }

            // Fail whatever was still waiting on this connection.
            let pending_ids: Vec<u64> = reader_conn.pending.iter().map(|e| *e.key()).collect();
            for id in pending_ids {
                if let Some((_, tx)) = reader_conn.pending.remove(&id) {
                    let _ = tx.send(Err(Error::Internal("connection closed".into())));
                }
            }
            if let Some(addr) = reader_conn.peer_address.get() {
                engine
                    .connections
                    .remove_if(addr, |_, cached| Arc::ptr_eq(cached, &reader_conn));
            }
        });

        conn
    }

    fn process_frame(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        frame_type: FrameType,
        header: Bytes,
        payload: Bytes,
    ) {
        match frame_type {
            FrameType::Hello => match wire::decode::<HelloHeader>(&header) {
                Ok(hello) if !hello.address.is_empty() => {
                    let _ = conn.peer_address.set(hello.address.clone());
                    self.connections.insert(hello.address, conn.clone());
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring malformed hello frame"),
            },
            FrameType::Request => match wire::decode::<RequestHeader>(&header) {
                Ok(request) => {
                    let engine = self.clone();
                    let conn = conn.clone();
                    self.tracker.spawn(async move {
                        Self::dispatch_request(engine, conn, request, payload).await;
                    });
                }
                // Without a request id there is nothing to respond to.
                Err(e) => debug!(error = %e, "dropping malformed request frame"),
            },
            FrameType::Response => match wire::decode::<ResponseHeader>(&header) {
                Ok(response) => {
                    if let Some((_, tx)) = conn.pending.remove(&response.request_id) {
                        let envelope: Result<Vec<u8>> = match wire::decode(&payload) {
                            Ok(result) => result,
                            Err(e) => Err(e),
                        };
                        let _ = tx.send(envelope);
                    } else {
                        debug!(
                            request_id = response.request_id,
                            "dropping response for unknown request"
                        );
                    }
                }
                Err(e) => debug!(error = %e, "dropping malformed response frame"),
            },
        }
    }

    /// Run one request to completion and respond exactly once, even when
    /// the handler panics.
    async fn dispatch_request(
        engine: Arc<Self>,
        conn: Arc<Connection>,
        request: RequestHeader,
        payload: Bytes,
    ) {
        let request_id = request.request_id;
        let result = AssertUnwindSafe(Self::route(engine, conn.clone(), request, payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal("request handler panicked".into())));

        let envelope = match wire::encode(&result) {
            Ok(bytes) => bytes,
            Err(e) => match wire::encode::<Result<Vec<u8>>>(&Err(e)) {
                Ok(bytes) => bytes,
                Err(_) => return,
            },
        };
        let header = match wire::encode(&ResponseHeader { request_id }) {
            Ok(header) => header,
            Err(_) => return,
        };
        let _ = conn.send(FrameType::Response, header, envelope).await;
    }

    async fn route(
        engine: Arc<Self>,
        conn: Arc<Connection>,
        request: RequestHeader,
        payload: Bytes,
    ) -> Result<Vec<u8>> {
        if request.provider_id == ENGINE_PROVIDER_ID {
            return engine.handle_engine_op(&request.op, payload, conn).await;
        }
        let service = engine
            .providers
            .get(&request.provider_id)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no provider with id {} on this endpoint",
                    request.provider_id
                ))
            })?;
        service
            .handle(&request.op, payload, RequestContext { conn })
            .await
    }

    async fn handle_engine_op(
        self: &Arc<Self>,
        op: &str,
        payload: Bytes,
        conn: Arc<Connection>,
    ) -> Result<Vec<u8>> {
        match op {
            "bulk_read" => {
                let args: BulkReadArgs = wire::decode(&payload)?;
                let data = self.bulk.read(args.handle, args.offset, args.len)?;
                wire::encode(&data)
            }
            "bulk_write" => {
                let args: BulkWriteArgs = wire::decode(&payload)?;
                self.bulk.write(args.handle, args.offset, &args.data)?;
                wire::encode(&())
            }
            op if op.starts_with("fileset_") => {
                let server = self
                    .migration_server
                    .read()
                    .clone()
                    .and_then(|weak| weak.upgrade())
                    .ok_or_else(|| {
                        Error::Transfer("no migration server registered on this endpoint".into())
                    })?;
                server.handle(op, payload, RequestContext { conn }).await
            }
            _ => Err(Error::Internal(format!("unknown engine operation \"{op}\""))),
        }
    }
}

/// Read bytes from a buffer exposed on a remote engine.
pub async fn remote_bulk_read(
    conn: &Connection,
    handle: u64,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let data: Vec<u8> = call(
        conn,
        ENGINE_PROVIDER_ID,
        "bulk_read",
        &BulkReadArgs {
            handle,
            offset,
            len,
        },
    )
    .await?;
    if data.len() as u64 != len {
        return Err(Error::Transfer(format!(
            "remote bulk read returned {} bytes, expected {len}",
            data.len()
        )));
    }
    Ok(data)
}

/// Write bytes into a buffer exposed on a remote engine.
pub async fn remote_bulk_write(
    conn: &Connection,
    handle: u64,
    offset: u64,
    data: Vec<u8>,
) -> Result<()> {
    call(
        conn,
        ENGINE_PROVIDER_ID,
        "bulk_write",
        &BulkWriteArgs {
            handle,
            offset,
            data,
        },
    )
    .await
}
