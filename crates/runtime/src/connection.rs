//! Connection layer for the driver protocol.
//!
//! This module implements request/response correlation and the remote object
//! registry on top of the transport. It handles:
//! - Generating unique request IDs
//! - Correlating responses with pending requests
//! - Creating and disposing objects on `__create__` / `__dispose__`
//! - Dispatching events to protocol objects
//!
//! # Message Flow
//!
//! 1. Client calls `send_message()` with GUID, method, and params
//! 2. Connection allocates an ID, registers a oneshot slot and writes the frame
//! 3. The caller pumps the dispatch loop: it takes the single reader, reads one
//!    frame, dispatches it, and repeats until its own slot is resolved
//! 4. Frames read on behalf of one caller may resolve other callers' slots;
//!    those callers wake up without reading anything themselves
//!
//! There is exactly one reader at a time (the receiver sits behind an async
//! mutex), and a frame is fully dispatched before the reader is released, so
//! frames are processed in arrival order no matter which caller reads them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex as ParkingLotMutex;
use pwchan_protocol::{
    CREATE_METHOD, CreateParams, DISPOSE_METHOD, DisposeParams, ErrorPayload, Event, Message,
    Metadata, Request, Response,
};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::channel_owner::{ChannelOwner, DisposeReason};
use crate::error::{Error, Result};
use crate::events::Slot;
use crate::remote_object::RemoteObject;
use crate::transport::{TransportParts, TransportReceiver, TransportSender};

mod object_store;

pub use object_store::ObjectStore;

/// GUID of the implicit root object.
pub const ROOT_GUID: &str = "";

/// Type alias for complex async return type
pub type AsyncValueResult<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// Trait defining the interface that ChannelOwner needs from a Connection
///
/// This trait allows ChannelOwner to work with Connection without depending
/// on its concrete type. The Connection struct implements this trait.
pub trait ConnectionLike: Send + Sync {
    /// Send a call to the driver and await its reply
    fn send_message(&self, guid: &str, method: &str, params: Value) -> AsyncValueResult<'_>;

    /// Pump the dispatch loop until `slot` is resolved
    fn pump_until(&self, slot: oneshot::Receiver<Result<Value>>) -> AsyncValueResult<'_>;

    /// Look up a live object by GUID
    fn get_existing_object(&self, guid: &str) -> Result<Arc<dyn ChannelOwner>>;

    /// Remove an object from the registry
    fn unregister_object(&self, guid: &str);

    /// Whether the connection has terminated
    fn is_closed(&self) -> bool;
}

/// Factory trait for creating protocol objects.
///
/// This trait decouples the Connection from specific proxy types. The facade
/// layer supplies one when the connection is built; see
/// [`TypeRegistry`](crate::TypeRegistry) for the table-driven implementation.
pub trait ObjectFactory: Send + Sync {
    /// Create a proxy for a `__create__` message.
    ///
    /// Runs inside the dispatch loop, so it must not perform I/O.
    ///
    /// # Arguments
    /// * `parent` - The object the `__create__` event was addressed to
    /// * `type_name` - Protocol type name (e.g., "Browser", "Page")
    /// * `guid` - Unique identifier for the object
    /// * `initializer` - JSON initializer from the driver
    fn create_object(
        &self,
        parent: Arc<dyn ChannelOwner>,
        type_name: &str,
        guid: Arc<str>,
        initializer: Value,
    ) -> Result<Arc<dyn ChannelOwner>>;
}

/// Connection tuning.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Attach [`Metadata`] to every call.
    pub attach_metadata: bool,
}

/// Connection to one driver process.
///
/// Owns the transport, the object registry and the pending-call table. All
/// of it is torn down when the connection terminates, either because the
/// transport closed, a protocol invariant was violated, or [`close`](Self::close)
/// was called.
pub struct Connection {
    /// Last allocated request ID
    last_id: AtomicU32,
    /// Pending request callbacks keyed by request ID
    callbacks: ParkingLotMutex<HashMap<u32, Slot>>,
    /// Write half; shared with detached write tasks
    sender: Arc<TokioMutex<Box<dyn TransportSender>>>,
    /// Read half; whoever holds the lock is the reader
    receiver: TokioMutex<Box<dyn TransportReceiver>>,
    /// Registry of all protocol objects by GUID
    objects: ObjectStore,
    factory: Arc<dyn ObjectFactory>,
    options: ConnectionOptions,
    /// Set once, with the reason, when the connection terminates
    closed: ParkingLotMutex<Option<String>>,
}

impl Connection {
    /// Create a new Connection with the given transport and object factory.
    pub fn new(parts: TransportParts, factory: Arc<dyn ObjectFactory>) -> Arc<Self> {
        Self::with_options(parts, factory, ConnectionOptions::default())
    }

    pub fn with_options(
        parts: TransportParts,
        factory: Arc<dyn ObjectFactory>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let TransportParts { sender, receiver } = parts;

        let connection = Arc::new(Self {
            last_id: AtomicU32::new(0),
            callbacks: ParkingLotMutex::new(HashMap::new()),
            sender: Arc::new(TokioMutex::new(sender)),
            receiver: TokioMutex::new(receiver),
            objects: ObjectStore::new(),
            factory,
            options,
            closed: ParkingLotMutex::new(None),
        });

        let root: Arc<dyn ChannelOwner> = Arc::new(RemoteObject::root(
            Arc::clone(&connection) as Arc<dyn ConnectionLike>
        ));
        // The registry is empty, so the root GUID cannot collide.
        let _ = connection.objects.insert_new(Arc::from(ROOT_GUID), root);

        connection
    }

    /// Sends a call to the driver and awaits the reply.
    pub async fn send_message(&self, guid: &str, method: &str, params: Value) -> Result<Value> {
        self.ensure_open()?;

        let id = match self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| last.checked_add(1))
        {
            Ok(last) => last + 1,
            Err(_) => {
                let err = Error::ProtocolError("request ids exhausted".to_string());
                self.terminate(&err.to_string());
                return Err(err);
            }
        };
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        let request = Request {
            id,
            guid: Arc::from(guid),
            method: method.to_string(),
            params,
            metadata: self.options.attach_metadata.then(Metadata::now),
        };
        let payload = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().insert(id, tx);
        // Termination drains callbacks after setting the flag, so checking
        // after the insert cannot strand this entry.
        if let Err(err) = self.ensure_open() {
            self.callbacks.lock().remove(&id);
            return Err(err);
        }

        tracing::debug!(id, guid, method, "sending call");

        // The write runs detached so a dropped caller never leaves half a
        // frame on the wire.
        let sender = Arc::clone(&self.sender);
        let write = tokio::spawn(async move { sender.lock().await.send(&payload).await });
        let written = match write.await {
            Ok(result) => result,
            Err(join_err) => Err(Error::Transport(format!("write task failed: {join_err}"))),
        };
        if let Err(err) = written {
            tracing::error!(id, error = %err, "failed to write call");
            self.terminate(&format!("write failed: {err}"));
            return Err(err);
        }

        self.pump_until(rx).await
    }

    /// Pumps the dispatch loop until `slot` is resolved.
    ///
    /// Only one task reads at a time. A task waiting for the reader wakes up
    /// as soon as its slot is resolved by whoever is reading.
    pub async fn pump_until(&self, mut slot: oneshot::Receiver<Result<Value>>) -> Result<Value> {
        loop {
            tokio::select! {
                biased;
                result = &mut slot => {
                    return result.unwrap_or_else(|_| Err(self.closed_error()));
                }
                mut receiver = self.receiver.lock() => {
                    match slot.try_recv() {
                        Ok(result) => return result,
                        Err(TryRecvError::Closed) => return Err(self.closed_error()),
                        Err(TryRecvError::Empty) => {}
                    }
                    if self.pump_one(&mut receiver).await.is_err() {
                        // The connection is terminated and every slot failed.
                        return slot.try_recv().unwrap_or_else(|_| Err(self.closed_error()));
                    }
                }
            }
        }
    }

    /// Pumps frames until the connection terminates.
    ///
    /// Useful when events must be delivered while no call is outstanding.
    /// Returns `Ok(())` when the connection was closed with [`close`](Self::close).
    pub async fn run(&self) -> Result<()> {
        loop {
            let mut receiver = self.receiver.lock().await;
            if let Err(err) = self.pump_one(&mut receiver).await {
                return match err {
                    Error::ConnectionClosed(_) => Ok(()),
                    err => Err(err),
                };
            }
        }
    }

    /// Waits, pumping the dispatch loop, until `guid` is registered.
    ///
    /// Used for the first object the driver announces after startup.
    pub async fn wait_for_object(&self, guid: &str) -> Result<Arc<dyn ChannelOwner>> {
        loop {
            if let Some(object) = self.objects.try_get(guid) {
                return Ok(object);
            }
            let mut receiver = self.receiver.lock().await;
            if let Some(object) = self.objects.try_get(guid) {
                return Ok(object);
            }
            self.pump_one(&mut receiver).await?;
        }
    }

    /// Registry lookup.
    pub fn get_existing_object(&self, guid: &str) -> Result<Arc<dyn ChannelOwner>> {
        self.objects
            .try_get(guid)
            .ok_or_else(|| Error::ObjectNotFound {
                guid: guid.to_string(),
            })
    }

    /// The implicit root object (GUID `""`).
    pub fn root(&self) -> Result<Arc<dyn ChannelOwner>> {
        self.get_existing_object(ROOT_GUID)
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Number of live objects, including the root.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Terminates the connection from this side and closes the driver's stdin.
    pub async fn close(&self) -> Result<()> {
        self.terminate("Connection closed by client");
        self.sender.lock().await.shutdown().await
    }

    /// Reads one frame and dispatches it. Any error terminates the connection.
    async fn pump_one(&self, receiver: &mut Box<dyn TransportReceiver>) -> Result<()> {
        self.ensure_open()?;

        let frame = match receiver.next_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                self.terminate(&err.to_string());
                return Err(err);
            }
        };
        tracing::trace!(frame = %String::from_utf8_lossy(&frame), "received frame");

        let dispatched = serde_json::from_slice::<Message>(&frame)
            .map_err(|e| Error::ProtocolError(format!("Malformed message: {e}")))
            .and_then(|message| self.dispatch_internal(message));

        if let Err(err) = dispatched {
            self.terminate(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Dispatch an incoming message (test-only public version)
    #[cfg(test)]
    pub fn dispatch(&self, message: Message) -> Result<()> {
        self.dispatch_internal(message)
    }

    fn dispatch_internal(&self, message: Message) -> Result<()> {
        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Event(event) => match event.method.as_str() {
                CREATE_METHOD => self.handle_create(event),
                DISPOSE_METHOD => self.handle_dispose(event),
                _ => {
                    let object = self.objects.try_get(&event.guid).ok_or_else(|| {
                        Error::ProtocolError(format!(
                            "Cannot find object to call {}: {}",
                            event.method, event.guid
                        ))
                    })?;
                    object.on_event(&event.method, event.params);
                    Ok(())
                }
            },
            Message::Request(request) => Err(Error::ProtocolError(format!(
                "Unexpected call from driver: id={}, method={}",
                request.id, request.method
            ))),
        }
    }

    fn handle_response(&self, response: Response) -> Result<()> {
        let callback = self.callbacks.lock().remove(&response.id).ok_or_else(|| {
            Error::ProtocolError(format!(
                "Cannot find request to respond: id={}",
                response.id
            ))
        })?;

        let result = match response.error {
            Some(wrapper) => Err(parse_protocol_error(wrapper.into_payload())),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        tracing::debug!(id = response.id, ok = result.is_ok(), "received reply");

        if callback.send(result).is_err() {
            tracing::debug!(id = response.id, "reply for abandoned call");
        }
        Ok(())
    }

    /// Handle `__create__` protocol message
    fn handle_create(&self, event: Event) -> Result<()> {
        let params: CreateParams = serde_json::from_value(event.params)
            .map_err(|e| Error::ProtocolError(format!("Malformed __create__: {e}")))?;

        let parent = self.objects.try_get(&event.guid).ok_or_else(|| {
            Error::ProtocolError(format!(
                "Cannot find parent object {} to create {}",
                event.guid, params.guid
            ))
        })?;

        let object_guid: Arc<str> = Arc::from(params.guid.as_str());
        if self.objects.contains(&object_guid) {
            return Err(Error::ProtocolError(format!(
                "Object already exists: {object_guid}"
            )));
        }

        let object = self
            .factory
            .create_object(
                Arc::clone(&parent),
                &params.type_name,
                Arc::clone(&object_guid),
                params.initializer,
            )
            .map_err(|e| {
                Error::ProtocolError(format!(
                    "Failed to create {} {}: {}",
                    params.type_name, object_guid, e
                ))
            })?;

        self.objects
            .insert_new(Arc::clone(&object_guid), Arc::clone(&object))?;
        parent.add_child(Arc::clone(&object_guid), object);

        tracing::debug!(
            type_name = %params.type_name,
            guid = %object_guid,
            parent = %event.guid,
            "created object"
        );
        Ok(())
    }

    /// Handle `__dispose__` protocol message
    fn handle_dispose(&self, event: Event) -> Result<()> {
        let params: DisposeParams = if event.params.is_null() {
            DisposeParams::default()
        } else {
            serde_json::from_value(event.params)
                .map_err(|e| Error::ProtocolError(format!("Malformed __dispose__: {e}")))?
        };

        let object = self.objects.try_get(&event.guid).ok_or_else(|| {
            Error::ProtocolError(format!("Cannot find object to dispose: {}", event.guid))
        })?;

        object.dispose(DisposeReason::from_wire(params.reason.as_deref()));
        Ok(())
    }

    /// Marks the connection closed and fails everything outstanding, once.
    fn terminate(&self, reason: &str) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.to_string());
        }
        tracing::warn!(reason, "connection terminated");

        let callbacks: Vec<_> = self.callbacks.lock().drain().collect();
        for (_, tx) in callbacks {
            let _ = tx.send(Err(Error::ConnectionClosed(reason.to_string())));
        }

        // Draining the registry also breaks the proxy -> connection cycles.
        for object in self.objects.drain() {
            object.on_connection_closed(reason);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.closed.lock().as_deref() {
            Some(reason) => Err(Error::ConnectionClosed(reason.to_string())),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .closed
            .lock()
            .clone()
            .unwrap_or_else(|| "result slot dropped".to_string());
        Error::ConnectionClosed(reason)
    }
}

/// Converts [`ErrorPayload`] from the driver into [`Error::Remote`].
fn parse_protocol_error(error: ErrorPayload) -> Error {
    Error::Remote {
        name: error.name.unwrap_or_else(|| "Error".to_string()),
        message: error.message,
        stack: error.stack,
    }
}

impl ConnectionLike for Connection {
    fn send_message(&self, guid: &str, method: &str, params: Value) -> AsyncValueResult<'_> {
        let guid = guid.to_string();
        let method = method.to_string();
        Box::pin(async move { Connection::send_message(self, &guid, &method, params).await })
    }

    fn pump_until(&self, slot: oneshot::Receiver<Result<Value>>) -> AsyncValueResult<'_> {
        Box::pin(Connection::pump_until(self, slot))
    }

    fn get_existing_object(&self, guid: &str) -> Result<Arc<dyn ChannelOwner>> {
        Connection::get_existing_object(self, guid)
    }

    fn unregister_object(&self, guid: &str) {
        self.objects.remove(guid);
    }

    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }
}

#[cfg(test)]
mod tests;
