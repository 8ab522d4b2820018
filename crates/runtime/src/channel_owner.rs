//! ChannelOwner - Base trait for all remote object proxies.
//!
//! Every remote object announced by the driver is represented locally by a
//! ChannelOwner, which:
//! - Represents the remote object via its GUID
//! - Participates in parent-child structure (lifetime is owned by the registry)
//! - Receives protocol events and resolves event waiters
//! - Communicates via a Channel proxy

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use downcast_rs::{DowncastSync, impl_downcast};
use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::Channel;
use crate::connection::ConnectionLike;
use crate::error::Error;
use crate::events::{EventWaiter, EventWaiters};

/// Private module for the sealed trait pattern.
pub mod private {
    /// Marker trait that seals `ChannelOwner`.
    pub trait Sealed {}
}

/// Type alias for the children registry.
type ChildrenRegistry = HashMap<Arc<str>, Arc<dyn ChannelOwner>>;

/// Reason why an object was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// Object was closed or destroyed on the driver side.
    Closed,
    /// Object was garbage collected by the driver.
    GarbageCollected,
}

impl DisposeReason {
    /// Maps the `reason` field of a `__dispose__` event.
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason {
            Some("gc") => DisposeReason::GarbageCollected,
            _ => DisposeReason::Closed,
        }
    }
}

/// Parent can be either another ChannelOwner or, for the root, the Connection.
pub enum ParentOrConnection {
    Parent(Arc<dyn ChannelOwner>),
    Connection(Arc<dyn ConnectionLike>),
}

/// Base trait for all remote object proxies.
///
/// This trait is sealed; facade crates opt in through [`private::Sealed`].
pub trait ChannelOwner: private::Sealed + DowncastSync {
    /// Returns the unique GUID for this object.
    fn guid(&self) -> &str;

    /// Returns the protocol type name (e.g., "Browser", "Page").
    fn type_name(&self) -> &str;

    /// Returns the parent object, if any.
    fn parent(&self) -> Option<Arc<dyn ChannelOwner>>;

    /// Returns the connection this object belongs to.
    fn connection(&self) -> Arc<dyn ConnectionLike>;

    /// Returns the raw initializer JSON from the driver.
    fn initializer(&self) -> &Value;

    /// Returns the channel for RPC communication.
    fn channel(&self) -> &Channel;

    /// Disposes this object and all its children.
    fn dispose(&self, reason: DisposeReason);

    /// Adds a child object to this parent's registry.
    fn add_child(&self, guid: Arc<str>, child: Arc<dyn ChannelOwner>);

    /// Removes a child object from this parent's registry.
    fn remove_child(&self, guid: &str);

    /// Returns the current children.
    fn children(&self) -> Vec<Arc<dyn ChannelOwner>>;

    /// Handles a protocol event sent to this object.
    fn on_event(&self, method: &str, params: Value);

    /// Registers a one-shot waiter for the next `event` on this object.
    fn wait_for_event(&self, event: &str) -> EventWaiter;

    /// Called once when the connection terminates.
    fn on_connection_closed(&self, reason: &str);

    /// Returns true once the object was disposed or its connection closed.
    fn is_disposed(&self) -> bool;

    /// Returns true if this object was garbage collected.
    fn was_collected(&self) -> bool;
}

impl_downcast!(sync ChannelOwner);

/// Base implementation of ChannelOwner that can be embedded in proxy types.
pub struct ChannelOwnerImpl {
    guid: Arc<str>,
    type_name: String,
    parent: Option<Weak<dyn ChannelOwner>>,
    connection: Arc<dyn ConnectionLike>,
    children: Mutex<ChildrenRegistry>,
    channel: Channel,
    initializer: Value,
    waiters: EventWaiters,
    disposed: AtomicBool,
    was_collected: AtomicBool,
    /// Termination reason once the connection has closed
    closed: Mutex<Option<String>>,
}

impl ChannelOwnerImpl {
    /// Creates a new ChannelOwner base implementation.
    ///
    /// No I/O happens here; the connection registers the finished proxy.
    pub fn new(
        parent: ParentOrConnection,
        type_name: String,
        guid: Arc<str>,
        initializer: Value,
    ) -> Self {
        let (connection, parent_opt) = match parent {
            ParentOrConnection::Parent(p) => {
                let conn = p.connection();
                (conn, Some(Arc::downgrade(&p)))
            }
            ParentOrConnection::Connection(c) => (c, None),
        };

        let channel = Channel::new(Arc::clone(&guid), connection.clone());

        Self {
            guid,
            type_name,
            parent: parent_opt,
            connection,
            children: Mutex::new(HashMap::new()),
            channel,
            initializer,
            waiters: EventWaiters::new(),
            disposed: AtomicBool::new(false),
            was_collected: AtomicBool::new(false),
            closed: Mutex::new(None),
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn parent(&self) -> Option<Arc<dyn ChannelOwner>> {
        self.parent.as_ref().and_then(|p| p.upgrade())
    }

    pub fn connection(&self) -> Arc<dyn ConnectionLike> {
        self.connection.clone()
    }

    pub fn initializer(&self) -> &Value {
        &self.initializer
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Disposes this object and all children recursively.
    ///
    /// Pending waiters fail with [`Error::Disposed`]. Disposing twice is a no-op.
    pub fn dispose(&self, reason: DisposeReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if reason == DisposeReason::GarbageCollected {
            self.was_collected.store(true, Ordering::SeqCst);
        }

        if let Some(parent) = self.parent() {
            parent.remove_child(&self.guid);
        }

        self.connection.unregister_object(&self.guid);

        let failed = self.waiters.fail_all(|| Error::Disposed {
            guid: self.guid.to_string(),
        });
        tracing::debug!(
            guid = %self.guid,
            type_name = %self.type_name,
            ?reason,
            failed_waiters = failed,
            "disposed object"
        );

        let children: Vec<_> = self.children.lock().drain().map(|(_, c)| c).collect();
        for child in children {
            child.dispose(reason);
        }
    }

    pub fn add_child(&self, guid: Arc<str>, child: Arc<dyn ChannelOwner>) {
        self.children.lock().insert(guid, child);
    }

    pub fn remove_child(&self, guid: &str) {
        self.children.lock().remove(guid);
    }

    pub fn children(&self) -> Vec<Arc<dyn ChannelOwner>> {
        self.children.lock().values().cloned().collect()
    }

    /// Resolves every waiter currently registered for `method`.
    pub fn on_event(&self, method: &str, params: Value) {
        let resolved = self.waiters.fire(method, &params);
        tracing::debug!(
            guid = %self.guid,
            type_name = %self.type_name,
            method,
            resolved,
            "event"
        );
    }

    /// Registers a waiter; fails immediately if the object is already gone.
    pub fn wait_for_event(&self, event: &str) -> EventWaiter {
        if let Some(reason) = self.closed.lock().clone() {
            return EventWaiter::settled(
                event,
                Err(Error::ConnectionClosed(reason)),
                self.connection.clone(),
            );
        }
        if self.is_disposed() {
            return EventWaiter::settled(
                event,
                Err(Error::Disposed {
                    guid: self.guid.to_string(),
                }),
                self.connection.clone(),
            );
        }
        let rx = self.waiters.register(event);
        EventWaiter::new(event, rx, self.connection.clone())
    }

    /// Number of waiters pending for `event`.
    pub fn pending_waiters(&self, event: &str) -> usize {
        self.waiters.pending(event)
    }

    /// Marks the object inert and fails its waiters with `ConnectionClosed`.
    pub fn on_connection_closed(&self, reason: &str) {
        *self.closed.lock() = Some(reason.to_string());
        self.disposed.store(true, Ordering::SeqCst);
        self.waiters
            .fail_all(|| Error::ConnectionClosed(reason.to_string()));
        self.children.lock().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn was_collected(&self) -> bool {
        self.was_collected.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ChannelOwnerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOwnerImpl")
            .field("guid", &self.guid)
            .field("type_name", &self.type_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
