//! Generic remote object proxy and the table-driven object factory.
//!
//! [`RemoteObject`] is the proxy for every type without a dedicated facade
//! (and for the implicit root). [`TypeRegistry`] maps protocol type names to
//! constructors and falls back to [`RemoteObject`] for unknown types, so a
//! newer driver announcing new types keeps working.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::channel::Channel;
use crate::channel_owner::{
    ChannelOwner, ChannelOwnerImpl, DisposeReason, ParentOrConnection, private,
};
use crate::connection::{ConnectionLike, ObjectFactory, ROOT_GUID};
use crate::error::{Error, Result};
use crate::events::EventWaiter;

/// Proxy for a remote object with no type-specific behavior.
pub struct RemoteObject {
    base: ChannelOwnerImpl,
}

impl RemoteObject {
    pub fn new(
        parent: Arc<dyn ChannelOwner>,
        type_name: &str,
        guid: Arc<str>,
        initializer: Value,
    ) -> Self {
        Self {
            base: ChannelOwnerImpl::new(
                ParentOrConnection::Parent(parent),
                type_name.to_string(),
                guid,
                initializer,
            ),
        }
    }

    /// The implicit root every top-level `__create__` is addressed to.
    pub(crate) fn root(connection: Arc<dyn ConnectionLike>) -> Self {
        Self {
            base: ChannelOwnerImpl::new(
                ParentOrConnection::Connection(connection),
                "Root".to_string(),
                Arc::from(ROOT_GUID),
                Value::Object(Default::default()),
            ),
        }
    }

    pub fn base(&self) -> &ChannelOwnerImpl {
        &self.base
    }
}

impl private::Sealed for RemoteObject {}

impl ChannelOwner for RemoteObject {
    fn guid(&self) -> &str {
        self.base.guid()
    }

    fn type_name(&self) -> &str {
        self.base.type_name()
    }

    fn parent(&self) -> Option<Arc<dyn ChannelOwner>> {
        self.base.parent()
    }

    fn connection(&self) -> Arc<dyn ConnectionLike> {
        self.base.connection()
    }

    fn initializer(&self) -> &Value {
        self.base.initializer()
    }

    fn channel(&self) -> &Channel {
        self.base.channel()
    }

    fn dispose(&self, reason: DisposeReason) {
        self.base.dispose(reason)
    }

    fn add_child(&self, guid: Arc<str>, child: Arc<dyn ChannelOwner>) {
        self.base.add_child(guid, child)
    }

    fn remove_child(&self, guid: &str) {
        self.base.remove_child(guid)
    }

    fn children(&self) -> Vec<Arc<dyn ChannelOwner>> {
        self.base.children()
    }

    fn on_event(&self, method: &str, params: Value) {
        self.base.on_event(method, params)
    }

    fn wait_for_event(&self, event: &str) -> EventWaiter {
        self.base.wait_for_event(event)
    }

    fn on_connection_closed(&self, reason: &str) {
        self.base.on_connection_closed(reason)
    }

    fn is_disposed(&self) -> bool {
        self.base.is_disposed()
    }

    fn was_collected(&self) -> bool {
        self.base.was_collected()
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("guid", &self.guid())
            .field("type_name", &self.type_name())
            .finish()
    }
}

/// Constructor for one protocol type.
pub type Constructor = Arc<
    dyn Fn(Arc<dyn ChannelOwner>, &str, Arc<str>, Value) -> Result<Arc<dyn ChannelOwner>>
        + Send
        + Sync,
>;

/// [`ObjectFactory`] backed by a table of constructors keyed by type name.
///
/// # Example
///
/// ```ignore
/// let factory = TypeRegistry::new().register("Page", |parent, type_name, guid, init| {
///     Ok(Arc::new(Page::new(parent, type_name, guid, init)?) as Arc<dyn ChannelOwner>)
/// });
/// let connection = Connection::new(parts, Arc::new(factory));
/// ```
#[derive(Default, Clone)]
pub struct TypeRegistry {
    constructors: HashMap<String, Constructor>,
    strict: bool,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that rejects unknown types with [`Error::UnknownObjectType`].
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Registers a constructor for `type_name`, replacing any previous one.
    pub fn register<F>(mut self, type_name: &str, constructor: F) -> Self
    where
        F: Fn(Arc<dyn ChannelOwner>, &str, Arc<str>, Value) -> Result<Arc<dyn ChannelOwner>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }
}

impl ObjectFactory for TypeRegistry {
    fn create_object(
        &self,
        parent: Arc<dyn ChannelOwner>,
        type_name: &str,
        guid: Arc<str>,
        initializer: Value,
    ) -> Result<Arc<dyn ChannelOwner>> {
        match self.constructors.get(type_name) {
            Some(constructor) => constructor(parent, type_name, guid, initializer),
            None if self.strict => Err(Error::UnknownObjectType(type_name.to_string())),
            None => {
                tracing::debug!(type_name, %guid, "no constructor registered, using generic proxy");
                Ok(Arc::new(RemoteObject::new(
                    parent,
                    type_name,
                    guid,
                    initializer,
                )))
            }
        }
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("TypeRegistry")
            .field("types", &types)
            .field("strict", &self.strict)
            .finish()
    }
}
