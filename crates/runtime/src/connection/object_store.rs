//! Registry of live remote objects by GUID.
//!
//! Values are cloned out; no map guard outlives a method call.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::channel_owner::ChannelOwner;
use crate::error::{Error, Result};

/// Registry of remote objects by GUID.
pub struct ObjectStore {
    objects: DashMap<Arc<str>, Arc<dyn ChannelOwner>>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Inserts an object under a GUID that must not be registered yet.
    pub fn insert_new(&self, guid: Arc<str>, obj: Arc<dyn ChannelOwner>) -> Result<()> {
        match self.objects.entry(guid) {
            Entry::Occupied(entry) => Err(Error::ProtocolError(format!(
                "Object already exists: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(obj);
                Ok(())
            }
        }
    }

    pub fn remove(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
        self.objects.remove(guid).map(|(_, obj)| obj)
    }

    /// Synchronous lookup.
    pub fn try_get(&self, guid: &str) -> Option<Arc<dyn ChannelOwner>> {
        self.objects.get(guid).map(|r| r.value().clone())
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.objects.contains_key(guid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Removes and returns every object.
    pub fn drain(&self) -> Vec<Arc<dyn ChannelOwner>> {
        let guids: Vec<Arc<str>> = self.objects.iter().map(|r| r.key().clone()).collect();
        guids
            .iter()
            .filter_map(|guid| self.remove(guid))
            .collect()
    }
}
