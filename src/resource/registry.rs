use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ResourceError;
use crate::resource::{Resource, ResourceId, Resources};

enum Slot {
    /// Id known ahead of its producer.
    Reserved(Resource),
    Registered(Resource),
}

impl Slot {
    fn resource(&self) -> &Resource {
        match self {
            Slot::Reserved(res) | Slot::Registered(res) => res,
        }
    }
}

/// Identity and dirty state of every resource known to a context.
///
/// Each id has at most one producer. Once closed, nothing new may be
/// registered.
#[derive(Default)]
pub struct ResourceRegistry {
    slots: RwLock<BTreeMap<ResourceId, Slot>>,
    closed: AtomicBool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an offered resource and return the canonical handle.
    ///
    /// Fails with [`ResourceError::Duplicate`] when another producer already
    /// registered the id. A reserved placeholder is upgraded in place, and the
    /// returned handle shares its dirty flag.
    pub fn register(&self, resource: Resource) -> Result<Resource, ResourceError> {
        if self.is_closed() {
            return Err(ResourceError::Closed(resource.id().clone()));
        }

        let mut slots = self.slots.write().unwrap();
        let id = resource.id().clone();

        match slots.remove(&id) {
            Some(Slot::Registered(existing)) => {
                slots.insert(id.clone(), Slot::Registered(existing));
                Err(ResourceError::Duplicate(id))
            }
            Some(Slot::Reserved(placeholder)) => {
                slots.insert(id, Slot::Registered(placeholder.clone()));
                Ok(placeholder)
            }
            None => {
                slots.insert(id, Slot::Registered(resource.clone()));
                Ok(resource)
            }
        }
    }

    /// Hand out a handle for an id whose producer registers later.
    pub fn reserve(&self, id: ResourceId) -> Result<Resource, ResourceError> {
        if self.is_closed() {
            return Err(ResourceError::Closed(id));
        }

        let mut slots = self.slots.write().unwrap();
        let slot = slots
            .entry(id.clone())
            .or_insert_with(|| Slot::Reserved(Resource::new(id)));

        Ok(slot.resource().clone())
    }

    /// Undo a registration of a producer that failed to build.
    ///
    /// With `reserved` the id goes back to being a placeholder, keeping the
    /// handle others already hold.
    pub(crate) fn unregister(&self, id: &ResourceId, reserved: bool) {
        let mut slots = self.slots.write().unwrap();

        match slots.remove(id) {
            Some(Slot::Registered(res)) if reserved => {
                slots.insert(id.clone(), Slot::Reserved(res));
            }
            Some(Slot::Registered(_)) | None => {}
            Some(slot) => {
                slots.insert(id.clone(), slot);
            }
        }
    }

    pub fn lookup(&self, id: &ResourceId) -> Result<Resource, ResourceError> {
        self.slots
            .read()
            .unwrap()
            .get(id)
            .map(|slot| slot.resource().clone())
            .ok_or_else(|| ResourceError::Missing(id.clone()))
    }

    /// Registered by a producer, as opposed to only reserved.
    pub fn is_offered(&self, id: &ResourceId) -> bool {
        matches!(self.slots.read().unwrap().get(id), Some(Slot::Registered(_)))
    }

    /// Ids of every registered resource carrying `tag`.
    pub fn tagged(&self, tag: &str) -> Vec<ResourceId> {
        self.slots
            .read()
            .unwrap()
            .values()
            .filter_map(|slot| match slot {
                Slot::Registered(res) if res.has_tag(tag) => Some(res.id().clone()),
                _ => None,
            })
            .collect()
    }

    /// Forbid any further registration.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reset every dirty flag, done at the start of each run.
    pub fn clear(&self) {
        for slot in self.slots.read().unwrap().values() {
            slot.resource().clear_dirty();
        }
    }

    pub fn resources(&self) -> Resources {
        self.slots
            .read()
            .unwrap()
            .values()
            .map(|slot| slot.resource().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The set of ids a task requires.
///
/// It may grow until the task's inputs are final, then it is closed and any
/// late addition is an error.
#[derive(Debug, Default)]
pub struct ResourceIds {
    ids: RwLock<BTreeSet<ResourceId>>,
    closed: AtomicBool,
}

impl ResourceIds {
    pub fn new(ids: impl IntoIterator<Item = ResourceId>) -> Self {
        Self {
            ids: RwLock::new(ids.into_iter().collect()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add(&self, id: ResourceId) -> Result<(), ResourceError> {
        if self.is_closed() {
            return Err(ResourceError::Closed(id));
        }
        self.ids.write().unwrap().insert(id);
        Ok(())
    }

    pub fn extend(&self, ids: impl IntoIterator<Item = ResourceId>) -> Result<(), ResourceError> {
        ids.into_iter().try_for_each(|id| self.add(id))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.ids.read().unwrap().contains(id)
    }

    /// Sorted copy of the ids.
    pub fn to_vec(&self) -> Vec<ResourceId> {
        self.ids.read().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
