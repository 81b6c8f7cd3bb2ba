//! Networked object directories
//!
//! The server keeps the authoritative [`ServerDirectory`]: it assigns object
//! ids, tracks ownership and decides what each client still needs to see.
//! Every client mirrors it in a [`ClientDirectory`] of read-only replicas built
//! from the shared [`Templates`] table.
//!
//! Replication order per object is always spawn first, then a full update,
//! then incremental updates whenever the object reports itself dirty.

use crate::error::DirectoryError;
use crate::ids::{ClientId, ObjectId, Owner, TemplateId};
use crate::message::Message;
use log::debug;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};

/// Error type replicas use to reject an update body
pub type ApplyError = Box<dyn std::error::Error + Send + Sync>;

/// Downcasting support for trait objects
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// State of a networked object that can be serialized into update messages
pub trait Replica: AsAny + Send {
    /// Appends the full state of the object
    fn write_update(&self, out: &mut Vec<u8>);

    /// Replaces local state with an update produced by `write_update`
    fn apply_update(&mut self, body: &[u8]) -> Result<(), ApplyError>;

    /// Whether the object changed since the last [`Replica::clear_dirty`]
    fn is_dirty(&self) -> bool {
        false
    }

    fn clear_dirty(&mut self) {}
}

type ReplicaFactory = Box<dyn Fn() -> Box<dyn Replica> + Send + Sync>;

/// Name-indexed table of replica factories.
///
/// Both ends must register the same templates in the same order so that
/// template ids agree on the wire.
#[derive(Default)]
pub struct Templates {
    names: Vec<String>,
    factories: Vec<ReplicaFactory>,
}

impl Templates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> TemplateId
    where
        F: Fn() -> Box<dyn Replica> + Send + Sync + 'static,
    {
        let id = TemplateId(self.factories.len() as i32);
        self.names.push(name.into());
        self.factories.push(Box::new(factory));
        id
    }

    pub fn find(&self, name: &str) -> Option<TemplateId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|index| TemplateId(index as i32))
    }

    pub fn name(&self, template: TemplateId) -> Option<&str> {
        usize::try_from(template.0)
            .ok()
            .and_then(|index| self.names.get(index))
            .map(String::as_str)
    }

    pub fn instantiate(&self, template: TemplateId) -> Option<Box<dyn Replica>> {
        usize::try_from(template.0)
            .ok()
            .and_then(|index| self.factories.get(index))
            .map(|factory| factory())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

struct ServerEntry {
    template: TemplateId,
    owner: Owner,
    owner_changed: bool,
    replica: Box<dyn Replica>,
    spawned_for: HashSet<ClientId>,
}

/// Authoritative object table
pub struct ServerDirectory {
    templates: Templates,
    objects: BTreeMap<ObjectId, ServerEntry>,
    next_object_id: i32,
}

impl ServerDirectory {
    pub fn new(templates: Templates) -> Self {
        Self {
            templates,
            objects: BTreeMap::new(),
            next_object_id: 0,
        }
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Instantiates `template` under the next free object id
    pub fn spawn(&mut self, owner: Owner, template: TemplateId) -> Result<ObjectId, DirectoryError> {
        let replica = self
            .templates
            .instantiate(template)
            .ok_or(DirectoryError::UnknownTemplate(template))?;

        let object = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        self.objects.insert(
            object,
            ServerEntry {
                template,
                owner,
                owner_changed: false,
                replica,
                spawned_for: HashSet::new(),
            },
        );
        debug!("Spawned object {} from template {} for {}", object, template, owner);
        Ok(object)
    }

    /// Applies an update body to the authoritative copy
    pub fn update(&mut self, object: ObjectId, body: &[u8]) -> Result<(), DirectoryError> {
        let entry = self
            .objects
            .get_mut(&object)
            .ok_or(DirectoryError::UnknownObjectId(object))?;
        entry
            .replica
            .apply_update(body)
            .map_err(|source| DirectoryError::Apply { object, source })
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn owner(&self, object: ObjectId) -> Option<Owner> {
        self.objects.get(&object).map(|entry| entry.owner)
    }

    /// Changes ownership; the new owner is replicated with the next update
    pub fn set_owner(&mut self, object: ObjectId, owner: Owner) -> Result<(), DirectoryError> {
        let entry = self
            .objects
            .get_mut(&object)
            .ok_or(DirectoryError::UnknownObjectId(object))?;
        if entry.owner != owner {
            entry.owner = owner;
            entry.owner_changed = true;
        }
        Ok(())
    }

    pub fn get(&self, object: ObjectId) -> Option<&dyn Replica> {
        let entry = self.objects.get(&object)?;
        Some(entry.replica.as_ref())
    }

    pub fn get_mut(&mut self, object: ObjectId) -> Option<&mut dyn Replica> {
        let entry = self.objects.get_mut(&object)?;
        Some(entry.replica.as_mut())
    }

    pub fn get_as<T: Replica>(&self, object: ObjectId) -> Option<&T> {
        let entry = self.objects.get(&object)?;
        (*entry.replica).as_any().downcast_ref::<T>()
    }

    pub fn get_as_mut<T: Replica>(&mut self, object: ObjectId) -> Option<&mut T> {
        let entry = self.objects.get_mut(&object)?;
        (*entry.replica).as_any_mut().downcast_mut::<T>()
    }

    /// Iterates objects of one concrete type in id order
    pub fn iter_as_mut<T: Replica>(&mut self) -> impl Iterator<Item = (ObjectId, &mut T)> + '_ {
        self.objects.iter_mut().filter_map(|(id, entry)| {
            (*entry.replica)
                .as_any_mut()
                .downcast_mut::<T>()
                .map(|replica| (*id, replica))
        })
    }

    /// Drops an object from the authoritative table.
    ///
    /// Clients that already received it keep their replica: the protocol has
    /// no destroy message.
    pub fn remove(&mut self, object: ObjectId) -> Option<Box<dyn Replica>> {
        self.objects.remove(&object).map(|entry| entry.replica)
    }

    /// Emits what `client` is missing: spawns plus a full update for objects
    /// it has never seen, then updates for dirty or re-owned objects.
    /// Returns the number of messages produced.
    pub fn replicate<F>(&mut self, client: ClientId, mut send: F) -> usize
    where
        F: FnMut(Message),
    {
        let mut sent = 0;
        for (&object, entry) in self.objects.iter_mut() {
            let fresh = entry.spawned_for.insert(client);
            if fresh {
                send(Message::SpawnObject {
                    object,
                    template: entry.template,
                });
                sent += 1;
            }

            if fresh || entry.owner_changed || entry.replica.is_dirty() {
                let mut body = Vec::new();
                entry.replica.write_update(&mut body);
                send(Message::UpdateObject {
                    object,
                    owner: entry.owner,
                    body,
                });
                sent += 1;
            }
        }
        sent
    }

    /// Marks every object as replicated; call once all clients got their updates
    pub fn clear_dirty(&mut self) {
        for entry in self.objects.values_mut() {
            entry.replica.clear_dirty();
            entry.owner_changed = false;
        }
    }

    /// Forgets what was sent to a departed client
    pub fn forget_client(&mut self, client: ClientId) {
        for entry in self.objects.values_mut() {
            entry.spawned_for.remove(&client);
        }
    }
}

struct ClientEntry {
    owner: Owner,
    synchronized: bool,
    replica: Box<dyn Replica>,
}

/// Client-side mirror of the server directory
pub struct ClientDirectory {
    templates: Templates,
    objects: BTreeMap<ObjectId, ClientEntry>,
}

impl ClientDirectory {
    pub fn new(templates: Templates) -> Self {
        Self {
            templates,
            objects: BTreeMap::new(),
        }
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Creates the replica for a spawn message; it stays unsynchronized
    /// until its first update arrives.
    pub fn spawn(&mut self, object: ObjectId, template: TemplateId) -> Result<(), DirectoryError> {
        if self.objects.contains_key(&object) {
            return Err(DirectoryError::DuplicateObjectId(object));
        }
        let replica = self
            .templates
            .instantiate(template)
            .ok_or(DirectoryError::UnknownTemplate(template))?;

        self.objects.insert(
            object,
            ClientEntry {
                owner: Owner::Server,
                synchronized: false,
                replica,
            },
        );
        Ok(())
    }

    pub fn update(&mut self, object: ObjectId, owner: Owner, body: &[u8]) -> Result<(), DirectoryError> {
        let entry = self
            .objects
            .get_mut(&object)
            .ok_or(DirectoryError::UnknownObjectId(object))?;
        entry
            .replica
            .apply_update(body)
            .map_err(|source| DirectoryError::Apply { object, source })?;
        entry.owner = owner;
        entry.synchronized = true;
        Ok(())
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn owner(&self, object: ObjectId) -> Option<Owner> {
        self.objects.get(&object).map(|entry| entry.owner)
    }

    /// True once the replica has received at least one update
    pub fn is_synchronized(&self, object: ObjectId) -> bool {
        self.objects
            .get(&object)
            .map_or(false, |entry| entry.synchronized)
    }

    pub fn get(&self, object: ObjectId) -> Option<&dyn Replica> {
        let entry = self.objects.get(&object)?;
        Some(entry.replica.as_ref())
    }

    pub fn get_as<T: Replica>(&self, object: ObjectId) -> Option<&T> {
        let entry = self.objects.get(&object)?;
        (*entry.replica).as_any().downcast_ref::<T>()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}
