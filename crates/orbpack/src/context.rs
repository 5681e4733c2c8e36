//! # Object Id Space
//!
//! A `Context` gives objects peer-visible integer ids for one session.
//!
//! ## Invariants
//!
//! - The local table maps ids to objects and objects back to ids; the two
//!   directions are mutual inverses and change together under one lock.
//! - Ids come from a counter starting at 1 and are never reused.
//! - Local ids and peer ids are independent namespaces.
//! - A proxy bound to another context is registered like a local object.
//!   It is served by a forwarder that calls through the proxy's own context.
//! - `send_count` counts how often an id went on the wire; `recv_count`
//!   counts how often a peer id was decoded. Entries leave only through
//!   `release_local` / `release_remote` (dereference) or `purge`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;

use tracing::debug;
use tracing::trace;

use crate::object::Forward;
use crate::object::RemoteCaller;
use crate::strcodec::StrCodec;
use crate::types::Error;
use crate::types::Result;
use crate::value::LocalObject;
use crate::value::ObjectRef;
use crate::value::RemoteHandle;
use crate::value::RemoteRef;

/// Receives dereference events for remote proxies.
pub trait DerefHook: Send + Sync + 'static {
    /// The last local holder of `peer_id` let go; `recv_count` is how many
    /// copies had been decoded at that moment.
    fn on_remote_dropped(&self, peer_id: u64, recv_count: u64);
}

/// Result of a peer's dereference notice for one of our objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Removed,
    /// More copies are in flight than the peer has seen.
    CountMismatch { send_count: u64 },
    Unknown,
}

struct LocalEntry {
    /// What was registered: a local object or another context's proxy.
    origin: ObjectRef,
    /// What serves calls on the id.
    object: LocalObject,
    send_count: u64,
}

struct LocalTable {
    by_id: HashMap<u64, LocalEntry>,
    by_key: HashMap<usize, u64>,
    next_id: u64,
}

struct RemoteEntry {
    handle: Weak<RemoteHandle>,
    recv_count: u64,
}

pub struct Context {
    me: Weak<Context>,
    str_codec: Option<StrCodec>,
    local: Mutex<LocalTable>,
    remote: Mutex<HashMap<u64, RemoteEntry>>,
    hook: RwLock<Option<Arc<dyn DerefHook>>>,
    caller: RwLock<Option<Arc<dyn RemoteCaller>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Context {
    /// A context whose strings default to utf8.
    pub fn new() -> Arc<Self> {
        Self::with_str_codec(Some(StrCodec::Utf8))
    }

    /// With `None`, every string is sent with its codec name attached.
    pub fn with_str_codec(str_codec: Option<StrCodec>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            str_codec,
            local: Mutex::new(LocalTable {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                next_id: 1,
            }),
            remote: Mutex::new(HashMap::new()),
            hook: RwLock::new(None),
            caller: RwLock::new(None),
        })
    }

    pub fn str_codec(&self) -> Option<StrCodec> {
        self.str_codec
    }

    pub fn set_deref_hook(&self, hook: Arc<dyn DerefHook>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn clear_deref_hook(&self) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Installs what performs calls on this context's proxies when another
    /// context forwards them.
    pub fn set_remote_caller(&self, caller: Arc<dyn RemoteCaller>) {
        *self.caller.write().unwrap_or_else(PoisonError::into_inner) = Some(caller);
    }

    pub fn clear_remote_caller(&self) {
        *self.caller.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn remote_caller(&self) -> Option<Arc<dyn RemoteCaller>> {
        self.caller.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ========================================================================
    // Local objects
    // ========================================================================

    /// Id of a local object, minting one when `lazy` and the object is new.
    ///
    /// A proxy of another context counts as local here; only proxies of this
    /// context are refused.
    pub fn local_id_for(&self, obj: &ObjectRef, lazy: bool) -> Result<u64> {
        let key = self.local_key(obj)?;
        let mut table = lock(&self.local);
        match table.by_key.get(&key) {
            Some(id) => Ok(*id),
            None if lazy => Ok(Self::mint(&mut table, obj)),
            None => Err(Error::Unregistered),
        }
    }

    pub fn local_object_for(&self, id: u64) -> Result<LocalObject> {
        lock(&self.local)
            .by_id
            .get(&id)
            .map(|entry| entry.object.clone())
            .ok_or(Error::UnknownObjectId(id))
    }

    /// The object serving calls on `obj`'s id; a forwarder for a passed-on proxy.
    pub fn callable_for(&self, obj: &ObjectRef) -> Result<LocalObject> {
        if let ObjectRef::Local(local) = obj {
            return Ok(local.clone());
        }
        let key = self.local_key(obj)?;
        let table = lock(&self.local);
        table
            .by_key
            .get(&key)
            .and_then(|id| table.by_id.get(id))
            .map(|entry| entry.object.clone())
            .ok_or(Error::Unregistered)
    }

    /// What was registered under `id`, as a reference.
    pub(crate) fn local_ref_for(&self, id: u64) -> Result<ObjectRef> {
        lock(&self.local)
            .by_id
            .get(&id)
            .map(|entry| entry.origin.clone())
            .ok_or(Error::UnknownObjectId(id))
    }

    pub fn note_local_send(&self, id: u64) -> Result<()> {
        let mut table = lock(&self.local);
        let entry = table.by_id.get_mut(&id).ok_or(Error::UnknownObjectId(id))?;
        entry.send_count += 1;
        Ok(())
    }

    /// Mints if needed and counts one send, as a single step.
    pub(crate) fn send_local(&self, obj: &ObjectRef) -> Result<u64> {
        let key = self.local_key(obj)?;
        let mut table = lock(&self.local);
        let id = match table.by_key.get(&key) {
            Some(id) => *id,
            None => Self::mint(&mut table, obj),
        };
        if let Some(entry) = table.by_id.get_mut(&id) {
            entry.send_count += 1;
        }
        Ok(id)
    }

    pub fn local_send_count(&self, id: u64) -> Option<u64> {
        lock(&self.local).by_id.get(&id).map(|entry| entry.send_count)
    }

    /// Drops the registration of `id` if the peer has seen every copy sent.
    pub fn release_local(&self, id: u64, reported: u64) -> Release {
        let removed = {
            let mut table = lock(&self.local);
            let Some(entry) = table.by_id.get(&id) else {
                return Release::Unknown;
            };
            if entry.send_count != reported {
                return Release::CountMismatch { send_count: entry.send_count };
            }
            let entry = table.by_id.remove(&id);
            if let Some(entry) = &entry {
                table.by_key.remove(&key_of(&entry.origin));
            }
            entry
        };
        debug!(id, reported, "released local object");
        drop(removed);
        Release::Removed
    }

    fn local_key(&self, obj: &ObjectRef) -> Result<usize> {
        match obj {
            ObjectRef::Remote(remote) if remote.is_bound_to(self) => Err(Error::RemoteAsLocal),
            obj => Ok(key_of(obj)),
        }
    }

    fn mint(table: &mut LocalTable, origin: &ObjectRef) -> u64 {
        let id = table.next_id;
        table.next_id += 1;
        let object = match origin {
            ObjectRef::Local(local) => local.clone(),
            ObjectRef::Remote(remote) => {
                trace!(id, peer_id = remote.peer_id(), "forwarding proxy of another context");
                LocalObject::new(Forward::new(remote.clone()))
            }
        };
        table.by_key.insert(key_of(origin), id);
        table.by_id.insert(id, LocalEntry { origin: origin.clone(), object, send_count: 0 });
        trace!(id, "minted local id");
        id
    }

    // ========================================================================
    // Remote proxies
    // ========================================================================

    /// Live proxy for `peer_id`, minting one when none is alive.
    ///
    /// An entry whose proxy already died is revived with a fresh proxy and
    /// keeps its `recv_count`: the peer may still be sending copies that
    /// were in flight when the old proxy went away.
    pub fn remote_ref_for(&self, peer_id: u64, lazy: bool) -> Result<RemoteRef> {
        let mut table = lock(&self.remote);
        self.proxy_in(&mut table, peer_id, lazy)
    }

    pub fn note_remote_recv(&self, peer_id: u64) -> Result<()> {
        let mut table = lock(&self.remote);
        let entry = table.get_mut(&peer_id).ok_or(Error::UnknownObjectId(peer_id))?;
        entry.recv_count += 1;
        Ok(())
    }

    /// Resolves and counts one received copy, as a single step.
    pub(crate) fn receive_remote(&self, peer_id: u64) -> Result<RemoteRef> {
        let mut table = lock(&self.remote);
        let proxy = self.proxy_in(&mut table, peer_id, true)?;
        if let Some(entry) = table.get_mut(&peer_id) {
            entry.recv_count += 1;
        }
        Ok(proxy)
    }

    pub fn remote_recv_count(&self, peer_id: u64) -> Option<u64> {
        lock(&self.remote).get(&peer_id).map(|entry| entry.recv_count)
    }

    /// Forgets `peer_id` after the peer confirmed the dereference.
    pub fn release_remote(&self, peer_id: u64) -> bool {
        let removed = lock(&self.remote).remove(&peer_id).is_some();
        if removed {
            debug!(peer_id, "released remote proxy");
        }
        removed
    }

    /// Forwards a dereference to the installed hook, if any.
    pub fn on_remote_dropped(&self, peer_id: u64, recv_count: u64) {
        let hook = self.hook.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook.on_remote_dropped(peer_id, recv_count);
        }
    }

    pub(crate) fn remote_dropped(&self, peer_id: u64, handle: *const RemoteHandle) {
        let recv_count = {
            let table = lock(&self.remote);
            match table.get(&peer_id) {
                // a replacement proxy owns the entry now
                Some(entry) if std::ptr::eq(entry.handle.as_ptr(), handle) => entry.recv_count,
                _ => return,
            }
        };
        trace!(peer_id, recv_count, "remote proxy dropped");
        self.on_remote_dropped(peer_id, recv_count);
    }

    fn proxy_in(
        &self,
        table: &mut HashMap<u64, RemoteEntry>,
        peer_id: u64,
        lazy: bool,
    ) -> Result<RemoteRef> {
        if let Some(entry) = table.get_mut(&peer_id) {
            if let Some(handle) = entry.handle.upgrade() {
                return Ok(RemoteRef { handle });
            }
            let proxy = self.new_proxy(peer_id);
            entry.handle = Arc::downgrade(&proxy.handle);
            trace!(peer_id, "replaced collected proxy");
            return Ok(proxy);
        }
        if !lazy {
            return Err(Error::UnknownObjectId(peer_id));
        }
        let proxy = self.new_proxy(peer_id);
        table.insert(peer_id, RemoteEntry { handle: Arc::downgrade(&proxy.handle), recv_count: 0 });
        Ok(proxy)
    }

    fn new_proxy(&self, peer_id: u64) -> RemoteRef {
        RemoteRef {
            handle: Arc::new(RemoteHandle { peer_id, context: self.me.clone() }),
        }
    }

    // ========================================================================
    // Whole-table operations
    // ========================================================================

    pub fn num_local(&self) -> usize {
        lock(&self.local).by_id.len()
    }

    pub fn num_remote(&self) -> usize {
        lock(&self.remote).len()
    }

    /// True when neither side references anything through this context.
    pub fn is_empty(&self) -> bool {
        self.num_local() == 0 && self.num_remote() == 0
    }

    /// Clears both tables. Ids stay unique: the counter is not reset.
    pub fn purge(&self) {
        let local = {
            let mut table = lock(&self.local);
            table.by_key.clear();
            std::mem::take(&mut table.by_id)
        };
        let remote = std::mem::take(&mut *lock(&self.remote));
        debug!(local = local.len(), remote = remote.len(), "purged context");
    }
}

fn key_of(obj: &ObjectRef) -> usize {
    match obj {
        ObjectRef::Local(local) => local.key(),
        ObjectRef::Remote(remote) => remote.key(),
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("str_codec", &self.str_codec)
            .field("num_local", &self.num_local())
            .field("num_remote", &self.num_remote())
            .finish()
    }
}
