use crate::errors::StorageError;
use crate::storage::event::{EventSink, StorageEvent};
use crate::storage::local::database::{CloseOutcome, DurableOriginStore};
use crate::storage::map::{QuotaExceeded, StorageMap};
use crate::storage::namespace::NamespaceKey;
use crate::storage::types::{AreaId, Listener, OriginId};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

/// Coordinator-internal handle of a storage area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaHandle(u64);

impl Display for AreaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "area#{}", self.0)
    }
}

/// Who an area belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AreaOwner {
    Namespace(NamespaceKey),
    /// The owning session namespace was destroyed while clients were still bound.
    Detached,
}

/// Owns every live area. Namespaces and bindings refer to areas by handle.
#[derive(Default)]
pub struct AreaArena {
    next: u64,
    areas: HashMap<AreaHandle, StorageArea>,
}

impl AreaArena {
    pub fn insert(&mut self, area: StorageArea) -> AreaHandle {
        self.next += 1;
        let handle = AreaHandle(self.next);
        self.areas.insert(handle, area);
        handle
    }

    pub fn get(&self, handle: AreaHandle) -> Option<&StorageArea> {
        self.areas.get(&handle)
    }

    pub fn get_mut(&mut self, handle: AreaHandle) -> Option<&mut StorageArea> {
        self.areas.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: AreaHandle) -> Option<StorageArea> {
        self.areas.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AreaHandle, &StorageArea)> {
        self.areas.iter().map(|(h, a)| (*h, a))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AreaHandle, &mut StorageArea)> {
        self.areas.iter_mut().map(|(h, a)| (*h, a))
    }

    /// Handles of every area for `origin`, in any namespace.
    pub fn handles_for(&self, origin: &OriginId) -> Vec<AreaHandle> {
        self.iter()
            .filter(|(_, a)| a.origin() == origin)
            .map(|(h, _)| h)
            .collect()
    }
}

/// The storage of one origin inside one namespace.
///
/// Holds the authoritative map, the set of listeners that get told about
/// changes and, for local storage with a directory configured, the durable
/// store behind it. The durable store is imported lazily on first access.
pub struct StorageArea {
    origin: OriginId,
    owner: AreaOwner,
    map: StorageMap,
    listeners: HashSet<Listener>,
    store: Option<DurableOriginStore>,
    imported: bool,
}

impl StorageArea {
    pub fn new(
        origin: OriginId,
        owner: AreaOwner,
        quota: usize,
        store: Option<DurableOriginStore>,
    ) -> Self {
        Self {
            origin,
            owner,
            map: StorageMap::new(quota),
            listeners: HashSet::new(),
            // Nothing to import without a store.
            imported: store.is_none(),
            store,
        }
    }

    /// Area holding a copy of `map`, e.g. from a cloned session namespace.
    pub fn with_map(origin: OriginId, owner: AreaOwner, map: StorageMap) -> Self {
        Self {
            origin,
            owner,
            map,
            listeners: HashSet::new(),
            store: None,
            imported: true,
        }
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn owner(&self) -> AreaOwner {
        self.owner
    }

    pub fn detach(&mut self) {
        self.owner = AreaOwner::Detached;
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn add_listener(&mut self, listener: Listener) -> bool {
        self.listeners.insert(listener)
    }

    pub fn remove_listener(&mut self, listener: &Listener) -> bool {
        self.listeners.remove(listener)
    }

    /// The map as it stands now, without importing.
    pub fn map(&self) -> &StorageMap {
        &self.map
    }

    #[cfg(test)]
    pub fn store(&self) -> Option<&DurableOriginStore> {
        self.store.as_ref()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.store.as_ref().is_some_and(|s| s.has_pending())
    }

    /// Snapshot of every item, importing from disk first if needed.
    pub fn items(&mut self) -> std::collections::HashMap<String, String> {
        self.import_if_needed();
        self.map.items()
    }

    pub fn set_item(
        &mut self,
        sink: &dyn EventSink,
        source: Listener,
        key: &str,
        value: &str,
        url: &str,
    ) -> Result<Option<String>, StorageError> {
        self.import_if_needed();

        if self.map.get(key) == Some(value) {
            return Ok(Some(value.to_string()));
        }

        let old = self.map.set_item(key, value).map_err(|QuotaExceeded| {
            StorageError::QuotaExceeded {
                origin: self.origin.clone(),
                quota: self.map.quota(),
            }
        })?;

        if let Some(store) = &mut self.store {
            store.record_change(key, Some(value));
        }
        self.notify(sink, source, |area_id, source_area| StorageEvent::ItemChanged {
            area_id,
            source_area,
            key: key.to_string(),
            old_value: old.clone(),
            new_value: Some(value.to_string()),
            url: url.to_string(),
        });
        Ok(old)
    }

    pub fn remove_item(
        &mut self,
        sink: &dyn EventSink,
        source: Listener,
        key: &str,
        url: &str,
    ) -> Option<String> {
        self.import_if_needed();

        let old = self.map.remove_item(key)?;
        if let Some(store) = &mut self.store {
            store.record_change(key, None);
        }
        self.notify(sink, source, |area_id, source_area| StorageEvent::ItemChanged {
            area_id,
            source_area,
            key: key.to_string(),
            old_value: Some(old.clone()),
            new_value: None,
            url: url.to_string(),
        });
        Some(old)
    }

    /// Removes every item. Does nothing, not even notify, when already empty.
    pub fn clear(&mut self, sink: &dyn EventSink, source: Listener, url: &str) {
        self.import_if_needed();

        if self.map.is_empty() {
            return;
        }
        self.map.clear();
        if let Some(store) = &mut self.store {
            store.clear();
        }
        self.notify(sink, source, |area_id, source_area| StorageEvent::Cleared {
            area_id,
            source_area,
            url: url.to_string(),
        });
    }

    /// Drops all data because the backing file was deleted from outside.
    ///
    /// Buffered writes are discarded and every listener is told to invalidate
    /// its cache. The store continues under `generation`, so flushes
    /// scheduled before the purge are dropped.
    pub fn purge(&mut self, sink: &dyn EventSink, generation: u64) {
        if let Some(store) = &mut self.store {
            store.reset(generation);
        }
        self.map.clear();
        self.imported = true;
        self.invalidate(sink);
    }

    /// Drops the in-memory data and starts over from `store`, which is
    /// imported on the next access.
    pub fn reattach(&mut self, sink: &dyn EventSink, store: Option<DurableOriginStore>) {
        self.map.clear();
        self.imported = store.is_none();
        self.store = store;
        self.invalidate(sink);
    }

    /// Runs a scheduled flush if it targets the current store.
    pub fn flush_store(&mut self, generation: u64) {
        match &mut self.store {
            Some(store) if store.generation() == generation => store.flush(),
            _ => log::trace!("{}: dropping stale flush (generation {generation})", self.origin),
        }
    }

    /// Closes the durable store, writing everything still buffered.
    pub fn close_store(&mut self) -> Option<CloseOutcome> {
        self.store.as_mut().map(DurableOriginStore::close)
    }

    /// Swaps in another durable store for the same data. The map is kept as is.
    pub fn replace_store(&mut self, store: Option<DurableOriginStore>) -> Option<DurableOriginStore> {
        std::mem::replace(&mut self.store, store)
    }

    fn import_if_needed(&mut self) {
        if self.imported {
            return;
        }
        self.imported = true;
        if let Some(store) = &mut self.store {
            store.import_into(&mut self.map);
        }
    }

    fn invalidate(&self, sink: &dyn EventSink) {
        for listener in &self.listeners {
            sink.send(
                listener.connection,
                StorageEvent::CacheInvalidated {
                    area_id: listener.area_id,
                },
            );
        }
    }

    fn notify<F>(&self, sink: &dyn EventSink, source: Listener, event: F)
    where
        F: Fn(AreaId, Option<AreaId>) -> StorageEvent,
    {
        for listener in &self.listeners {
            let source_area =
                (listener.connection == source.connection).then_some(source.area_id);
            sink.send(listener.connection, event(listener.area_id, source_area));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::event::Delivery;
    use crate::storage::types::{AreaId, ConnectionId};
    use crate::config::StorageConfig;
    use crate::storage::local::database::StoreDelegate;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Flushes(Mutex<Vec<u64>>);

    impl StoreDelegate for Flushes {
        fn schedule_flush(&self, _origin: &OriginId, generation: u64, _delay: Duration) {
            self.0.lock().unwrap().push(generation);
        }

        fn database_opened(&self, _origin: &OriginId, _path: &Path) {}
    }

    fn origin() -> OriginId {
        OriginId::parse("https_example.com_443").unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    #[test]
    fn change_fan_out_sets_source_area_only_for_same_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 1024, None);
        let writer = Listener::new(a, AreaId(10));
        area.add_listener(writer);
        area.add_listener(Listener::new(b, AreaId(20)));

        assert_eq!(area.set_item(&tx, writer, "k", "v", "https://example.com/").unwrap(), None);

        let mut events = drain(&mut rx);
        events.sort_by_key(|(_, ev)| ev.area_id());
        assert_eq!(events.len(), 2);

        let (to, ev) = &events[0];
        assert_eq!(*to, a);
        assert!(matches!(
            ev,
            StorageEvent::ItemChanged { area_id: AreaId(10), source_area: Some(AreaId(10)), .. }
        ));
        let (to, ev) = &events[1];
        assert_eq!(*to, b);
        assert!(matches!(
            ev,
            StorageEvent::ItemChanged { area_id: AreaId(20), source_area: None, .. }
        ));
    }

    #[test]
    fn same_value_write_and_missing_remove_emit_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let conn = ConnectionId::new();
        let me = Listener::new(conn, AreaId(1));
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 1024, None);
        area.add_listener(me);

        area.set_item(&tx, me, "k", "v", "u").unwrap();
        drain(&mut rx);

        assert_eq!(area.set_item(&tx, me, "k", "v", "u").unwrap(), Some("v".into()));
        assert_eq!(area.remove_item(&tx, me, "missing", "u"), None);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn quota_failure_reports_origin_and_emits_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let me = Listener::new(ConnectionId::new(), AreaId(1));
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 8, None);
        area.add_listener(me);

        let err = area.set_item(&tx, me, "key", "value", "u").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 8, .. }));
        assert!(area.map().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn clear_notifies_once_and_not_when_empty() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let me = Listener::new(ConnectionId::new(), AreaId(3));
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 1024, None);
        area.add_listener(me);

        area.clear(&tx, me, "u");
        assert!(drain(&mut rx).is_empty());

        area.set_item(&tx, me, "a", "1", "u").unwrap();
        area.set_item(&tx, me, "b", "2", "u").unwrap();
        drain(&mut rx);

        area.clear(&tx, me, "u");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, StorageEvent::Cleared { area_id: AreaId(3), .. }));
        assert!(area.map().is_empty());
    }

    #[test]
    fn purge_invalidates_every_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let me = Listener::new(ConnectionId::new(), AreaId(1));
        let other = Listener::new(ConnectionId::new(), AreaId(2));
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 1024, None);
        area.add_listener(me);
        area.add_listener(other);
        area.set_item(&tx, me, "a", "1", "u").unwrap();
        drain(&mut rx);

        area.purge(&tx, 2);
        assert!(area.map().is_empty());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|(_, ev)| matches!(ev, StorageEvent::CacheInvalidated { .. })));
    }

    #[test]
    fn flush_scheduled_before_purge_is_dropped() {
        let dir = TempDir::new().unwrap();
        let flushes = Arc::new(Flushes::default());
        let store = DurableOriginStore::new(origin(), dir.path(), 1, &StorageConfig::default(), flushes.clone());
        let (tx, _rx) = mpsc::unbounded_channel::<Delivery>();
        let me = Listener::new(ConnectionId::new(), AreaId(1));
        let mut area = StorageArea::new(origin(), AreaOwner::Detached, 1024, Some(store));

        area.set_item(&tx, me, "a", "1", "u").unwrap();
        area.purge(&tx, 2);
        area.set_item(&tx, me, "b", "2", "u").unwrap();
        assert_eq!(flushes.0.lock().unwrap().as_slice(), &[1, 2]);

        area.flush_store(1);
        assert!(area.has_pending_writes());
        assert!(!area.store().unwrap().path().exists());

        area.flush_store(2);
        assert!(!area.has_pending_writes());
        assert!(area.store().unwrap().path().exists());
    }

    #[test]
    fn arena_finds_areas_by_origin() {
        let mut arena = AreaArena::default();
        let other = OriginId::parse("http_other.test_80").unwrap();
        let h1 = arena.insert(StorageArea::new(origin(), AreaOwner::Detached, 10, None));
        let h2 = arena.insert(StorageArea::new(other.clone(), AreaOwner::Detached, 10, None));
        let h3 = arena.insert(StorageArea::new(origin(), AreaOwner::Detached, 10, None));
        assert_ne!(h1, h3);

        let mut found = arena.handles_for(&origin());
        found.sort();
        assert_eq!(found, vec![h1, h3]);
        assert_eq!(arena.handles_for(&other), vec![h2]);

        arena.remove(h1);
        assert_eq!(arena.len(), 2);
        assert!(arena.get(h1).is_none());
    }
}
