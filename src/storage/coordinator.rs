use crate::config::StorageConfig;
use crate::errors::StorageError;
use crate::queue::{SerialTaskQueue, WeakTaskQueue};
use crate::storage::area::{AreaArena, AreaHandle, AreaOwner, StorageArea};
use crate::storage::event::EventSink;
use crate::storage::local::database::{CloseOutcome, DurableOriginStore, StoreDelegate};
use crate::storage::local::tracker::{OriginDetails, OriginRegistry};
use crate::storage::namespace::{NamespaceKey, StorageNamespace};
use crate::storage::types::{AreaId, ConnectionId, Listener, NamespaceId, OriginId};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

/// Front door of the storage subsystem.
///
/// Every method enqueues a task on the storage worker and returns right away.
/// Methods with a result hand back a [`oneshot::Receiver`]; it resolves with
/// an error when the request named an unknown connection, area or namespace,
/// since such requests are dropped.
///
/// Cloning is cheap. The worker shuts down, closing every durable store, once
/// the last clone is dropped and outstanding flushes have run.
#[derive(Clone)]
pub struct StorageCoordinator {
    queue: SerialTaskQueue<StorageState>,
}

impl Debug for StorageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCoordinator")
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl StorageCoordinator {
    pub fn new(config: StorageConfig, sink: Arc<dyn EventSink>) -> Result<Self, StorageError> {
        let name = config.queue_name.clone();
        let reconcile = config.local_storage_directory.is_some();

        let queue = SerialTaskQueue::new_cyclic(&name, |weak| StorageState::new(config, sink, weak))
            .map_err(StorageError::QueueSpawn)?;

        if reconcile {
            queue.dispatch(StorageState::reconcile_registry);
        }
        Ok(Self { queue })
    }

    /// Moves the local storage root. `None` keeps local storage in memory.
    pub fn set_persistent_directory(&self, directory: Option<PathBuf>) {
        self.queue
            .dispatch(move |state| state.set_persistent_directory(directory));
    }

    pub fn create_session_namespace(
        &self,
        id: NamespaceId,
        owner: Option<ConnectionId>,
        quota: Option<usize>,
    ) {
        self.queue
            .dispatch(move |state| state.create_session_namespace(id, owner, quota));
    }

    pub fn destroy_session_namespace(&self, id: NamespaceId) {
        self.queue
            .dispatch(move |state| state.destroy_session_namespace(id));
    }

    pub fn set_allowed_connection(&self, id: NamespaceId, connection: Option<ConnectionId>) {
        self.queue.dispatch(move |state| {
            match state.sessions.get_mut(&id) {
                Some(ns) => ns.set_allowed_connection(connection),
                None => log::debug!("set_allowed_connection: unknown namespace {id}"),
            }
        });
    }

    pub fn clone_session_namespace(&self, source: NamespaceId, target: NamespaceId) {
        self.queue
            .dispatch(move |state| state.clone_session_namespace(source, target));
    }

    /// Registers `(connection, area_id)` as a listener of `origin`'s area in
    /// `namespace`, creating the area on first use.
    pub fn bind_area(
        &self,
        connection: ConnectionId,
        area_id: AreaId,
        namespace: NamespaceKey,
        origin: OriginId,
    ) {
        self.queue.dispatch(move |state| {
            state.bind_area(Listener::new(connection, area_id), namespace, origin)
        });
    }

    pub fn unbind_area(&self, connection: ConnectionId, area_id: AreaId) {
        self.queue
            .dispatch(move |state| state.unbind_area(Listener::new(connection, area_id)));
    }

    pub fn connection_closed(&self, connection: ConnectionId) {
        self.queue
            .dispatch(move |state| state.connection_closed(connection));
    }

    pub fn get_values(
        &self,
        connection: ConnectionId,
        area_id: AreaId,
    ) -> oneshot::Receiver<HashMap<String, String>> {
        let (tx, rx) = oneshot::channel();
        self.queue.dispatch(move |state| {
            if let Some(area) = state.bound_area(Listener::new(connection, area_id)) {
                let _ = tx.send(area.items());
            }
        });
        rx
    }

    /// Resolves to the previous value, or [`StorageError::QuotaExceeded`].
    pub fn set_item(
        &self,
        connection: ConnectionId,
        area_id: AreaId,
        key: String,
        value: String,
        url: String,
    ) -> oneshot::Receiver<Result<Option<String>, StorageError>> {
        let (tx, rx) = oneshot::channel();
        self.queue.dispatch(move |state| {
            let source = Listener::new(connection, area_id);
            let Some(handle) = state.binding(source) else {
                return;
            };
            if let Some(area) = state.areas.get_mut(handle) {
                let _ = tx.send(area.set_item(&*state.sink, source, &key, &value, &url));
            }
        });
        rx
    }

    /// Resolves to the removed value, if the key was present.
    pub fn remove_item(
        &self,
        connection: ConnectionId,
        area_id: AreaId,
        key: String,
        url: String,
    ) -> oneshot::Receiver<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.queue.dispatch(move |state| {
            let source = Listener::new(connection, area_id);
            let Some(handle) = state.binding(source) else {
                return;
            };
            if let Some(area) = state.areas.get_mut(handle) {
                let _ = tx.send(area.remove_item(&*state.sink, source, &key, &url));
            }
        });
        rx
    }

    pub fn clear(&self, connection: ConnectionId, area_id: AreaId, url: String) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.dispatch(move |state| {
            let source = Listener::new(connection, area_id);
            let Some(handle) = state.binding(source) else {
                return;
            };
            if let Some(area) = state.areas.get_mut(handle) {
                area.clear(&*state.sink, source, &url);
                let _ = tx.send(());
            }
        });
        rx
    }

    /// Origins with durable local storage, plus in-memory local areas holding data.
    pub fn origins_with_storage(&self) -> oneshot::Receiver<Vec<OriginId>> {
        self.request(StorageState::origins_with_storage)
    }

    pub fn origin_details(&self) -> oneshot::Receiver<Vec<OriginDetails>> {
        self.request(|state| state.registry.origin_details())
    }

    pub fn delete_origin_storage(&self, origin: OriginId) -> oneshot::Receiver<()> {
        self.request(move |state| state.delete_origin_storage(&origin))
    }

    pub fn delete_origins_storage(&self, origins: Vec<OriginId>) -> oneshot::Receiver<()> {
        self.request(move |state| {
            for origin in &origins {
                state.delete_origin_storage(origin);
            }
        })
    }

    /// Deletes local storage of every origin written at or after `since`.
    pub fn delete_storage_modified_since(&self, since: SystemTime) -> oneshot::Receiver<()> {
        self.request(move |state| state.delete_storage_modified_since(since))
    }

    pub fn delete_all_storage(&self) -> oneshot::Receiver<()> {
        self.request(StorageState::delete_all_storage)
    }

    /// Writes and closes every durable store. Resolves once all data is on disk.
    pub fn close_all_stores(&self) -> oneshot::Receiver<()> {
        self.request(StorageState::close_all_stores)
    }

    fn request<T, F>(&self, f: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StorageState) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.dispatch(move |state| {
            let _ = tx.send(f(state));
        });
        rx
    }

    #[cfg(test)]
    fn inspect<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut StorageState) -> T + Send + 'static,
    {
        self.request(f)
            .blocking_recv()
            .expect("storage worker is gone")
    }
}

/// Lets durable stores post follow-up tasks onto the storage worker.
struct QueueDelegate {
    queue: WeakTaskQueue<StorageState>,
}

impl StoreDelegate for QueueDelegate {
    fn schedule_flush(&self, origin: &OriginId, generation: u64, delay: Duration) {
        let Some(queue) = self.queue.upgrade() else {
            log::debug!("{origin}: worker shutting down, flush left to close");
            return;
        };
        let origin = origin.clone();
        queue.dispatch_after(delay, move |state| state.flush_local(&origin, generation));
    }

    fn database_opened(&self, origin: &OriginId, path: &Path) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let origin = origin.clone();
        let path = path.to_path_buf();
        queue.dispatch(move |state| {
            // The directory may have moved since the store was opened.
            if state.registry.database_path(&origin).as_deref() != Some(path.as_path()) {
                return;
            }
            if let Err(e) = state.registry.record_origin_opened(&origin, &path) {
                log::error!("{origin}: cannot record database in tracker: {e:#}");
            }
        });
    }
}

/// Everything the storage worker owns.
pub(crate) struct StorageState {
    config: StorageConfig,
    sink: Arc<dyn EventSink>,
    delegate: Arc<dyn StoreDelegate>,
    registry: OriginRegistry,
    local: StorageNamespace,
    sessions: HashMap<NamespaceId, StorageNamespace>,
    areas: AreaArena,
    bindings: HashMap<Listener, AreaHandle>,
    next_generation: u64,
}

impl StorageState {
    fn new(config: StorageConfig, sink: Arc<dyn EventSink>, queue: WeakTaskQueue<StorageState>) -> Self {
        Self {
            registry: OriginRegistry::new(config.local_storage_directory.clone()),
            local: StorageNamespace::local(config.local_storage_quota),
            config,
            sink,
            delegate: Arc::new(QueueDelegate { queue }),
            sessions: HashMap::new(),
            areas: AreaArena::default(),
            bindings: HashMap::new(),
            next_generation: 0,
        }
    }

    fn reconcile_registry(&mut self) {
        if let Err(e) = self.registry.reconcile_with_disk() {
            log::error!("cannot reconcile storage tracker: {e:#}");
        }
    }

    fn new_local_store(&mut self, origin: &OriginId) -> Option<DurableOriginStore> {
        let directory = self.config.local_storage_directory.as_deref()?;
        self.next_generation += 1;
        Some(DurableOriginStore::new(
            origin.clone(),
            directory,
            self.next_generation,
            &self.config,
            self.delegate.clone(),
        ))
    }

    fn local_handles(&self) -> Vec<AreaHandle> {
        self.local.handles().collect()
    }

    fn binding(&self, listener: Listener) -> Option<AreaHandle> {
        let handle = self.bindings.get(&listener).copied();
        if handle.is_none() {
            log::debug!(
                "dropping request for unbound area {} on connection {}",
                listener.area_id,
                listener.connection
            );
        }
        handle
    }

    fn bound_area(&mut self, listener: Listener) -> Option<&mut StorageArea> {
        let handle = self.binding(listener)?;
        self.areas.get_mut(handle)
    }

    fn set_persistent_directory(&mut self, directory: Option<PathBuf>) {
        if self.config.local_storage_directory == directory {
            return;
        }
        log::debug!("local storage directory now {:?}", directory);

        self.close_local_stores();
        self.config.local_storage_directory = directory.clone();
        self.registry.set_directory(directory);

        for handle in self.local_handles() {
            let origin = match self.areas.get(handle) {
                Some(area) => area.origin().clone(),
                None => continue,
            };
            let store = self.new_local_store(&origin);
            if let Some(area) = self.areas.get_mut(handle) {
                area.reattach(&*self.sink, store);
            }
        }

        self.reconcile_registry();
    }

    fn create_session_namespace(&mut self, id: NamespaceId, owner: Option<ConnectionId>, quota: Option<usize>) {
        if self.sessions.contains_key(&id) {
            log::warn!("session namespace {id} already exists");
            return;
        }
        let quota = quota.unwrap_or(self.config.session_storage_quota);
        self.sessions
            .insert(id, StorageNamespace::session(id, owner, quota));
    }

    fn destroy_session_namespace(&mut self, id: NamespaceId) {
        let Some(mut namespace) = self.sessions.remove(&id) else {
            log::debug!("destroy: unknown session namespace {id}");
            return;
        };
        for (_, handle) in namespace.drain() {
            let bound = self.areas.get(handle).is_some_and(StorageArea::has_listeners);
            if !bound {
                self.areas.remove(handle);
            } else if let Some(area) = self.areas.get_mut(handle) {
                area.detach();
            }
        }
    }

    fn clone_session_namespace(&mut self, source: NamespaceId, target: NamespaceId) {
        if source == target {
            return;
        }
        let (owner, quota) = match self.sessions.get(&source) {
            Some(src) => (src.allowed_connection(), src.quota()),
            None => {
                log::debug!("clone: unknown session namespace {source}");
                return;
            }
        };
        let mut dst = self
            .sessions
            .remove(&target)
            .unwrap_or_else(|| StorageNamespace::session(target, owner, quota));

        if let Some(src) = self.sessions.get(&source) {
            if !src.clone_into(&mut dst, &mut self.areas) {
                log::warn!("clone: session namespace {target} is not empty, ignoring");
            }
        }
        self.sessions.insert(target, dst);
    }

    fn bind_area(&mut self, listener: Listener, key: NamespaceKey, origin: OriginId) {
        if self.bindings.contains_key(&listener) {
            log::warn!(
                "area {} already bound on connection {}",
                listener.area_id,
                listener.connection
            );
            return;
        }

        let existing = match key {
            NamespaceKey::Local => self.local.area(&origin),
            NamespaceKey::Session(id) => match self.sessions.get(&id) {
                Some(ns) if ns.allows(listener.connection) => ns.area(&origin),
                Some(_) => {
                    log::warn!("connection {} may not use session namespace {id}", listener.connection);
                    return;
                }
                None => {
                    log::debug!("bind: unknown session namespace {id}");
                    return;
                }
            },
        };

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let area = match key {
                    NamespaceKey::Local => {
                        let store = self.new_local_store(&origin);
                        StorageArea::new(origin.clone(), AreaOwner::Namespace(key), self.local.quota(), store)
                    }
                    NamespaceKey::Session(id) => {
                        let quota = self
                            .sessions
                            .get(&id)
                            .map_or(self.config.session_storage_quota, StorageNamespace::quota);
                        StorageArea::new(origin.clone(), AreaOwner::Namespace(key), quota, None)
                    }
                };
                let handle = self.areas.insert(area);
                match key {
                    NamespaceKey::Local => self.local.insert_area(origin, handle),
                    NamespaceKey::Session(id) => {
                        if let Some(ns) = self.sessions.get_mut(&id) {
                            ns.insert_area(origin, handle);
                        }
                    }
                }
                handle
            }
        };

        if let Some(area) = self.areas.get_mut(handle) {
            area.add_listener(listener);
            self.bindings.insert(listener, handle);
        }
    }

    fn unbind_area(&mut self, listener: Listener) {
        let Some(handle) = self.bindings.remove(&listener) else {
            log::debug!("unbind: area {} not bound on {}", listener.area_id, listener.connection);
            return;
        };
        if let Some(area) = self.areas.get_mut(handle) {
            area.remove_listener(&listener);
        }
        self.release_if_unused(handle);
    }

    fn connection_closed(&mut self, connection: ConnectionId) {
        let bound: Vec<Listener> = self
            .bindings
            .keys()
            .filter(|l| l.connection == connection)
            .copied()
            .collect();
        for listener in bound {
            self.unbind_area(listener);
        }

        for ns in self.sessions.values_mut() {
            if ns.allowed_connection() == Some(connection) {
                ns.set_allowed_connection(None);
            }
        }
    }

    /// Drops an area nobody listens to any more, unless a session namespace keeps it.
    fn release_if_unused(&mut self, handle: AreaHandle) {
        let Some(area) = self.areas.get(handle) else {
            return;
        };
        if area.has_listeners() {
            return;
        }

        match area.owner() {
            AreaOwner::Namespace(NamespaceKey::Session(_)) => {}
            AreaOwner::Detached => {
                self.areas.remove(handle);
            }
            AreaOwner::Namespace(NamespaceKey::Local) => {
                let Some(mut area) = self.areas.remove(handle) else {
                    return;
                };
                self.local.remove_area(area.origin());
                if area.close_store() == Some(CloseOutcome::Deleted) {
                    self.record_deleted(area.origin());
                }
            }
        }
    }

    fn record_deleted(&mut self, origin: &OriginId) {
        if let Err(e) = self.registry.record_origin_deleted(origin) {
            log::error!("{origin}: cannot remove database from tracker: {e:#}");
        }
    }

    fn flush_local(&mut self, origin: &OriginId, generation: u64) {
        let Some(handle) = self.local.area(origin) else {
            log::trace!("{origin}: flush for released area");
            return;
        };
        if let Some(area) = self.areas.get_mut(handle) {
            area.flush_store(generation);
        }
    }

    fn origins_with_storage(&mut self) -> Vec<OriginId> {
        let mut origins: BTreeSet<OriginId> = self.registry.all_origins().into_iter().collect();
        for handle in self.local_handles() {
            if let Some(area) = self.areas.get(handle) {
                if !area.map().is_empty() {
                    origins.insert(area.origin().clone());
                }
            }
        }
        origins.into_iter().collect()
    }

    fn delete_origin_storage(&mut self, origin: &OriginId) {
        for handle in self.areas.handles_for(origin) {
            if let Some(area) = self.areas.get_mut(handle) {
                self.next_generation += 1;
                area.purge(&*self.sink, self.next_generation);
            }
        }
        if let Err(e) = self.registry.delete_origin(origin) {
            log::error!("{origin}: cannot delete local storage: {e:#}");
        }
    }

    fn delete_storage_modified_since(&mut self, since: SystemTime) {
        let mut doomed: BTreeSet<OriginId> = self
            .registry
            .origin_details()
            .into_iter()
            .filter(|d| d.modified.is_some_and(|m| m >= since))
            .map(|d| d.origin)
            .collect();

        // Changes still buffered are newer than anything on disk.
        for handle in self.local_handles() {
            if let Some(area) = self.areas.get(handle) {
                if area.has_pending_writes() {
                    doomed.insert(area.origin().clone());
                }
            }
        }

        for origin in &doomed {
            self.delete_origin_storage(origin);
        }
    }

    fn delete_all_storage(&mut self) {
        for (_, area) in self.areas.iter_mut() {
            self.next_generation += 1;
            area.purge(&*self.sink, self.next_generation);
        }
        if let Err(e) = self.registry.delete_everything() {
            log::error!("cannot delete all local storage: {e:#}");
        }
    }

    /// Closes every durable store and gives each area a fresh, unopened one.
    fn close_all_stores(&mut self) {
        self.close_local_stores();
        for handle in self.local_handles() {
            let origin = match self.areas.get(handle) {
                Some(area) => area.origin().clone(),
                None => continue,
            };
            let store = self.new_local_store(&origin);
            if let Some(area) = self.areas.get_mut(handle) {
                area.replace_store(store);
            }
        }
    }

    fn close_local_stores(&mut self) {
        let mut deleted = Vec::new();
        for handle in self.local_handles() {
            if let Some(area) = self.areas.get_mut(handle) {
                if area.close_store() == Some(CloseOutcome::Deleted) {
                    deleted.push(area.origin().clone());
                }
            }
        }
        for origin in &deleted {
            self.record_deleted(origin);
        }
    }
}

impl Drop for StorageState {
    fn drop(&mut self) {
        log::debug!("closing {} local storage areas", self.local_handles().len());
        self.close_local_stores();
    }
}
