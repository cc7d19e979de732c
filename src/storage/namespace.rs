use crate::storage::area::{AreaArena, AreaHandle, AreaOwner, StorageArea};
use crate::storage::types::{ConnectionId, NamespaceId, OriginId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which namespace an area is requested from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceKey {
    /// The single, persistent local storage namespace
    Local,
    Session(NamespaceId),
}

/// Groups the areas of one namespace by origin.
pub struct StorageNamespace {
    key: NamespaceKey,
    /// Only this connection may bind areas of a session namespace.
    allowed_connection: Option<ConnectionId>,
    quota: usize,
    areas: HashMap<OriginId, AreaHandle>,
}

impl StorageNamespace {
    pub fn local(quota: usize) -> Self {
        Self {
            key: NamespaceKey::Local,
            allowed_connection: None,
            quota,
            areas: HashMap::new(),
        }
    }

    pub fn session(id: NamespaceId, owner: Option<ConnectionId>, quota: usize) -> Self {
        Self {
            key: NamespaceKey::Session(id),
            allowed_connection: owner,
            quota,
            areas: HashMap::new(),
        }
    }

    pub fn key(&self) -> NamespaceKey {
        self.key
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn allowed_connection(&self) -> Option<ConnectionId> {
        self.allowed_connection
    }

    pub fn set_allowed_connection(&mut self, connection: Option<ConnectionId>) {
        self.allowed_connection = connection;
    }

    /// Whether `connection` may bind areas here. Local storage is open to all.
    pub fn allows(&self, connection: ConnectionId) -> bool {
        match self.key {
            NamespaceKey::Local => true,
            NamespaceKey::Session(_) => self.allowed_connection == Some(connection),
        }
    }

    pub fn area(&self, origin: &OriginId) -> Option<AreaHandle> {
        self.areas.get(origin).copied()
    }

    pub fn insert_area(&mut self, origin: OriginId, handle: AreaHandle) {
        self.areas.insert(origin, handle);
    }

    pub fn remove_area(&mut self, origin: &OriginId) -> Option<AreaHandle> {
        self.areas.remove(origin)
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = AreaHandle> + '_ {
        self.areas.values().copied()
    }

    /// Takes every area out of the namespace.
    pub fn drain(&mut self) -> Vec<(OriginId, AreaHandle)> {
        self.areas.drain().collect()
    }

    /// Copies every area of this namespace into `target`.
    ///
    /// The copies share nothing observable with the originals and have no
    /// listeners. `target` must not hold areas yet; if it does nothing is
    /// copied and `false` is returned.
    pub fn clone_into(&self, target: &mut StorageNamespace, arena: &mut AreaArena) -> bool {
        if !target.is_empty() {
            return false;
        }
        for (origin, handle) in &self.areas {
            let Some(area) = arena.get(*handle) else {
                continue;
            };
            let copy = StorageArea::with_map(
                origin.clone(),
                AreaOwner::Namespace(target.key),
                area.map().clone(),
            );
            let copied = arena.insert(copy);
            target.insert_area(origin.clone(), copied);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::event::NullSink;
    use crate::storage::types::{AreaId, Listener};

    fn origin() -> OriginId {
        OriginId::parse("https_example.com_443").unwrap()
    }

    #[test]
    fn only_the_allowed_connection_may_bind_session_areas() {
        let owner = ConnectionId::new();
        let stranger = ConnectionId::new();

        let mut session = StorageNamespace::session(NamespaceId(1), Some(owner), 100);
        assert!(session.allows(owner));
        assert!(!session.allows(stranger));

        session.set_allowed_connection(None);
        assert!(!session.allows(owner));

        let local = StorageNamespace::local(100);
        assert!(local.allows(stranger));
    }

    #[test]
    fn clone_copies_data_and_stays_independent() {
        let mut arena = AreaArena::default();
        let mut src = StorageNamespace::session(NamespaceId(1), None, 1024);
        let mut dst = StorageNamespace::session(NamespaceId(2), None, 1024);

        let me = Listener::new(ConnectionId::new(), AreaId(1));
        let mut area = StorageArea::new(origin(), AreaOwner::Namespace(src.key()), 1024, None);
        area.add_listener(me);
        area.set_item(&NullSink, me, "k", "v", "u").unwrap();
        let src_handle = arena.insert(area);
        src.insert_area(origin(), src_handle);

        assert!(src.clone_into(&mut dst, &mut arena));
        let dst_handle = dst.area(&origin()).unwrap();
        assert_ne!(src_handle, dst_handle);

        let copy = arena.get_mut(dst_handle).unwrap();
        assert_eq!(copy.owner(), AreaOwner::Namespace(NamespaceKey::Session(NamespaceId(2))));
        assert!(!copy.has_listeners());
        assert_eq!(copy.map().get("k"), Some("v"));
        copy.set_item(&NullSink, me, "k", "changed", "u").unwrap();

        assert_eq!(arena.get(src_handle).unwrap().map().get("k"), Some("v"));
    }

    #[test]
    fn clone_into_non_empty_target_is_refused() {
        let mut arena = AreaArena::default();
        let mut src = StorageNamespace::session(NamespaceId(1), None, 1024);
        let mut dst = StorageNamespace::session(NamespaceId(2), None, 1024);

        let h = arena.insert(StorageArea::new(origin(), AreaOwner::Detached, 1024, None));
        src.insert_area(origin(), h);
        let existing = arena.insert(StorageArea::new(origin(), AreaOwner::Detached, 1024, None));
        dst.insert_area(origin(), existing);

        assert!(!src.clone_into(&mut dst, &mut arena));
        assert_eq!(dst.area(&origin()), Some(existing));
        assert_eq!(arena.len(), 2);
    }
}
