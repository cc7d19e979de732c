//! Web storage backend.
//!
//! This module implements the process-wide side of HTML5 **localStorage** and
//! **sessionStorage**. Renderer connections bind client-side area ids to
//! per-origin storage areas, read and write through the coordinator, and get
//! told about every change another client makes.
//!
//! # Concepts
//!
//! - **Namespace**: a collection of per-origin areas. There is one *local*
//!   namespace, persistent and shared by every connection, and any number of
//!   *session* namespaces, one per browsing-context group, each bound to a
//!   single allowed connection.
//! - **Area**: the live key/value map of one origin inside one namespace,
//!   plus the listeners bound to it. Local areas are backed by a per-origin
//!   SQLite file that is imported lazily and written in debounced batches.
//! - **Tracker**: `StorageTracker.db`, recording which origins have a file
//!   in the local storage directory.
//!
//! All state lives on one serial worker (see [`crate::queue`]). Callers never
//! block on disk I/O; results come back through oneshot channels and change
//! notifications go out through an [`EventSink`].
//!
//! # Available types
//!
//! - [`StorageCoordinator`]: entry point for every operation.
//! - [`OriginId`], [`ConnectionId`], [`AreaId`], [`NamespaceId`]: identifiers.
//! - [`NamespaceKey`]: selects the local namespace or a session namespace.
//! - [`StorageEvent`], [`EventSink`]: outbound notifications.
//! - [`StorageMap`]: the quota-aware snapshot behind every area.
//! - [`OriginDetails`]: on-disk facts about a tracked origin.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gosub_webstorage::config::StorageConfig;
//! use gosub_webstorage::storage::{
//!     AreaId, ConnectionId, Delivery, NamespaceKey, OriginId, StorageCoordinator,
//! };
//! use tokio::sync::mpsc;
//!
//! let (events, _rx) = mpsc::unbounded_channel::<Delivery>();
//! let storage = StorageCoordinator::new(
//!     StorageConfig::with_directory("/tmp/gosub/localstorage"),
//!     Arc::new(events),
//! )
//! .unwrap();
//!
//! let conn = ConnectionId::new();
//! let origin = OriginId::from_url(&"https://example.com/".parse().unwrap()).unwrap();
//! storage.bind_area(conn, AreaId(1), NamespaceKey::Local, origin);
//! let _previous = storage
//!     .set_item(conn, AreaId(1), "theme".into(), "dark".into(), "https://example.com/".into())
//!     .blocking_recv();
//! ```

/// Storage area, the live state of one origin in one namespace.
pub mod area;
/// Coordinator owning every namespace, area and the tracker.
pub mod coordinator;
/// Outbound change notifications.
pub mod event;
/// Quota-aware key/value snapshot.
pub mod map;
/// Local and session namespaces.
pub mod namespace;
/// Storage identifiers
pub mod types;

/// Durable local storage.
pub mod local {
    /// Per-origin SQLite store.
    pub mod database;
    /// Origin registry (`StorageTracker.db`).
    pub mod tracker;
}

pub use coordinator::StorageCoordinator;
pub use event::{Delivery, EventSink, NullSink, StorageEvent};
pub use local::tracker::OriginDetails;
pub use map::StorageMap;
pub use namespace::NamespaceKey;
pub use types::{AreaId, ConnectionId, Listener, NamespaceId, OriginId};
