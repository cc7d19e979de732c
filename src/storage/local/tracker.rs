//! Origin registry backed by `StorageTracker.db`.
//!
//! The tracker records which origins own a durable store in the local storage
//! directory and where the file lives. An in-memory set mirrors the
//! `Origins` table so lookups never touch the disk. When the last origin is
//! removed the tracker file itself is deleted, together with the directory
//! if nothing else is left in it.

use super::database::{database_path, DATABASE_EXTENSION};
use crate::storage::types::OriginId;
use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::rusqlite::{params, OpenFlags};
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Name of the tracker database inside the local storage directory.
pub const TRACKER_FILE_NAME: &str = "StorageTracker.db";

/// On-disk facts about one tracked origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginDetails {
    pub origin: OriginId,
    pub path: PathBuf,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

#[derive(Default)]
pub struct OriginRegistry {
    directory: Option<PathBuf>,
    pool: Option<Pool<SqliteConnectionManager>>,
    origins: BTreeSet<OriginId>,
}

impl OriginRegistry {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            directory,
            pool: None,
            origins: BTreeSet::new(),
        }
    }

    /// Points the registry at another directory and forgets every tracked
    /// origin. Call [`reconcile_with_disk`](Self::reconcile_with_disk) to load
    /// the new directory's state.
    pub fn set_directory(&mut self, directory: Option<PathBuf>) {
        self.pool = None;
        self.origins.clear();
        self.directory = directory;
    }

    pub fn tracker_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(TRACKER_FILE_NAME))
    }

    pub fn database_path(&self, origin: &OriginId) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| database_path(dir, origin))
    }

    pub fn all_origins(&self) -> Vec<OriginId> {
        self.origins.iter().cloned().collect()
    }

    /// Records that `origin` has a database at `path`. Idempotent.
    ///
    /// Ignored when the file no longer exists, which happens when the store
    /// was opened and deleted again before this record was processed.
    pub fn record_origin_opened(&mut self, origin: &OriginId, path: &Path) -> anyhow::Result<()> {
        if self.origins.contains(origin) {
            return Ok(());
        }
        if !path.exists() {
            log::debug!("{origin}: database already gone, not tracking it");
            return Ok(());
        }

        let pool = self.pool()?;
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO Origins (origin, path) VALUES (?1, ?2)",
            params![origin.as_str(), path.to_string_lossy()],
        )
        .with_context(|| format!("tracking origin {origin}"))?;

        self.origins.insert(origin.clone());
        Ok(())
    }

    /// Forgets `origin`. Idempotent. Deletes the tracker when it becomes empty.
    pub fn record_origin_deleted(&mut self, origin: &OriginId) -> anyhow::Result<()> {
        if let Some(pool) = self.existing_pool()? {
            let conn = pool.get()?;
            conn.execute("DELETE FROM Origins WHERE origin = ?1", params![origin.as_str()])
                .with_context(|| format!("untracking origin {origin}"))?;
        }
        self.origins.remove(origin);

        if self.origins.is_empty() {
            self.delete_tracker_file(remove_file_if_present);
        }
        Ok(())
    }

    /// Deletes the database file of `origin` and forgets it.
    pub fn delete_origin(&mut self, origin: &OriginId) -> anyhow::Result<()> {
        if let Some(path) = self.database_path(origin) {
            remove_file_if_present(&path)?;
        }
        self.record_origin_deleted(origin)
    }

    /// Loads the `Origins` table, then brings it in line with the database
    /// files actually present in the directory.
    pub fn reconcile_with_disk(&mut self) -> anyhow::Result<()> {
        let Some(dir) = self.directory.clone() else {
            return Ok(());
        };

        if let Some(pool) = self.existing_pool()? {
            let conn = pool.get()?;
            let mut stmt = conn.prepare("SELECT origin FROM Origins")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let row = row?;
                match OriginId::parse(&row) {
                    Ok(origin) => {
                        self.origins.insert(origin);
                    }
                    Err(_) => log::warn!("ignoring malformed tracker entry {row:?}"),
                }
            }
        }

        let on_disk = list_databases(&dir)?;

        for origin in on_disk.difference(&self.origins.clone()) {
            self.record_origin_opened(origin, &database_path(&dir, origin))?;
        }
        let vanished: Vec<OriginId> = self.origins.difference(&on_disk).cloned().collect();
        for origin in &vanished {
            self.record_origin_deleted(origin)?;
        }

        log::debug!(
            "tracker reconciled: {} origins ({} vanished)",
            self.origins.len(),
            vanished.len()
        );
        Ok(())
    }

    /// File metadata for every tracked origin.
    pub fn origin_details(&self) -> Vec<OriginDetails> {
        let Some(dir) = self.directory.as_deref() else {
            return Vec::new();
        };
        self.origins
            .iter()
            .map(|origin| {
                let path = database_path(dir, origin);
                let meta = std::fs::metadata(&path).ok();
                OriginDetails {
                    origin: origin.clone(),
                    created: meta.as_ref().and_then(|m| m.created().ok()),
                    modified: meta.as_ref().and_then(|m| m.modified().ok()),
                    path,
                }
            })
            .collect()
    }

    /// Deletes every tracked database, then the tracker itself.
    ///
    /// If the tracker file cannot be removed its rows are deleted instead.
    pub fn delete_everything(&mut self) -> anyhow::Result<()> {
        self.delete_everything_with(remove_file_if_present)
    }

    fn delete_everything_with(&mut self, remove: fn(&Path) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let Some(dir) = self.directory.clone() else {
            self.origins.clear();
            return Ok(());
        };

        let mut doomed = std::mem::take(&mut self.origins);
        if dir.exists() {
            doomed.extend(list_databases(&dir)?);
        }
        for origin in &doomed {
            if let Err(e) = remove(&database_path(&dir, origin)) {
                log::error!("{origin}: cannot delete database: {e:#}");
            }
        }

        self.delete_tracker_file(remove);
        if let Some(tracker) = self.tracker_path().filter(|p| p.exists()) {
            log::warn!("cannot remove {}, emptying it instead", tracker.display());
            let pool = self.pool()?;
            pool.get()?.execute("DELETE FROM Origins", [])?;
        }
        Ok(())
    }

    fn delete_tracker_file(&mut self, remove: fn(&Path) -> anyhow::Result<()>) {
        self.pool = None;
        let Some(dir) = self.directory.as_deref() else {
            return;
        };
        if let Err(e) = remove(&dir.join(TRACKER_FILE_NAME)) {
            log::warn!("cannot remove tracker file: {e:#}");
        }
        // Only succeeds when nothing else is left in the directory.
        let _ = std::fs::remove_dir(dir);
    }

    /// Opens the tracker only when its file already exists.
    fn existing_pool(&mut self) -> anyhow::Result<Option<Pool<SqliteConnectionManager>>> {
        if self.pool.is_none() && !self.tracker_path().is_some_and(|p| p.exists()) {
            return Ok(None);
        }
        self.pool().map(Some)
    }

    fn pool(&mut self) -> anyhow::Result<Pool<SqliteConnectionManager>> {
        if let Some(pool) = &self.pool {
            return Ok(pool.clone());
        }
        let dir = self
            .directory
            .as_deref()
            .context("no local storage directory configured")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let manager = SqliteConnectionManager::file(dir.join(TRACKER_FILE_NAME))
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE)
            .with_init(|c| {
                c.busy_timeout(Duration::from_millis(500))?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS Origins (origin TEXT UNIQUE ON CONFLICT REPLACE, path TEXT);",
                )?;
                Ok(())
            });

        // Only the storage worker talks to the tracker.
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .context("opening tracker database")?;

        self.pool = Some(pool.clone());
        Ok(pool)
    }
}

fn remove_file_if_present(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Origins that have a database file in `dir`.
fn list_databases(dir: &Path) -> anyhow::Result<BTreeSet<OriginId>> {
    let mut found = BTreeSet::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DATABASE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(origin) = OriginId::parse(stem) {
            found.insert(origin);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn o(s: &str) -> OriginId {
        OriginId::parse(s).unwrap()
    }

    fn touch_database(dir: &Path, origin: &OriginId) -> PathBuf {
        let path = database_path(dir, origin);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn opened_and_deleted_keep_table_and_set_in_sync() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("local");
        std::fs::create_dir_all(&root).unwrap();
        let mut registry = OriginRegistry::new(Some(root.clone()));

        let a = o("https_a.test_443");
        let b = o("https_b.test_443");
        let path_a = touch_database(&root, &a);
        let path_b = touch_database(&root, &b);

        registry.record_origin_opened(&a, &path_a).unwrap();
        registry.record_origin_opened(&a, &path_a).unwrap();
        registry.record_origin_opened(&b, &path_b).unwrap();
        assert_eq!(registry.all_origins(), vec![a.clone(), b.clone()]);
        assert!(root.join(TRACKER_FILE_NAME).exists());

        // a fresh registry sees the same table
        let mut reloaded = OriginRegistry::new(Some(root.clone()));
        reloaded.reconcile_with_disk().unwrap();
        assert_eq!(reloaded.all_origins(), vec![a.clone(), b.clone()]);

        registry.record_origin_deleted(&a).unwrap();
        registry.record_origin_deleted(&a).unwrap();
        assert_eq!(registry.all_origins(), vec![b.clone()]);
        assert!(root.join(TRACKER_FILE_NAME).exists());
    }

    #[test]
    fn deleting_last_origin_removes_tracker_and_empty_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("local");
        std::fs::create_dir_all(&root).unwrap();
        let mut registry = OriginRegistry::new(Some(root.clone()));

        let a = o("https_a.test_443");
        let path = touch_database(&root, &a);
        registry.record_origin_opened(&a, &path).unwrap();

        registry.delete_origin(&a).unwrap();
        assert!(!path.exists());
        assert!(registry.all_origins().is_empty());
        assert!(!root.join(TRACKER_FILE_NAME).exists());
        assert!(!root.exists());
    }

    #[test]
    fn opened_record_for_vanished_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut registry = OriginRegistry::new(Some(dir.path().to_path_buf()));
        let a = o("https_a.test_443");

        registry
            .record_origin_opened(&a, &database_path(dir.path(), &a))
            .unwrap();
        assert!(registry.all_origins().is_empty());
        assert!(!dir.path().join(TRACKER_FILE_NAME).exists());
    }

    #[test]
    fn reconcile_adds_untracked_files_and_drops_vanished_ones() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let a = o("https_a.test_443");
        let b = o("https_b.test_443");
        let c = o("http_c.test_80");

        let mut registry = OriginRegistry::new(Some(root.clone()));
        let path_a = touch_database(&root, &a);
        registry.record_origin_opened(&a, &path_a).unwrap();
        let path_b = touch_database(&root, &b);
        registry.record_origin_opened(&b, &path_b).unwrap();

        // b disappears behind our back, c shows up
        std::fs::remove_file(&path_b).unwrap();
        touch_database(&root, &c);
        std::fs::write(root.join("unrelated.txt"), b"x").unwrap();

        let mut fresh = OriginRegistry::new(Some(root.clone()));
        fresh.reconcile_with_disk().unwrap();
        assert_eq!(fresh.all_origins(), vec![c.clone(), a.clone()]);

        let mut again = OriginRegistry::new(Some(root));
        again.reconcile_with_disk().unwrap();
        assert_eq!(again.all_origins(), vec![c, a]);
    }

    #[test]
    fn delete_everything_removes_databases_and_tracker() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let mut registry = OriginRegistry::new(Some(root.clone()));

        let a = o("https_a.test_443");
        let b = o("https_b.test_443");
        let path_a = touch_database(&root, &a);
        registry.record_origin_opened(&a, &path_a).unwrap();
        // untracked file is deleted too
        let path_b = touch_database(&root, &b);

        registry.delete_everything().unwrap();
        assert!(!path_a.exists());
        assert!(!path_b.exists());
        assert!(!root.join(TRACKER_FILE_NAME).exists());
        assert!(registry.all_origins().is_empty());
    }

    #[test]
    fn delete_everything_empties_a_tracker_it_cannot_remove() {
        fn tracker_is_locked(path: &Path) -> anyhow::Result<()> {
            if path.ends_with(TRACKER_FILE_NAME) {
                anyhow::bail!("{} is locked", path.display());
            }
            remove_file_if_present(path)
        }

        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let mut registry = OriginRegistry::new(Some(root.clone()));
        let a = o("https_a.test_443");
        let path_a = touch_database(&root, &a);
        registry.record_origin_opened(&a, &path_a).unwrap();

        registry.delete_everything_with(tracker_is_locked).unwrap();
        assert!(!path_a.exists());
        assert!(registry.all_origins().is_empty());

        let tracker = root.join(TRACKER_FILE_NAME);
        assert!(tracker.exists());
        let conn = r2d2_sqlite::rusqlite::Connection::open(&tracker).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM Origins", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);

        let mut reloaded = OriginRegistry::new(Some(root));
        reloaded.reconcile_with_disk().unwrap();
        assert!(reloaded.all_origins().is_empty());
    }

    #[test]
    fn origin_details_report_file_metadata() {
        let dir = TempDir::new().unwrap();
        let mut registry = OriginRegistry::new(Some(dir.path().to_path_buf()));
        let a = o("https_a.test_443");
        let path = touch_database(dir.path(), &a);
        registry.record_origin_opened(&a, &path).unwrap();

        let details = registry.origin_details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].origin, a);
        assert_eq!(details[0].path, path);
        assert!(details[0].modified.is_some());
    }

    #[test]
    fn registry_without_directory_is_inert() {
        let mut registry = OriginRegistry::new(None);
        registry.reconcile_with_disk().unwrap();
        registry.delete_everything().unwrap();
        assert!(registry.all_origins().is_empty());
        assert!(registry.origin_details().is_empty());
    }
}
