//! Durable SQLite store for a single origin's local storage.
//!
//! Each origin gets its own database file `<origin>.localstorage` holding one
//! table:
//!
//! ```sql
//! CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB NOT NULL ON CONFLICT FAIL)
//! ```
//!
//! Writes are not applied immediately. [`DurableOriginStore::record_change`]
//! buffers them and asks its [`StoreDelegate`] to schedule a flush after the
//! configured delay; every change arriving before the flush runs is folded
//! into the same buffer. A flush writes at most `flush_batch_size` changes in
//! one transaction and, if more are left, asks for another flush right away.
//!
//! The store is `Unopened` until first needed. Reads on an origin that has no
//! file yet do not create one; the first write does.

use crate::config::StorageConfig;
use crate::storage::map::StorageMap;
use crate::storage::types::OriginId;
use anyhow::Context;
use r2d2_sqlite::rusqlite::types::ValueRef;
use r2d2_sqlite::rusqlite::{params, Connection, OpenFlags, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File extension of per-origin databases.
pub const DATABASE_EXTENSION: &str = "localstorage";

const CREATE_ITEM_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB NOT NULL ON CONFLICT FAIL)";

/// Callbacks from a store into whoever owns the worker it runs on.
pub trait StoreDelegate: Send + Sync {
    /// Run [`DurableOriginStore::flush`] on the store with this generation after `delay`.
    fn schedule_flush(&self, origin: &OriginId, generation: u64, delay: Duration);

    /// The database file for `origin` was opened for writing at `path`.
    fn database_opened(&self, origin: &OriginId, path: &Path);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    /// Leave the store unopened when the file does not exist
    SkipIfMissing,
    /// Create file and schema as needed
    Create,
}

enum State {
    Unopened,
    Open(Connection),
    /// Opening failed. Persistence stays off for the lifetime of this store.
    Failed,
    Closed,
}

/// What [`DurableOriginStore::close`] did with the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Kept,
    /// The table was empty, so the file was removed
    Deleted,
}

pub struct DurableOriginStore {
    origin: OriginId,
    path: PathBuf,
    generation: u64,
    state: State,
    /// Buffered changes; `None` is a tombstone.
    pending: HashMap<String, Option<String>>,
    clear_pending: bool,
    flush_scheduled: bool,
    flush_delay: Duration,
    batch_size: usize,
    delegate: Arc<dyn StoreDelegate>,
    imports: usize,
}

/// Path of the database file for `origin` under `directory`.
pub fn database_path(directory: &Path, origin: &OriginId) -> PathBuf {
    directory.join(format!("{}.{}", origin, DATABASE_EXTENSION))
}

impl DurableOriginStore {
    pub fn new(
        origin: OriginId,
        directory: &Path,
        generation: u64,
        config: &StorageConfig,
        delegate: Arc<dyn StoreDelegate>,
    ) -> Self {
        Self {
            path: database_path(directory, &origin),
            origin,
            generation,
            state: State::Unopened,
            pending: HashMap::new(),
            clear_pending: false,
            flush_scheduled: false,
            flush_delay: config.flush_delay,
            batch_size: config.flush_batch_size.max(1),
            delegate,
            imports: 0,
        }
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Whether buffered changes are waiting to be written.
    pub fn has_pending(&self) -> bool {
        self.clear_pending || !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// How many times [`import_into`](Self::import_into) ran.
    pub fn import_count(&self) -> usize {
        self.imports
    }

    /// Loads every stored item into `map`. Does not create a missing file.
    pub fn import_into(&mut self, map: &mut StorageMap) {
        self.imports += 1;
        if !self.ensure_open(OpenMode::SkipIfMissing) {
            return;
        }
        if let State::Open(conn) = &self.state {
            match read_items(conn) {
                Ok(items) => {
                    log::debug!("{}: imported {} items", self.origin, items.len());
                    for (key, value) in items {
                        map.import_item(key, value);
                    }
                }
                Err(e) => log::error!("{}: cannot import items: {:#}", self.origin, e),
            }
        }
    }

    /// Buffers a change for `key`. `None` removes the key.
    pub fn record_change(&mut self, key: &str, value: Option<&str>) {
        if !self.accepts_writes() {
            return;
        }
        self.pending
            .insert(key.to_string(), value.map(str::to_string));
        self.schedule_flush(self.flush_delay);
    }

    /// Drops every buffered change and deletes all rows on the next flush.
    pub fn clear(&mut self) {
        if !self.accepts_writes() {
            return;
        }
        self.pending.clear();
        self.clear_pending = true;
        self.schedule_flush(self.flush_delay);
    }

    /// Writes the next batch of buffered changes.
    ///
    /// Runs from a scheduled task. When more changes remain than fit in one
    /// batch, another flush is scheduled immediately instead of waiting out
    /// the delay again.
    pub fn flush(&mut self) {
        self.flush_scheduled = false;
        if !self.has_pending() || !self.accepts_writes() {
            return;
        }

        self.write_next_batch();

        if self.has_pending() && self.accepts_writes() {
            self.schedule_flush(Duration::ZERO);
        }
    }

    /// Writes everything still buffered, then releases the file.
    ///
    /// An empty database is deleted on close.
    pub fn close(&mut self) -> CloseOutcome {
        if self.is_closed() {
            return CloseOutcome::Kept;
        }
        while self.has_pending() && self.accepts_writes() {
            self.write_next_batch();
        }
        self.flush_scheduled = false;
        self.pending.clear();
        self.clear_pending = false;

        let State::Open(conn) = std::mem::replace(&mut self.state, State::Closed) else {
            return CloseOutcome::Kept;
        };

        let empty = match count_items(&conn) {
            Ok(n) => n == 0,
            Err(e) => {
                log::warn!("{}: cannot count items on close: {:#}", self.origin, e);
                false
            }
        };
        if let Err((_, e)) = conn.close() {
            log::warn!("{}: error closing database: {}", self.origin, e);
        }

        if !empty {
            return CloseOutcome::Kept;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("{}: removed empty database {}", self.origin, self.path.display());
                CloseOutcome::Deleted
            }
            Err(e) => {
                log::warn!("{}: cannot remove empty database: {}", self.origin, e);
                CloseOutcome::Kept
            }
        }
    }

    /// Throws away buffered changes and releases the file without writing.
    ///
    /// The store goes back to `Unopened` under `generation` and can be used
    /// again, e.g. after its file was deleted. Flushes scheduled under the
    /// old generation no longer reach it.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.pending.clear();
        self.clear_pending = false;
        self.flush_scheduled = false;
        self.state = State::Unopened;
    }

    /// Whether the table holds no rows. A missing file counts as empty.
    pub fn is_empty(&mut self) -> bool {
        if !self.ensure_open(OpenMode::SkipIfMissing) {
            return true;
        }
        match &self.state {
            State::Open(conn) => count_items(conn).map(|n| n == 0).unwrap_or(false),
            _ => true,
        }
    }

    fn accepts_writes(&self) -> bool {
        matches!(self.state, State::Unopened | State::Open(_))
    }

    fn schedule_flush(&mut self, delay: Duration) {
        if self.flush_scheduled {
            return;
        }
        self.flush_scheduled = true;
        self.delegate
            .schedule_flush(&self.origin, self.generation, delay);
    }

    fn take_batch(&mut self) -> Vec<(String, Option<String>)> {
        if self.pending.len() <= self.batch_size {
            return self.pending.drain().collect();
        }
        let keys: Vec<String> = self.pending.keys().take(self.batch_size).cloned().collect();
        keys.into_iter()
            .filter_map(|k| self.pending.remove_entry(&k))
            .collect()
    }

    fn write_next_batch(&mut self) {
        let clear = std::mem::take(&mut self.clear_pending);
        let batch = self.take_batch();

        // Clearing a database that was never written needs no file.
        let mode = if batch.is_empty() {
            OpenMode::SkipIfMissing
        } else {
            OpenMode::Create
        };
        if !self.ensure_open(mode) {
            if !batch.is_empty() {
                log::error!(
                    "{}: database unavailable, dropping {} changes",
                    self.origin,
                    batch.len()
                );
                self.pending.clear();
            }
            return;
        }

        if let State::Open(conn) = &mut self.state {
            log::trace!("{}: writing {} changes (clear: {})", self.origin, batch.len(), clear);
            if let Err(e) = write_batch(conn, clear, &batch) {
                log::error!("{}: batch write stopped early: {:#}", self.origin, e);
            }
        }
    }

    /// Moves `Unopened` to `Open` if possible. Returns whether the store is open.
    fn ensure_open(&mut self, mode: OpenMode) -> bool {
        if let State::Unopened = self.state {
            if mode == OpenMode::SkipIfMissing && !self.path.exists() {
                return false;
            }
            match open_database(&self.path) {
                Ok(conn) => {
                    self.state = State::Open(conn);
                    self.delegate.database_opened(&self.origin, &self.path);
                }
                Err(e) => {
                    log::error!(
                        "{}: cannot open {}, storage stays in memory: {:#}",
                        self.origin,
                        self.path.display(),
                        e
                    );
                    self.state = State::Failed;
                }
            }
        }
        self.is_open()
    }
}

fn open_database(path: &Path) -> anyhow::Result<Connection> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating directory {}", dir.display()))?;
    }
    let mut conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .context("opening database")?;
    conn.busy_timeout(Duration::from_millis(500))?;

    migrate_item_table(&mut conn);
    conn.execute_batch(CREATE_ITEM_TABLE)
        .context("creating ItemTable")?;
    Ok(conn)
}

/// Rewrites an `ItemTable` whose value column is not a BLOB.
///
/// If the copy fails the table is dropped and recreated empty.
fn migrate_item_table(conn: &mut Connection) {
    let columns = match table_columns(conn) {
        Ok(columns) => columns,
        Err(e) => {
            log::warn!("cannot inspect ItemTable, recreating it: {:#}", e);
            drop_item_tables(conn);
            return;
        }
    };
    if columns.is_empty() {
        return;
    }
    let value_is_blob = columns
        .iter()
        .any(|(name, ty)| name == "value" && ty.eq_ignore_ascii_case("BLOB"));
    if value_is_blob {
        return;
    }

    log::debug!("migrating ItemTable to BLOB values");
    if let Err(e) = copy_to_blob_table(conn) {
        log::warn!("ItemTable migration failed, recreating it empty: {:#}", e);
        drop_item_tables(conn);
    }
}

fn table_columns(conn: &Connection) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info('ItemTable')")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn copy_to_blob_table(conn: &mut Connection) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS ItemTable2;
         CREATE TABLE ItemTable2 (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB NOT NULL ON CONFLICT FAIL);
         INSERT INTO ItemTable2 (key, value) SELECT key, CAST(value AS BLOB) FROM ItemTable;
         DROP TABLE ItemTable;
         ALTER TABLE ItemTable2 RENAME TO ItemTable;",
    )?;
    tx.commit()?;
    Ok(())
}

fn drop_item_tables(conn: &Connection) {
    if let Err(e) = conn.execute_batch("DROP TABLE IF EXISTS ItemTable; DROP TABLE IF EXISTS ItemTable2;") {
        log::error!("cannot drop ItemTable: {}", e);
    }
}

fn read_items(conn: &Connection) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM ItemTable")?;
    let rows = stmt.query_map([], |row| {
        let key: String = row.get(0)?;
        let value = cell_to_string(row.get_ref(1)?);
        Ok((key, value))
    })?;

    let mut items = Vec::new();
    for row in rows {
        if let (key, Some(value)) = row? {
            items.push((key, value));
        }
    }
    Ok(items)
}

fn cell_to_string(cell: ValueRef<'_>) -> Option<String> {
    match cell {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null => None,
    }
}

fn count_items(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM ItemTable", [], |row| row.get(0))?)
}

/// Applies one batch in a single transaction.
///
/// A failing statement stops the batch, but what was written before it is
/// still committed.
fn write_batch(conn: &mut Connection, clear: bool, batch: &[(String, Option<String>)]) -> anyhow::Result<()> {
    let tx = conn.transaction().context("starting transaction")?;
    let applied = apply_batch(&tx, clear, batch);
    tx.commit().context("committing batch")?;
    applied
}

fn apply_batch(tx: &Transaction<'_>, clear: bool, batch: &[(String, Option<String>)]) -> anyhow::Result<()> {
    if clear {
        tx.execute("DELETE FROM ItemTable", [])
            .context("clearing ItemTable")?;
    }

    let mut insert = tx.prepare_cached("INSERT INTO ItemTable (key, value) VALUES (?1, ?2)")?;
    let mut delete = tx.prepare_cached("DELETE FROM ItemTable WHERE key = ?1")?;
    for (key, value) in batch {
        let written = match value {
            Some(value) => insert.execute(params![key, value.as_bytes()]),
            None => delete.execute(params![key]),
        };
        written.with_context(|| format!("writing key {key:?}"))?;
    }
    Ok(())
}
