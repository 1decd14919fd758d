//! Per-server manual group order, persisted in SQLite.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::error::CoreError;
use crate::model::{Group, GLOBAL};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS group_order (
    server_id TEXT NOT NULL,
    name      TEXT NOT NULL,
    idx       INTEGER NOT NULL,
    PRIMARY KEY (server_id, name)
);
CREATE TABLE IF NOT EXISTS sort_mode (
    server_id TEXT PRIMARY KEY,
    enabled   INTEGER NOT NULL
);
";

pub type SavedOrder = HashMap<String, usize>;

pub struct OrderStore {
    conn: Mutex<Connection>,
}

impl OrderStore {
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Storage(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        info!("order store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the saved order for `server_id`; position in `names` is the
    /// index.
    pub fn save_order(&self, server_id: &str, names: &[String]) -> Result<(), CoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_order WHERE server_id = ?1", params![server_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO group_order (server_id, name, idx) VALUES (?1, ?2, ?3)",
            )?;
            for (idx, name) in names.iter().enumerate() {
                stmt.execute(params![server_id, name, idx as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_order(&self, server_id: &str) -> Result<SavedOrder, CoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, idx FROM group_order WHERE server_id = ?1")?;
        let rows = stmt.query_map(params![server_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut order = SavedOrder::new();
        for row in rows {
            let (name, idx) = row?;
            order.insert(name, usize::try_from(idx).unwrap_or(usize::MAX));
        }
        Ok(order)
    }

    pub fn clear_order(&self, server_id: &str) -> Result<(), CoreError> {
        self.conn()
            .execute("DELETE FROM group_order WHERE server_id = ?1", params![server_id])?;
        Ok(())
    }

    pub fn set_sort_mode(&self, server_id: &str, enabled: bool) -> Result<(), CoreError> {
        self.conn().execute(
            "INSERT INTO sort_mode (server_id, enabled) VALUES (?1, ?2)
             ON CONFLICT(server_id) DO UPDATE SET enabled = excluded.enabled",
            params![server_id, enabled],
        )?;
        Ok(())
    }

    /// Defaults to off for servers that never set it.
    pub fn sort_mode(&self, server_id: &str) -> Result<bool, CoreError> {
        let enabled = self
            .conn()
            .query_row(
                "SELECT enabled FROM sort_mode WHERE server_id = ?1",
                params![server_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(false))
    }
}

/// Orders groups for display. A saved order wins when sort mode is on and it
/// covers every group; otherwise `GLOBAL`'s member order (with `GLOBAL`
/// itself after its members); otherwise by name.
pub fn sorted_groups<'a>(groups: &'a [Group], sort_mode: bool, saved: &SavedOrder) -> Vec<&'a Group> {
    let mut out: Vec<&Group> = groups.iter().collect();

    if sort_mode && !saved.is_empty() && groups.iter().all(|g| saved.contains_key(&g.name)) {
        out.sort_by(|a, b| saved[&a.name].cmp(&saved[&b.name]).then_with(|| a.name.cmp(&b.name)));
        return out;
    }

    if let Some(global) = groups.iter().find(|g| g.name == GLOBAL) {
        let mut rank: HashMap<&str, usize> = HashMap::new();
        for (i, name) in global.all.iter().enumerate() {
            rank.entry(name.as_str()).or_insert(i);
        }
        rank.insert(GLOBAL, global.all.len());
        let key = |g: &Group| rank.get(g.name.as_str()).copied().unwrap_or(usize::MAX);
        out.sort_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name)));
        return out;
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
