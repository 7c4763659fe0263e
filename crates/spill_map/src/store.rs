use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context as _;
use rusqlite::{
    params,
    Connection,
};

/// Single-table key/blob store backing a [`crate::SpillMap`]. The database
/// is transient (one sweeper run), so durability is traded away:
/// write-ahead journaling for throughput, synchronous writes off.
pub struct DiskStore {
    connection: Connection,
    path: PathBuf,
}

const SPILL_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS spill (
    key TEXT NOT NULL,
    value BLOB NOT NULL,

    PRIMARY KEY (key)
);
"#;

const GET_VALUE: &str = "SELECT value FROM spill WHERE key = ?";
const HAS_KEY: &str = "SELECT 1 FROM spill WHERE key = ? LIMIT 1";
const COUNT_KEYS: &str = "SELECT COUNT(*) FROM spill";
const UPSERT_VALUE: &str = "INSERT OR REPLACE INTO spill (key, value) VALUES (?, ?)";
const INSERT_IF_ABSENT: &str =
    "INSERT INTO spill (key, value) VALUES (?, ?) ON CONFLICT (key) DO NOTHING";
const DELETE_KEY: &str = "DELETE FROM spill WHERE key = ?";
const SCAN_FIRST: &str = "SELECT key, value FROM spill ORDER BY key LIMIT ?";
const SCAN_AFTER: &str = "SELECT key, value FROM spill WHERE key > ? ORDER BY key LIMIT ?";

impl DiskStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open spill database at {}", path.display()))?;
        connection.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        connection.pragma_update(None, "synchronous", "OFF")?;
        connection.execute_batch(SPILL_INIT)?;
        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut stmt = self.connection.prepare_cached(GET_VALUE)?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> anyhow::Result<bool> {
        let mut stmt = self.connection.prepare_cached(HAS_KEY)?;
        Ok(stmt.exists(params![key])?)
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let count: i64 = self.connection.query_row(COUNT_KEYS, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Insert or replace a batch of rows in one transaction.
    pub fn put_many(&mut self, rows: &[(String, Vec<u8>)]) -> anyhow::Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut upsert = tx.prepare_cached(UPSERT_VALUE)?;
            for (key, value) in rows {
                upsert.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert rows whose keys are not yet present, returning the keys that
    /// already existed so the caller can read, merge, and replace them.
    pub fn insert_new(&mut self, rows: &[(String, Vec<u8>)]) -> anyhow::Result<Vec<String>> {
        let mut conflicts = Vec::new();
        let tx = self.connection.transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT_IF_ABSENT)?;
            for (key, value) in rows {
                if insert.execute(params![key, value])? == 0 {
                    conflicts.push(key.clone());
                }
            }
        }
        tx.commit()?;
        Ok(conflicts)
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut stmt = self.connection.prepare_cached(DELETE_KEY)?;
        Ok(stmt.execute(params![key])? > 0)
    }

    /// One page of rows in key order, strictly after `after` when supplied.
    pub fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        match after {
            Some(after) => {
                let mut stmt = self.connection.prepare_cached(SCAN_AFTER)?;
                let rows = collect_rows(stmt.query(params![after, limit as i64])?);
                rows
            },
            None => {
                let mut stmt = self.connection.prepare_cached(SCAN_FIRST)?;
                let rows = collect_rows(stmt.query(params![limit as i64])?);
                rows
            },
        }
    }

    /// Close the connection and delete the database file.
    pub fn destroy(self) -> anyhow::Result<()> {
        let path = self.path.clone();
        self.connection
            .close()
            .map_err(|(_, e)| e)
            .context("failed to close spill database")?;
        remove_database_files(&path);
        Ok(())
    }
}

fn collect_rows(mut rows: rusqlite::Rows<'_>) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut page = Vec::new();
    while let Some(row) = rows.next()? {
        page.push((row.get(0)?, row.get(1)?));
    }
    Ok(page)
}

/// Best-effort removal of the database and its WAL sidecar files.
pub(crate) fn remove_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let target = PathBuf::from(target);
        if target.exists() {
            if let Err(e) = std::fs::remove_file(&target) {
                tracing::warn!("Failed to remove spill file {}: {e}", target.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DiskStore;

    #[test]
    fn test_insert_new_reports_conflicting_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = DiskStore::open(&dir.path().join("spill.sqlite"))?;
        store.put_many(&[("a".to_string(), b"1".to_vec())])?;

        let conflicts = store.insert_new(&[
            ("a".to_string(), b"2".to_vec()),
            ("b".to_string(), b"3".to_vec()),
        ])?;
        assert_eq!(conflicts, vec!["a".to_string()]);
        // The conflicting row keeps its original value until replaced.
        assert_eq!(store.get("a")?, Some(b"1".to_vec()));
        assert_eq!(store.get("b")?, Some(b"3".to_vec()));
        Ok(())
    }

    #[test]
    fn test_scan_pages_in_key_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = DiskStore::open(&dir.path().join("spill.sqlite"))?;
        let rows: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| (format!("k{i}"), vec![i as u8]))
            .collect();
        store.put_many(&rows)?;

        let first = store.scan_page(None, 2)?;
        assert_eq!(first[0].0, "k0");
        assert_eq!(first[1].0, "k1");
        let rest = store.scan_page(Some("k1"), 10)?;
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].0, "k2");
        Ok(())
    }

    #[test]
    fn test_destroy_removes_database_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spill.sqlite");
        let store = DiskStore::open(&path)?;
        assert!(path.exists());
        store.destroy()?;
        assert!(!path.exists());
        Ok(())
    }
}
