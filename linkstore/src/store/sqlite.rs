use super::{check_unique, document_id, select, DocumentStore, Filter, FindOptions, IndexSpec, Update, UpdateResult};
use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction};
use serde_json::Value;
use std::path::Path;

/// SQLite-backed store. Documents are kept as JSON text keyed by
/// `(collection, id)`; filters and updates are evaluated in process, one
/// SQL transaction per call.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

struct Row {
    seq: i64,
    document: Value,
}

impl SqliteStore {
    /// Open or create a database file at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                UNIQUE (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

            CREATE TABLE IF NOT EXISTS indexes (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                spec_json TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            );
            ",
        )?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }
}

fn load_rows(tx: &Transaction<'_>, collection: &str) -> Result<Vec<Row>> {
    let mut stmt = tx.prepare("SELECT seq, data_json FROM documents WHERE collection = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![collection], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (seq, json) = row?;
        out.push(Row {
            seq,
            document: serde_json::from_str(&json)?,
        });
    }
    Ok(out)
}

fn load_indexes(tx: &Transaction<'_>, collection: &str) -> Result<Vec<IndexSpec>> {
    let mut stmt = tx.prepare("SELECT spec_json FROM indexes WHERE collection = ?1 ORDER BY name")?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

/// Apply `update` to `rows[position]` and write it back when it changed.
fn apply_at(
    tx: &Transaction<'_>,
    collection: &str,
    indexes: &[IndexSpec],
    rows: &mut [Row],
    position: usize,
    update: &Update,
) -> Result<bool> {
    let mut next = rows[position].document.clone();
    if !update.apply(&mut next) {
        return Ok(false);
    }
    let others = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != position)
        .map(|(_, r)| &r.document);
    check_unique(collection, indexes, others, &next)?;
    tx.execute(
        "UPDATE documents SET id = ?1, data_json = ?2 WHERE seq = ?3",
        params![document_id(&next)?, serde_json::to_string(&next)?, rows[position].seq],
    )?;
    rows[position].document = next;
    Ok(true)
}

impl DocumentStore for SqliteStore {
    fn define(&self, collection: &str, indexes: &[IndexSpec]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for index in indexes {
            tx.execute(
                "INSERT OR REPLACE INTO indexes (collection, name, spec_json) VALUES (?1, ?2, ?3)",
                params![collection, index.name, serde_json::to_string(index)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = load_rows(&tx, collection)?;
        Ok(select(rows.iter().map(|r| &r.document), filter, options))
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = load_rows(&tx, collection)?;
        Ok(rows.iter().filter(|r| filter.matches(&r.document)).count() as u64)
    }

    fn insert_one(&self, collection: &str, document: Value) -> Result<()> {
        let id = document_id(&document)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = load_rows(&tx, collection)?;
        let indexes = load_indexes(&tx, collection)?;
        check_unique(collection, &indexes, rows.iter().map(|r| &r.document), &document)?;
        tx.execute(
            "INSERT INTO documents (collection, id, data_json) VALUES (?1, ?2, ?3)",
            params![collection, id, serde_json::to_string(&document)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut rows = load_rows(&tx, collection)?;
        let Some(position) = rows.iter().position(|r| filter.matches(&r.document)) else {
            return Ok(UpdateResult::default());
        };
        let indexes = load_indexes(&tx, collection)?;
        let modified = apply_at(&tx, collection, &indexes, &mut rows, position, update)?;
        tx.commit()?;
        Ok(UpdateResult {
            matched: 1,
            modified: modified as u64,
        })
    }

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut rows = load_rows(&tx, collection)?;
        let indexes = load_indexes(&tx, collection)?;
        let positions: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| filter.matches(&r.document))
            .map(|(i, _)| i)
            .collect();

        let mut result = UpdateResult::default();
        for position in positions {
            result.matched += 1;
            if apply_at(&tx, collection, &indexes, &mut rows, position, update)? {
                result.modified += 1;
            }
        }
        tx.commit()?;
        Ok(result)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = load_rows(&tx, collection)?;
        let Some(row) = rows.iter().find(|r| filter.matches(&r.document)) else {
            return Ok(0);
        };
        let deleted = tx.execute("DELETE FROM documents WHERE seq = ?1", params![row.seq])?;
        tx.commit()?;
        Ok(deleted as u64)
    }

    fn clear(&self, collection: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM documents WHERE collection = ?1", params![collection])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::SortKey;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_crud_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_one("node", json!({"_id": {"$oid": "a"}, "name": "A", "order": 2}))
            .unwrap();
        store
            .insert_one("node", json!({"_id": {"$oid": "b"}, "name": "B", "order": 1}))
            .unwrap();

        let listed = store
            .find("node", &Filter::All, &FindOptions::sorted(vec![SortKey::asc("order")]))
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["name"], json!("B"));

        let result = store
            .update_one("node", &Filter::id("a"), &Update::new().set("name", json!("A2")))
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 1, modified: 1 });
        let doc = store.find_one("node", &Filter::id("a")).unwrap().unwrap();
        assert_eq!(doc["name"], json!("A2"));

        assert_eq!(store.delete_one("node", &Filter::id("b")).unwrap(), 1);
        assert_eq!(store.count("node", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn test_unique_index_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.define("user", &[IndexSpec::unique(&["email"])]).unwrap();
            store
                .insert_one("user", json!({"_id": {"$oid": "1"}, "email": "a@x.io"}))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count("user", &Filter::All).unwrap(), 1);
        let err = store
            .insert_one("user", json!({"_id": {"$oid": "2"}, "email": "a@x.io"}))
            .unwrap_err();
        assert_eq!(err.convert().issues()[0].path, "email");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_one("node", json!({"_id": {"$oid": "a"}})).unwrap();
        let err = store.insert_one("node", json!({"_id": {"$oid": "a"}})).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }
}
