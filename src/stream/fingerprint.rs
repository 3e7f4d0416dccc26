//! Content fingerprints over configured query groups.
//!
//! Each group folds the full result set of its queries into one md5 digest.
//! Stateless given a store snapshot: the same rows always produce the same
//! digest, so an unchanged store is a no-op for the detector.

use crate::config::QueryGroupConfig;
use crate::store::StoreError;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::collections::HashMap;

/// A group fingerprint. 16 raw md5 bytes.
pub type Fingerprint = [u8; 16];

/// A named group of read-only queries digested together.
#[derive(Debug, Clone)]
pub struct QueryGroup {
    pub name: String,
    pub queries: Vec<String>,
}

impl From<&QueryGroupConfig> for QueryGroup {
    fn from(cfg: &QueryGroupConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            queries: cfg.queries.clone(),
        }
    }
}

/// Computes per-group fingerprints for a fixed query set.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    groups: Vec<QueryGroup>,
}

impl Fingerprinter {
    pub fn new(groups: Vec<QueryGroup>) -> Self {
        Self { groups }
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Compute the fingerprint of every group over one connection.
    ///
    /// All queries run on the same connection so a cycle sees one snapshot
    /// per group rather than a torn mix of writer generations.
    pub fn compute(&self, conn: &Connection) -> Result<HashMap<String, Fingerprint>, StoreError> {
        let mut out = HashMap::with_capacity(self.groups.len());
        for group in &self.groups {
            out.insert(group.name.clone(), Self::digest_group(conn, group)?);
        }
        Ok(out)
    }

    fn digest_group(conn: &Connection, group: &QueryGroup) -> Result<Fingerprint, StoreError> {
        let mut ctx = md5::Context::new();
        for sql in &group.queries {
            ctx.consume(sql.as_bytes());
            ctx.consume([0xff]);

            let mut stmt = conn.prepare(sql)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                for idx in 0..column_count {
                    match row.get_ref(idx)? {
                        ValueRef::Null => ctx.consume([0x00]),
                        ValueRef::Integer(v) => {
                            ctx.consume([0x01]);
                            ctx.consume(v.to_le_bytes());
                        }
                        ValueRef::Real(v) => {
                            ctx.consume([0x02]);
                            ctx.consume(v.to_le_bytes());
                        }
                        ValueRef::Text(v) => {
                            ctx.consume([0x03]);
                            ctx.consume(v);
                        }
                        ValueRef::Blob(v) => {
                            ctx.consume([0x04]);
                            ctx.consume(v);
                        }
                    }
                    ctx.consume([0xfe]);
                }
                ctx.consume([0xfd]);
            }
        }
        Ok(ctx.compute().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sessions (id INTEGER PRIMARY KEY, outcome TEXT);
             INSERT INTO sessions (id, outcome) VALUES (1, 'ok'), (2, NULL);",
        )
        .unwrap();
        conn
    }

    fn fingerprinter() -> Fingerprinter {
        Fingerprinter::new(vec![QueryGroup {
            name: "sessions".to_string(),
            queries: vec!["SELECT id, outcome FROM sessions ORDER BY id".to_string()],
        }])
    }

    #[test]
    fn unchanged_store_same_fingerprint() {
        let conn = test_store();
        let fp = fingerprinter();

        let first = fp.compute(&conn).unwrap();
        let second = fp.compute(&conn).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mutation_changes_fingerprint() {
        let conn = test_store();
        let fp = fingerprinter();

        let before = fp.compute(&conn).unwrap();
        conn.execute("UPDATE sessions SET outcome = 'failed' WHERE id = 2", [])
            .unwrap();
        let after = fp.compute(&conn).unwrap();
        assert_ne!(before["sessions"], after["sessions"]);
    }

    #[test]
    fn groups_are_independent() {
        let conn = test_store();
        conn.execute_batch(
            "CREATE TABLE tool_calls (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO tool_calls (id, name) VALUES (1, 'read');",
        )
        .unwrap();

        let fp = Fingerprinter::new(vec![
            QueryGroup {
                name: "sessions".to_string(),
                queries: vec!["SELECT id, outcome FROM sessions ORDER BY id".to_string()],
            },
            QueryGroup {
                name: "tools".to_string(),
                queries: vec!["SELECT id, name FROM tool_calls ORDER BY id".to_string()],
            },
        ]);

        let before = fp.compute(&conn).unwrap();
        conn.execute("INSERT INTO tool_calls (id, name) VALUES (2, 'write')", [])
            .unwrap();
        let after = fp.compute(&conn).unwrap();

        assert_eq!(before["sessions"], after["sessions"]);
        assert_ne!(before["tools"], after["tools"]);
    }

    #[test]
    fn null_and_empty_text_are_distinct() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES (NULL);")
            .unwrap();
        let fp = Fingerprinter::new(vec![QueryGroup {
            name: "t".to_string(),
            queries: vec!["SELECT v FROM t".to_string()],
        }]);

        let with_null = fp.compute(&conn).unwrap();
        conn.execute("UPDATE t SET v = ''", []).unwrap();
        let with_empty = fp.compute(&conn).unwrap();
        assert_ne!(with_null["t"], with_empty["t"]);
    }
}
