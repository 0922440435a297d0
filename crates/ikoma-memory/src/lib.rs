use anyhow::Result;
use chrono::Utc;
use ikoma_llm::LlmClient;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Entries written with a newer schema version are skipped on read rather
/// than misinterpreted; bump this when the row layout changes.
pub const MEMORY_SCHEMA_VERSION: i64 = 1;

// The namespace column holds the tuple as a JSON array, not a joined
// string: components may themselves contain separator characters, and a
// join would let distinct (namespace, key) pairs collide.
const INIT_SQL: &str = "CREATE TABLE IF NOT EXISTS memories (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    context TEXT NOT NULL,
    plan_context TEXT,
    reflection TEXT,
    metadata TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
 );
 CREATE INDEX IF NOT EXISTS idx_memories_namespace ON memories(namespace);";

/// What callers hand to `put`. Everything except `content` is metadata
/// carried along for later retrieval display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryValue {
    pub content: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl MemoryValue {
    pub fn text(content: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            context: context.into(),
            plan_context: None,
            reflection: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub namespace: Vec<String>,
    pub key: String,
    pub content: String,
    pub timestamp: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A search hit with its distance so callers can threshold.
/// Distance is `1 - cosine_similarity`, so lower means more similar.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub entry: MemoryEntry,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_entries: u64,
    pub path: PathBuf,
}

/// Persistent `(namespace, key) -> entry` store with per-document
/// embeddings. Search is brute-force nearest-neighbor over the namespace,
/// which is fine at the store's expected scale (thousands of entries).
pub struct VectorStore {
    conn: Mutex<Connection>,
    llm: Arc<dyn LlmClient>,
    path: PathBuf,
}

impl VectorStore {
    pub fn open(dir: &Path, llm: Arc<dyn LlmClient>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("memories.sqlite");
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(INIT_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            llm,
            path,
        })
    }

    /// Upsert one entry. The document is embedded with a single `embed`
    /// call; the provider may not support batching, so there is no
    /// multi-document variant.
    pub fn put(&self, namespace: &[String], key: &str, value: &MemoryValue) -> Result<()> {
        let content = if value.content.is_empty() {
            serde_json::to_string(value)?
        } else {
            value.content.clone()
        };
        let embedding = self.llm.embed(&content)?;

        let conn = self.conn.lock().expect("memory lock");
        conn.execute(
            "INSERT OR REPLACE INTO memories
             (namespace, key, content, embedding, timestamp, context,
              plan_context, reflection, metadata, schema_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                namespace_key(namespace)?,
                key,
                content,
                embedding_to_blob(&embedding),
                Utc::now().to_rfc3339(),
                value.context,
                value
                    .plan_context
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                value.reflection,
                serde_json::to_string(&value.metadata)?,
                MEMORY_SCHEMA_VERSION,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, namespace: &[String], key: &str) -> Result<Option<MemoryEntry>> {
        let conn = self.conn.lock().expect("memory lock");
        let mut stmt = conn.prepare(
            "SELECT namespace, key, content, timestamp, context, plan_context,
                    reflection, metadata, schema_version
             FROM memories WHERE namespace = ?1 AND key = ?2",
        )?;
        let mut rows = stmt.query(params![namespace_key(namespace)?, key])?;
        match rows.next()? {
            Some(row) => Ok(row_to_entry(row)?),
            None => Ok(None),
        }
    }

    /// Nearest-neighbor search within a namespace, ordered by ascending
    /// distance. No re-ranking.
    pub fn search(&self, namespace: &[String], query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let query_embedding = self.llm.embed(query)?;
        let conn = self.conn.lock().expect("memory lock");
        let mut stmt = conn.prepare(
            "SELECT namespace, key, content, timestamp, context, plan_context,
                    reflection, metadata, schema_version, embedding
             FROM memories WHERE namespace = ?1",
        )?;
        let mut rows = stmt.query([namespace_key(namespace)?])?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let Some(entry) = row_to_entry(row)? else {
                continue;
            };
            let blob: Vec<u8> = row.get(9)?;
            let embedding = blob_to_embedding(&blob);
            let distance = 1.0 - cosine_similarity(&query_embedding, &embedding);
            hits.push(MemoryHit { entry, distance });
        }
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn delete(&self, namespace: &[String], key: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("memory lock");
        let deleted = conn.execute(
            "DELETE FROM memories WHERE namespace = ?1 AND key = ?2",
            params![namespace_key(namespace)?, key],
        )?;
        Ok(deleted > 0)
    }

    pub fn list(&self, namespace: &[String], limit: usize) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn.lock().expect("memory lock");
        let mut stmt = conn.prepare(
            "SELECT namespace, key, content, timestamp, context, plan_context,
                    reflection, metadata, schema_version
             FROM memories WHERE namespace = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![namespace_key(namespace)?, limit as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(entry) = row_to_entry(row)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let conn = self.conn.lock().expect("memory lock");
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        Ok(MemoryStats {
            total_entries: total as u64,
            path: self.path.clone(),
        })
    }
}

/// Canonical stored form of a namespace tuple: a JSON array. Unambiguous
/// for components containing any separator character.
fn namespace_key(namespace: &[String]) -> Result<String> {
    Ok(serde_json::to_string(namespace)?)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<Option<MemoryEntry>> {
    let schema_version: i64 = row.get(8)?;
    if schema_version > MEMORY_SCHEMA_VERSION {
        return Ok(None);
    }
    let namespace: String = row.get(0)?;
    let plan_context: Option<String> = row.get(5)?;
    let metadata: String = row.get(7)?;
    Ok(Some(MemoryEntry {
        namespace: serde_json::from_str(&namespace)?,
        key: row.get(1)?,
        content: row.get(2)?,
        timestamp: row.get(3)?,
        context: row.get(4)?,
        plan_context: plan_context
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        reflection: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    }))
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikoma_testkit::MockLlm;

    fn scratch_store() -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::open(dir.path(), Arc::new(MockLlm::new())).expect("open");
        (dir, store)
    }

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn put_then_get_round_trips_content() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["memories", "default"]);
        store
            .put(
                &namespace,
                "fact-1",
                &MemoryValue::text("The user prefers concise answers", "conversation"),
            )
            .expect("put");

        let entry = store
            .get(&namespace, "fact-1")
            .expect("get")
            .expect("present");
        assert_eq!(entry.content, "The user prefers concise answers");
        assert_eq!(entry.context, "conversation");
    }

    #[test]
    fn put_is_an_upsert() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["memories", "default"]);
        store
            .put(&namespace, "k", &MemoryValue::text("old", "conversation"))
            .expect("put");
        store
            .put(&namespace, "k", &MemoryValue::text("new", "conversation"))
            .expect("put");
        let entry = store.get(&namespace, "k").expect("get").expect("present");
        assert_eq!(entry.content, "new");
        assert_eq!(store.stats().expect("stats").total_entries, 1);
    }

    #[test]
    fn search_orders_by_ascending_distance() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["memories", "default"]);
        store
            .put(&namespace, "a", &MemoryValue::text("rust borrow checker", "c"))
            .expect("put");
        store
            .put(&namespace, "b", &MemoryValue::text("gardening tips for spring", "c"))
            .expect("put");
        store
            .put(&namespace, "c", &MemoryValue::text("rust borrow checker", "c"))
            .expect("put");

        let hits = store
            .search(&namespace, "rust borrow checker", 3)
            .expect("search");
        assert_eq!(hits.len(), 3);
        assert!(hits[0].distance <= hits[1].distance);
        assert!(hits[1].distance <= hits[2].distance);
        // Exact-content matches sit at distance ~0.
        assert!(hits[0].distance.abs() < 1e-5);
        assert_eq!(hits[0].entry.content, "rust borrow checker");
    }

    #[test]
    fn hyphenated_namespace_components_round_trip_intact() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["web-content", "default-user"]);
        store
            .put(&namespace, "chunk-0", &MemoryValue::text("hyphen heavy", "c"))
            .expect("put");

        let entry = store
            .get(&namespace, "chunk-0")
            .expect("get")
            .expect("present");
        assert_eq!(entry.namespace, namespace);
        assert_eq!(entry.key, "chunk-0");

        let listed = store.list(&namespace, 10).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].namespace, namespace);
        // The joined spelling is not the same namespace.
        assert!(
            store
                .get(&ns(&["web", "content", "default", "user"]), "chunk-0")
                .expect("get")
                .is_none()
        );
    }

    #[test]
    fn namespace_and_key_pairs_never_collide() {
        let (_dir, store) = scratch_store();
        // Both pairs would flatten to "a-b-c" under a naive join.
        store
            .put(&ns(&["a", "b"]), "c", &MemoryValue::text("first", "c"))
            .expect("put");
        store
            .put(&ns(&["a"]), "b-c", &MemoryValue::text("second", "c"))
            .expect("put");

        assert_eq!(store.stats().expect("stats").total_entries, 2);
        let first = store.get(&ns(&["a", "b"]), "c").expect("get").expect("first");
        let second = store.get(&ns(&["a"]), "b-c").expect("get").expect("second");
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
    }

    #[test]
    fn search_is_scoped_to_the_namespace() {
        let (_dir, store) = scratch_store();
        store
            .put(
                &ns(&["memories", "alice"]),
                "k",
                &MemoryValue::text("alice memory", "c"),
            )
            .expect("put");
        let hits = store
            .search(&ns(&["memories", "bob"]), "alice memory", 5)
            .expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_removes_the_entry() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["memories", "default"]);
        store
            .put(&namespace, "k", &MemoryValue::text("short lived", "c"))
            .expect("put");
        assert!(store.delete(&namespace, "k").expect("delete"));
        assert!(!store.delete(&namespace, "k").expect("second delete"));
        assert!(store.get(&namespace, "k").expect("get").is_none());
    }

    #[test]
    fn entries_with_newer_schema_versions_are_ignored() {
        let (_dir, store) = scratch_store();
        let namespace = ns(&["memories", "default"]);
        store
            .put(&namespace, "k", &MemoryValue::text("visible", "c"))
            .expect("put");
        {
            let conn = store.conn.lock().expect("lock");
            conn.execute(
                "UPDATE memories SET schema_version = ?1 WHERE key = 'k'",
                [MEMORY_SCHEMA_VERSION + 1],
            )
            .expect("bump version");
        }
        assert!(store.get(&namespace, "k").expect("get").is_none());
        assert!(store.list(&namespace, 10).expect("list").is_empty());
    }
}
