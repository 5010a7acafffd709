//! The seam between this crate and the document store client library.
//!
//! The wire client is an external collaborator; the traits here list the
//! operations the master and the slaves actually need. [`MemoryStore`]
//! implements both traits in memory and records admin commands, which is
//! what the test suites and offline harnesses run against.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use super::error::StoreError;
use super::sink::OccurrenceDoc;

/// Process-wide counter making OIDs unique within one second.
static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A 12-byte document id: unix seconds, process id, insertion counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid([u8; 12]);

impl Oid {
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let pid = std::process::id();
        let count = OID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..8].copy_from_slice(&pid.to_be_bytes());
        bytes[8..].copy_from_slice(&count.to_be_bytes());
        Self(bytes)
    }
}

impl Default for Oid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for Oid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How a collection should be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Non-zero makes the collection capped at this many bytes.
    pub capped_size: i64,
    /// Uncapped buffer collections skip the default `_id` index.
    pub auto_index_id: bool,
}

/// Control-plane operations the master issues against a database.
///
/// Namespaces are `database.collection` strings. Filters are documents
/// matched field by field; dotted paths address nested fields and array
/// elements (`data.0.status`).
pub trait DocumentStore: Send + Sync {
    fn insert(&self, ns: &str, doc: Value) -> Result<(), StoreError>;

    /// First matching document, optionally the one with the largest value of
    /// `sort_desc` among the matches.
    fn find_one(
        &self,
        ns: &str,
        filter: &Value,
        sort_desc: Option<&str>,
    ) -> Result<Option<Value>, StoreError>;

    fn count(&self, ns: &str) -> Result<u64, StoreError>;

    /// Delete matching documents, returning how many went away.
    fn remove(&self, ns: &str, filter: &Value) -> Result<u64, StoreError>;

    fn drop_collection(&self, ns: &str) -> Result<(), StoreError>;

    /// Find-and-modify: apply `set` (a document of dotted path -> value) to
    /// the first match. Returns whether a document matched.
    fn update_one(&self, ns: &str, filter: &Value, set: &Value) -> Result<bool, StoreError>;

    // Provisioning commands, admin-side.
    fn create_collection(&self, ns: &str, spec: &CollectionSpec) -> Result<(), StoreError>;
    fn create_index(&self, ns: &str, fields: &[String], background: bool)
        -> Result<(), StoreError>;
    fn enable_sharding(&self, ns: &str, key: &str) -> Result<(), StoreError>;
    fn set_balancer(&self, stopped: bool) -> Result<(), StoreError>;
    fn split_chunk(&self, ns: &str, module: i32) -> Result<(), StoreError>;
    fn move_chunk(&self, ns: &str, module: i32, shard: &str) -> Result<(), StoreError>;
}

/// Data-plane operations the slave sinks need.
pub trait BufferStore: Send + Sync {
    /// Hand out a stable id used to tag inserts from one processor.
    fn register_processor(&self) -> i32;

    /// Bulk-insert one batch. At-most-once within this call.
    fn insert_batch(
        &self,
        ns: &str,
        docs: Vec<OccurrenceDoc>,
        processor_id: i32,
    ) -> Result<(), StoreError>;
}

/// Opens store connections by address. The master owns one of these and
/// hands clones to the rolling-collection workers.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn DocumentStore>, StoreError>;
    fn connect_buffer(&self, address: &str) -> Result<Arc<dyn BufferStore>, StoreError>;
}

/// Admin command recorded by [`MemoryStore`], in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminOp {
    CreateCollection { ns: String, spec: CollectionSpec },
    CreateIndex { ns: String, fields: Vec<String>, background: bool },
    EnableSharding { ns: String, key: String },
    SetBalancer { stopped: bool },
    SplitChunk { ns: String, module: i32 },
    MoveChunk { ns: String, module: i32, shard: String },
}

#[derive(Default)]
struct MemoryStoreInner {
    collections: BTreeMap<String, Vec<Value>>,
    data: BTreeMap<String, Vec<OccurrenceDoc>>,
    /// (namespace, batch size) per data-plane insert, in arrival order.
    batch_log: Vec<(String, usize)>,
    admin_ops: Vec<AdminOp>,
    failing: bool,
    /// Data-plane inserts fail once this many batches have been accepted.
    fail_inserts_after: Option<usize>,
}

/// In-memory store used by the tests and offline harnesses.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    next_processor: AtomicI32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent operation fail, for exercising error paths.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().expect("store poisoned").failing = failing;
    }

    /// Accept `accepted` data batches, then fail every further insert.
    pub fn set_fail_inserts_after(&self, accepted: usize) {
        self.inner.lock().expect("store poisoned").fail_inserts_after = Some(accepted);
    }

    pub fn documents(&self, ns: &str) -> Vec<Value> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.collections.get(ns).cloned().unwrap_or_default()
    }

    pub fn data_batches(&self, ns: &str) -> Vec<OccurrenceDoc> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.data.get(ns).cloned().unwrap_or_default()
    }

    /// Namespaces that received data-plane inserts.
    pub fn data_namespaces(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.data.keys().cloned().collect()
    }

    pub fn admin_ops(&self) -> Vec<AdminOp> {
        self.inner.lock().expect("store poisoned").admin_ops.clone()
    }

    /// Size of every data-plane batch received, oldest first.
    pub fn batch_log(&self) -> Vec<(String, usize)> {
        self.inner.lock().expect("store poisoned").batch_log.clone()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, MemoryStoreInner>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Failed("store poisoned".into()))?;
        if inner.failing {
            return Err(StoreError::Unavailable("memory store set failing".into()));
        }
        Ok(inner)
    }
}

/// Follow a dotted path (`data.0.status`) through objects and arrays.
fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Value, path: &str, new_value: Value) {
    let mut current = doc;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let last = i == parts.len() - 1;
        match current {
            Value::Object(map) => {
                if last {
                    map.insert((*part).to_string(), new_value);
                    return;
                }
                current = map
                    .entry((*part).to_string())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            Value::Array(items) => {
                let Ok(index) = part.parse::<usize>() else {
                    return;
                };
                let Some(slot) = items.get_mut(index) else {
                    return;
                };
                if last {
                    *slot = new_value;
                    return;
                }
                current = slot;
            }
            _ => return,
        }
    }
}

/// Field-by-field filter match; `{"$exists": true}` asserts path presence.
fn matches(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };
    for (path, expected) in conditions {
        let found = lookup_path(doc, path);
        if let Some(exists) = expected.get("$exists").and_then(Value::as_bool) {
            if found.is_some() != exists {
                return false;
            }
            continue;
        }
        if found != Some(expected) {
            return false;
        }
    }
    true
}

impl DocumentStore for MemoryStore {
    fn insert(&self, ns: &str, doc: Value) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.collections.entry(ns.to_string()).or_default().push(doc);
        Ok(())
    }

    fn find_one(
        &self,
        ns: &str,
        filter: &Value,
        sort_desc: Option<&str>,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.guard()?;
        let Some(docs) = inner.collections.get(ns) else {
            return Ok(None);
        };
        let mut hits = docs.iter().filter(|doc| matches(doc, filter));
        match sort_desc {
            None => Ok(hits.next().cloned()),
            Some(field) => Ok(hits
                .max_by_key(|doc| {
                    lookup_path(doc, field)
                        .and_then(Value::as_i64)
                        .unwrap_or(i64::MIN)
                })
                .cloned()),
        }
    }

    fn count(&self, ns: &str) -> Result<u64, StoreError> {
        let inner = self.guard()?;
        Ok(inner.collections.get(ns).map_or(0, |docs| docs.len() as u64))
    }

    fn remove(&self, ns: &str, filter: &Value) -> Result<u64, StoreError> {
        let mut inner = self.guard()?;
        let Some(docs) = inner.collections.get_mut(ns) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|doc| !matches(doc, filter));
        Ok((before - docs.len()) as u64)
    }

    fn drop_collection(&self, ns: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.collections.remove(ns);
        Ok(())
    }

    fn update_one(&self, ns: &str, filter: &Value, set: &Value) -> Result<bool, StoreError> {
        let mut inner = self.guard()?;
        let Some(docs) = inner.collections.get_mut(ns) else {
            return Ok(false);
        };
        for doc in docs.iter_mut() {
            if matches(doc, filter) {
                if let Some(changes) = set.as_object() {
                    for (path, value) in changes {
                        set_path(doc, path, value.clone());
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn create_collection(&self, ns: &str, spec: &CollectionSpec) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.collections.entry(ns.to_string()).or_default();
        inner.admin_ops.push(AdminOp::CreateCollection {
            ns: ns.to_string(),
            spec: spec.clone(),
        });
        Ok(())
    }

    fn create_index(
        &self,
        ns: &str,
        fields: &[String],
        background: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.admin_ops.push(AdminOp::CreateIndex {
            ns: ns.to_string(),
            fields: fields.to_vec(),
            background,
        });
        Ok(())
    }

    fn enable_sharding(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.admin_ops.push(AdminOp::EnableSharding {
            ns: ns.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    fn set_balancer(&self, stopped: bool) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.admin_ops.push(AdminOp::SetBalancer { stopped });
        Ok(())
    }

    fn split_chunk(&self, ns: &str, module: i32) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.admin_ops.push(AdminOp::SplitChunk {
            ns: ns.to_string(),
            module,
        });
        Ok(())
    }

    fn move_chunk(&self, ns: &str, module: i32, shard: &str) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        inner.admin_ops.push(AdminOp::MoveChunk {
            ns: ns.to_string(),
            module,
            shard: shard.to_string(),
        });
        Ok(())
    }
}

impl BufferStore for MemoryStore {
    fn register_processor(&self) -> i32 {
        self.next_processor.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_batch(
        &self,
        ns: &str,
        docs: Vec<OccurrenceDoc>,
        _processor_id: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if let Some(limit) = inner.fail_inserts_after {
            if inner.batch_log.len() >= limit {
                return Err(StoreError::Failed("insert rejected by test hook".into()));
            }
        }
        inner.batch_log.push((ns.to_string(), docs.len()));
        inner.data.entry(ns.to_string()).or_default().extend(docs);
        Ok(())
    }
}

/// Connector returning the same shared [`MemoryStore`] for every address.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, _address: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let inner = self.store.inner.lock();
        if matches!(inner, Ok(guard) if guard.failing) {
            return Err(StoreError::Unavailable("memory store set failing".into()));
        }
        Ok(self.store.clone())
    }

    fn connect_buffer(&self, _address: &str) -> Result<Arc<dyn BufferStore>, StoreError> {
        let inner = self.store.inner.lock();
        if matches!(inner, Ok(guard) if guard.failing) {
            return Err(StoreError::Unavailable("memory store set failing".into()));
        }
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oids_are_distinct_and_hex() {
        let a = Oid::new();
        let b = Oid::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 24);
        assert!(a.to_string().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn find_one_with_descending_sort_picks_the_max() {
        let store = MemoryStore::new();
        for number in [3, 7, 5] {
            store
                .insert("run.runs", json!({"detector": "tpc", "number": number}))
                .unwrap();
        }
        store
            .insert("run.runs", json!({"detector": "muon_veto", "number": 99}))
            .unwrap();
        let doc = store
            .find_one("run.runs", &json!({"detector": "tpc"}), Some("number"))
            .unwrap()
            .unwrap();
        assert_eq!(doc["number"], json!(7));
    }

    #[test]
    fn dotted_paths_match_and_update_array_elements() {
        let store = MemoryStore::new();
        store
            .insert(
                "run.runs",
                json!({"_id": "a", "data": [{"status": "transferring"}]}),
            )
            .unwrap();
        // data.0 exists on this doc, so the update matches.
        let hit = store
            .update_one(
                "run.runs",
                &json!({"_id": "a", "data.0": {"$exists": true}}),
                &json!({"data.0.status": "transferred"}),
            )
            .unwrap();
        assert!(hit);
        let doc = store.find_one("run.runs", &json!({}), None).unwrap().unwrap();
        assert_eq!(doc["data"][0]["status"], json!("transferred"));
        // A doc without data.0 does not match an $exists filter.
        let miss = store
            .update_one(
                "run.runs",
                &json!({"_id": "b", "data.0": {"$exists": true}}),
                &json!({"data.0.status": "transferred"}),
            )
            .unwrap();
        assert!(!miss);
    }

    #[test]
    fn failing_store_surfaces_unavailable() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.insert("ns", json!({})),
            Err(StoreError::Unavailable(_))
        ));
    }
}
