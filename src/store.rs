//! File-backed task store
//!
//! The persistence substrate under the persistence engine. Records are
//! JSON envelopes `{version, payload, hash}` where the hash is SHA-256
//! over the canonical encoding of the payload (objects recursively
//! key-sorted). A mismatched hash on load raises an integrity error; the
//! persistence engine converts that into a checkpoint restore.
//!
//! ## Layout
//!
//! ```text
//! {root}/tasks/{id}.json
//! {root}/queues/{queue_id}.json
//! {root}/sessions/{session_id}.json
//! {root}/checkpoints/{checkpoint_id}.json
//! {root}/.lock
//! ```
//!
//! Writes go through a temp-file-and-rename so a crash never leaves a
//! half-written record. Transactions stage writes in memory and apply
//! them on commit; two transactions staging the same record conflict
//! with a retryable busy error. When async writes are enabled, plain
//! saves land in a bounded buffer flushed by size threshold or by the
//! engine's flush timer; a failed flush marks the buffer dirty and
//! rejects further saves until a flush succeeds.

use crate::config::PerformanceConfig;
use crate::types::{FabricError, FabricResult, Task};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Record envelope version written by this store
const ENVELOPE_VERSION: u32 = 1;

/// Gzip magic bytes, used to sniff compressed records on load
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The four record namespaces of the on-disk layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Task,
    Queue,
    Session,
    Checkpoint,
}

impl RecordKind {
    fn dir(&self) -> &'static str {
        match self {
            RecordKind::Task => "tasks",
            RecordKind::Queue => "queues",
            RecordKind::Session => "sessions",
            RecordKind::Checkpoint => "checkpoints",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    payload: Value,
    hash: String,
}

#[derive(Debug, Clone)]
struct StagedWrite {
    kind: RecordKind,
    id: String,
    payload: Value,
}

#[derive(Debug, Default)]
struct ReadCache {
    map: HashMap<String, Task>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReadCache {
    fn insert(&mut self, id: String, task: Task) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(id.clone(), task).is_none() {
            self.order.push_back(id);
        }
        while self.map.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }
}

#[derive(Debug, Default)]
struct WriteBuffer {
    entries: Vec<StagedWrite>,
    dirty: bool,
}

/// Serialize a value into its canonical form: objects key-sorted at
/// every depth, arrays in order, scalars as compact JSON
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string rendering handles escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-256 hex digest of the canonical encoding of `payload`
pub fn content_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// File-backed record store with integrity hashing
pub struct FileTaskStore {
    root: PathBuf,
    compression: bool,
    perf: PerformanceConfig,
    cache: Mutex<ReadCache>,
    transactions: Mutex<HashMap<Uuid, Vec<StagedWrite>>>,
    buffer: Mutex<WriteBuffer>,
}

impl FileTaskStore {
    /// Open (creating directories as needed) and take the advisory lock
    pub async fn open(
        root: impl Into<PathBuf>,
        compression: bool,
        perf: PerformanceConfig,
    ) -> FabricResult<Self> {
        let root = root.into();
        for kind in [
            RecordKind::Task,
            RecordKind::Queue,
            RecordKind::Session,
            RecordKind::Checkpoint,
        ] {
            tokio::fs::create_dir_all(root.join(kind.dir())).await?;
        }

        let lock_path = root.join(".lock");
        if tokio::fs::try_exists(&lock_path).await.unwrap_or(false) {
            let previous = tokio::fs::read_to_string(&lock_path)
                .await
                .unwrap_or_default();
            warn!(
                path = %lock_path.display(),
                previous = previous.trim(),
                "stale advisory lock found, taking over"
            );
        }
        tokio::fs::write(&lock_path, format!("{}\n", std::process::id())).await?;

        let cache_capacity = perf.cache_size;
        Ok(Self {
            root,
            compression,
            perf,
            cache: Mutex::new(ReadCache {
                capacity: cache_capacity,
                ..Default::default()
            }),
            transactions: Mutex::new(HashMap::new()),
            buffer: Mutex::new(WriteBuffer::default()),
        })
    }

    /// Remove the advisory lock; called on clean shutdown
    pub async fn release_lock(&self) -> FabricResult<()> {
        let lock_path = self.root.join(".lock");
        match tokio::fs::remove_file(&lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.root.join(kind.dir()).join(format!("{id}.json"))
    }

    /// Write one record envelope atomically (temp file + rename)
    pub async fn write_record(&self, kind: RecordKind, id: &str, payload: Value) -> FabricResult<()> {
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            hash: content_hash(&payload),
            payload,
        };
        let mut bytes = serde_json::to_vec(&envelope)?;
        if self.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes)?;
            bytes = encoder.finish()?;
        }

        let path = self.record_path(kind, id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(?kind, id, bytes = bytes.len(), "record written");
        Ok(())
    }

    /// Read and verify one record, returning its payload
    pub async fn read_record(&self, kind: RecordKind, id: &str) -> FabricResult<Value> {
        let path = self.record_path(kind, id);
        let mut bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FabricError::NotFound(format!("{}/{id}", kind.dir())));
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            bytes = out;
        }

        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(FabricError::Internal(format!(
                "unsupported record version {}",
                envelope.version
            )));
        }
        let actual = content_hash(&envelope.payload);
        if actual != envelope.hash {
            return Err(FabricError::Integrity {
                record: format!("{}/{id}", kind.dir()),
                expected: envelope.hash,
                actual,
            });
        }
        Ok(envelope.payload)
    }

    /// Delete one record; missing files are not an error
    pub async fn delete_record(&self, kind: RecordKind, id: &str) -> FabricResult<()> {
        if kind == RecordKind::Task {
            let mut cache = self.cache.lock().await;
            cache.map.remove(id);
        }
        match tokio::fs::remove_file(self.record_path(kind, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all records of a kind (directory scan)
    pub async fn list_ids(&self, kind: RecordKind) -> FabricResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(kind.dir())).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Persist a task, optionally inside a transaction.
    ///
    /// Outside a transaction this is write-through unless async writes
    /// are enabled, in which case the record lands in the write buffer.
    pub async fn save(&self, task: &Task, tx: Option<Uuid>) -> FabricResult<()> {
        let id = task.id.to_string();
        let payload = serde_json::to_value(task)?;

        if let Some(tx_id) = tx {
            // Not cached until commit; a rollback must leave no trace.
            return self.stage(tx_id, RecordKind::Task, id, payload).await;
        }

        if self.perf.async_writes {
            let flush_now = {
                let mut buffer = self.buffer.lock().await;
                if buffer.dirty {
                    return Err(FabricError::Internal(
                        "write buffer dirty; flush must succeed before further saves".into(),
                    ));
                }
                buffer.entries.push(StagedWrite {
                    kind: RecordKind::Task,
                    id: id.clone(),
                    payload,
                });
                buffer.entries.len() >= self.perf.batch_size
            };
            let mut cache = self.cache.lock().await;
            cache.insert(id, task.clone());
            drop(cache);
            if flush_now {
                self.flush().await?;
            }
            return Ok(());
        }

        {
            let mut cache = self.cache.lock().await;
            cache.insert(id.clone(), task.clone());
        }
        self.write_record(RecordKind::Task, &id, payload).await
    }

    /// Load a task, optionally via the bounded read cache
    pub async fn load(&self, id: &str, use_cache: bool) -> FabricResult<Task> {
        if use_cache {
            let cache = self.cache.lock().await;
            if let Some(task) = cache.map.get(id) {
                return Ok(task.clone());
            }
        }
        let payload = self.read_record(RecordKind::Task, id).await?;
        let task: Task = serde_json::from_value(payload)?;
        if use_cache {
            let mut cache = self.cache.lock().await;
            cache.insert(id.to_string(), task.clone());
        }
        Ok(task)
    }

    /// Scan all task records, keeping those matching `filter`
    pub async fn enumerate<F>(&self, filter: F) -> FabricResult<Vec<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        let mut tasks = Vec::new();
        for id in self.list_ids(RecordKind::Task).await? {
            let task = self.load(&id, false).await?;
            if filter(&task) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Warm the read cache from disk (prefetch)
    pub async fn prefetch(&self) -> FabricResult<usize> {
        let ids = self.list_ids(RecordKind::Task).await?;
        let mut warmed = 0;
        for id in ids.iter().take(self.perf.cache_size) {
            if self.load(id, true).await.is_ok() {
                warmed += 1;
            }
        }
        Ok(warmed)
    }

    /// Begin a transaction and return its id
    pub async fn begin(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.transactions.lock().await.insert(id, Vec::new());
        id
    }

    /// Stage a write into an open transaction
    pub async fn stage(
        &self,
        tx: Uuid,
        kind: RecordKind,
        id: String,
        payload: Value,
    ) -> FabricResult<()> {
        let mut transactions = self.transactions.lock().await;
        // Staging the same record in two live transactions is a
        // retryable conflict.
        for (other_id, writes) in transactions.iter() {
            if *other_id != tx && writes.iter().any(|w| w.kind == kind && w.id == id) {
                return Err(FabricError::BusyTransaction(*other_id));
            }
        }
        let writes = transactions
            .get_mut(&tx)
            .ok_or_else(|| FabricError::NotFound(format!("transaction {tx}")))?;
        writes.retain(|w| !(w.kind == kind && w.id == id));
        writes.push(StagedWrite { kind, id, payload });
        Ok(())
    }

    /// Commit a transaction: force-flush the write buffer, then apply
    /// every staged write
    pub async fn commit(&self, tx: Uuid) -> FabricResult<()> {
        self.flush().await?;
        let writes = self
            .transactions
            .lock()
            .await
            .remove(&tx)
            .ok_or_else(|| FabricError::NotFound(format!("transaction {tx}")))?;
        for write in writes {
            self.write_record(write.kind, &write.id, write.payload)
                .await?;
        }
        Ok(())
    }

    /// Discard a transaction's staged writes
    pub async fn rollback(&self, tx: Uuid) -> FabricResult<()> {
        self.transactions
            .lock()
            .await
            .remove(&tx)
            .ok_or_else(|| FabricError::NotFound(format!("transaction {tx}")))?;
        Ok(())
    }

    /// Ids of transactions currently open
    pub async fn active_transactions(&self) -> Vec<Uuid> {
        self.transactions.lock().await.keys().copied().collect()
    }

    /// Drain the write buffer to disk.
    ///
    /// On failure the buffer keeps its entries and is marked dirty;
    /// saves are rejected until a later flush succeeds.
    pub async fn flush(&self) -> FabricResult<()> {
        let pending = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut buffer.entries)
        };
        if pending.is_empty() {
            let mut buffer = self.buffer.lock().await;
            buffer.dirty = false;
            return Ok(());
        }
        for (i, write) in pending.iter().enumerate() {
            if let Err(e) = self
                .write_record(write.kind, &write.id, write.payload.clone())
                .await
            {
                let mut buffer = self.buffer.lock().await;
                // Requeue the unwritten tail so nothing is lost.
                let mut remaining: Vec<StagedWrite> = pending[i..].to_vec();
                remaining.extend(std::mem::take(&mut buffer.entries));
                buffer.entries = remaining;
                buffer.dirty = true;
                warn!(error = %e, pending = buffer.entries.len(), "write buffer flush failed");
                return Err(e);
            }
        }
        let mut buffer = self.buffer.lock().await;
        buffer.dirty = false;
        Ok(())
    }
}
