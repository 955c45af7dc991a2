//! In-process vector index with on-disk persistence.
//!
//! One [`redb`] database file per collection under the persist
//! directory. Records are keyed by `note_id`; queries are an exact
//! scan with the collection's distance metric (no approximate index —
//! corpora here are personal-knowledge sized). Mutation goes through
//! the blocking pool; reads are thread-safe.
//!
//! Opening a collection runs a verification pass: the persist
//! directory must be writable and a canary record must round-trip.
//! Failures surface as [`VectorError::Verification`] so startup can
//! distinguish "vector store broken" from ordinary I/O trouble.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Record table: `note_id (str) → serde_json(VectorRecord)`.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
/// Collection metadata: `key (str) → value (str)`.
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const CANARY_KEY: &str = "__canary__";

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("vector store verification failed: {0}")]
    Verification(String),
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
    #[error("collection {name} was created with metric {stored}, requested {requested}")]
    MetricMismatch {
        name: String,
        stored: String,
        requested: String,
    },
    #[error("vector storage failure: {0}")]
    Storage(String),
}

impl From<redb::Error> for VectorError {
    fn from(err: redb::Error) -> Self {
        VectorError::Storage(err.to_string())
    }
}

macro_rules! impl_storage_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for VectorError {
            fn from(err: $ty) -> Self {
                VectorError::Storage(err.to_string())
            }
        })*
    };
}

impl_storage_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    serde_json::Error,
    std::io::Error
);

/// Distance metric fixed at collection creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
    Euclidean,
}

impl DistanceMetric {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Dot => "dot",
            Self::Euclidean => "euclidean",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "cosine" => Some(Self::Cosine),
            "dot" => Some(Self::Dot),
            "euclidean" => Some(Self::Euclidean),
            _ => None,
        }
    }

    /// Lower is closer for every metric (dot product is negated).
    fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::Dot => -dot(a, b),
            Self::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mag_a = dot(a, a).sqrt();
    let mag_b = dot(b, b).sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub note_id: String,
    pub vector: Vec<f32>,
    /// Hash of the exact text that was embedded; the sync coordinator
    /// uses it to skip no-op re-upserts.
    pub content_hash: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub note_id: String,
    pub distance: f32,
    pub content_hash: String,
    pub metadata: BTreeMap<String, String>,
}

/// Handle to one open collection. Clones share the database.
#[derive(Clone)]
pub struct VectorStore {
    db: Arc<Database>,
    name: String,
    metric: DistanceMetric,
    dimension: usize,
    path: PathBuf,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("name", &self.name)
            .field("metric", &self.metric)
            .field("dimension", &self.dimension)
            .field("path", &self.path)
            .finish()
    }
}

impl VectorStore {
    /// Create or open the collection `name` under `dir`, then run the
    /// startup verification pass.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        metric: DistanceMetric,
        dimension: usize,
    ) -> Result<Self, VectorError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| VectorError::Verification(format!("persist dir not creatable: {e}")))?;

        let path = dir.join(format!("{name}.redb"));
        let db = match Database::create(&path) {
            Ok(db) => db,
            Err(redb::DatabaseError::Storage(redb::StorageError::Corrupted(detail))) => {
                // A corrupt collection is rebuilt from the relational
                // store by the next reconciliation, so recreate it.
                warn!(path = %path.display(), detail, "vector collection corrupt, recreating");
                std::fs::remove_file(&path)?;
                Database::create(&path)?
            }
            Err(err) => return Err(err.into()),
        };

        let store = Self {
            db: Arc::new(db),
            name: name.to_string(),
            metric,
            dimension,
            path,
        };
        store.init_meta()?;
        store.verify()?;
        info!(
            collection = name,
            metric = metric.as_str(),
            dimension,
            records = store.len_blocking()?,
            "vector collection opened"
        );
        Ok(store)
    }

    fn init_meta(&self) -> Result<(), VectorError> {
        let tx = self.db.begin_write()?;
        {
            let mut meta = tx.open_table(META)?;
            let stored_metric = meta.get("metric")?.map(|v| v.value().to_string());
            match stored_metric {
                Some(stored) => {
                    if DistanceMetric::parse(&stored) != Some(self.metric) {
                        return Err(VectorError::MetricMismatch {
                            name: self.name.clone(),
                            stored,
                            requested: self.metric.as_str().to_string(),
                        });
                    }
                }
                None => {
                    meta.insert("metric", self.metric.as_str())?;
                    meta.insert("dimension", self.dimension.to_string().as_str())?;
                }
            }
            tx.open_table(RECORDS)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Startup self-test: writable persist dir, canary record
    /// round-trips, canary removal leaves no residue.
    pub fn verify(&self) -> Result<(), VectorError> {
        let probe = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".write-probe");
        std::fs::write(&probe, b"ok")
            .map_err(|e| VectorError::Verification(format!("persist dir not writable: {e}")))?;
        std::fs::remove_file(&probe)
            .map_err(|e| VectorError::Verification(format!("probe cleanup failed: {e}")))?;

        let canary = VectorRecord {
            note_id: CANARY_KEY.to_string(),
            vector: vec![0.0; self.dimension],
            content_hash: "canary".to_string(),
            metadata: BTreeMap::new(),
        };
        self.upsert_blocking(&canary)
            .map_err(|e| VectorError::Verification(format!("canary write failed: {e}")))?;
        let read_back = self
            .get_blocking(CANARY_KEY)
            .map_err(|e| VectorError::Verification(format!("canary read failed: {e}")))?;
        if read_back.as_ref() != Some(&canary) {
            return Err(VectorError::Verification(
                "canary record did not round-trip".to_string(),
            ));
        }
        let removed = self
            .delete_blocking(CANARY_KEY)
            .map_err(|e| VectorError::Verification(format!("canary delete failed: {e}")))?;
        if !removed {
            return Err(VectorError::Verification("canary delete was a no-op".to_string()));
        }
        debug!(collection = %self.name, "vector store verification passed");
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    // ── Async API (blocking pool) ─────────────────────────────────────────────

    pub async fn upsert(&self, record: VectorRecord) -> Result<(), VectorError> {
        let store = self.clone();
        run_blocking(move || store.upsert_blocking(&record)).await
    }

    pub async fn delete(&self, note_id: &str) -> Result<bool, VectorError> {
        let store = self.clone();
        let note_id = note_id.to_string();
        run_blocking(move || store.delete_blocking(&note_id)).await
    }

    pub async fn get(&self, note_id: &str) -> Result<Option<VectorRecord>, VectorError> {
        let store = self.clone();
        let note_id = note_id.to_string();
        run_blocking(move || store.get_blocking(&note_id)).await
    }

    pub async fn query(&self, vector: Vec<f32>, k: usize) -> Result<Vec<VectorHit>, VectorError> {
        let store = self.clone();
        run_blocking(move || store.query_blocking(&vector, k)).await
    }

    pub async fn len(&self) -> Result<usize, VectorError> {
        let store = self.clone();
        run_blocking(move || store.len_blocking()).await
    }

    /// All note ids currently in the collection (reconciliation scan).
    pub async fn note_ids(&self) -> Result<Vec<String>, VectorError> {
        let store = self.clone();
        run_blocking(move || store.note_ids_blocking()).await
    }

    // ── Blocking core ─────────────────────────────────────────────────────────

    pub fn upsert_blocking(&self, record: &VectorRecord) -> Result<(), VectorError> {
        if record.vector.len() != self.dimension {
            return Err(VectorError::Dimension {
                expected: self.dimension,
                got: record.vector.len(),
            });
        }
        let bytes = serde_json::to_vec(record)?;
        let tx = self.db.begin_write()?;
        {
            let mut records = tx.open_table(RECORDS)?;
            records.insert(record.note_id.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_blocking(&self, note_id: &str) -> Result<bool, VectorError> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut records = tx.open_table(RECORDS)?;
            records.remove(note_id)?.is_some()
        };
        tx.commit()?;
        Ok(removed)
    }

    pub fn get_blocking(&self, note_id: &str) -> Result<Option<VectorRecord>, VectorError> {
        let tx = self.db.begin_read()?;
        let records = tx.open_table(RECORDS)?;
        match records.get(note_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Exact top-k scan. Ordering is by distance ascending, then
    /// `note_id` ascending, so equal-distance results are stable.
    pub fn query_blocking(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>, VectorError> {
        if vector.len() != self.dimension {
            return Err(VectorError::Dimension {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let tx = self.db.begin_read()?;
        let records = tx.open_table(RECORDS)?;
        let mut hits = Vec::new();
        for row in records.iter()? {
            let (_, value) = row?;
            let record: VectorRecord = serde_json::from_slice(value.value())?;
            let distance = self.metric.distance(vector, &record.vector);
            hits.push(VectorHit {
                note_id: record.note_id,
                distance,
                content_hash: record.content_hash,
                metadata: record.metadata,
            });
        }
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.note_id.cmp(&b.note_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn len_blocking(&self) -> Result<usize, VectorError> {
        let tx = self.db.begin_read()?;
        let records = tx.open_table(RECORDS)?;
        Ok(records.len()? as usize)
    }

    fn note_ids_blocking(&self) -> Result<Vec<String>, VectorError> {
        let tx = self.db.begin_read()?;
        let records = tx.open_table(RECORDS)?;
        let mut ids = Vec::new();
        for row in records.iter()? {
            let (key, _) = row?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, VectorError>
where
    F: FnOnce() -> Result<T, VectorError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| VectorError::Storage(format!("blocking task failed: {err}")))?
}

// ── Tests ─────────────────────────────────────────────────────────────────────
