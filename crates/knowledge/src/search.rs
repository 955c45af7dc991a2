//! Hybrid retrieval: Reciprocal Rank Fusion over the vector and
//! full-text leaf lists.
//!
//! `score(d) = Σ_L 1 / (rank_L(d) + c)` with `c = 60`, plus a fixed
//! presence bonus when a document appears in both lists. Ordering is
//! fully deterministic: equal scores break by presence-in-both, then
//! summed leaf rank, then `note_id`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use std::sync::Arc;
use tracing::debug;

use notevault_ai::EmbeddingAdapter;
use notevault_ai::embedding::normalize;
use notevault_store::Store;
use notevault_vector::VectorStore;

use crate::KnowledgeError;

pub const RRF_C: f64 = 60.0;
pub const PRESENCE_BONUS: f64 = 0.1;
/// Ceiling on the per-leaf candidate pool.
const K_MAX: usize = 50;
/// Leaf overlap below this widens the candidate pool once.
const MIN_OVERLAP_RATIO: f64 = 0.2;
const CACHE_SIZE: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(Self::Vector),
            "keyword" => Some(Self::Keyword),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub note_id: String,
    pub score: f64,
}

/// Fuse two ranked id lists. Ranks are zero-indexed; documents absent
/// from a list contribute nothing for it.
pub fn rrf_fuse(vector_ids: &[String], keyword_ids: &[String], k: usize) -> Vec<SearchHit> {
    #[derive(Default)]
    struct Entry {
        score: f64,
        lists: u8,
        rank_sum: usize,
    }

    let mut entries: HashMap<&str, Entry> = HashMap::new();
    for ids in [vector_ids, keyword_ids] {
        for (rank, id) in ids.iter().enumerate() {
            let entry = entries.entry(id.as_str()).or_default();
            entry.score += 1.0 / (rank as f64 + RRF_C);
            entry.lists += 1;
            entry.rank_sum += rank;
        }
    }

    let mut fused: Vec<(String, Entry)> = entries
        .into_iter()
        .map(|(id, mut entry)| {
            if entry.lists == 2 {
                entry.score += PRESENCE_BONUS;
            }
            (id.to_string(), entry)
        })
        .collect();

    fused.sort_by(|(a_id, a), (b_id, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.lists.cmp(&a.lists))
            .then_with(|| a.rank_sum.cmp(&b.rank_sum))
            .then_with(|| a_id.cmp(b_id))
    });

    fused
        .into_iter()
        .take(k)
        .map(|(note_id, entry)| SearchHit {
            note_id,
            score: entry.score,
        })
        .collect()
}

type CacheKey = (String, usize, &'static str, u64);

struct CachedResult {
    hits: Vec<SearchHit>,
    at: Instant,
}

pub struct HybridSearch {
    store: Store,
    vector: VectorStore,
    embedder: Arc<EmbeddingAdapter>,
    /// Bumped by any write that could change ranking; part of the
    /// cache key, so stale entries can never be served.
    epoch: AtomicU64,
    cache: Mutex<LruCache<CacheKey, CachedResult>>,
}

impl HybridSearch {
    pub fn new(store: Store, vector: VectorStore, embedder: Arc<EmbeddingAdapter>) -> Self {
        Self {
            store,
            vector,
            embedder,
            epoch: AtomicU64::new(0),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn corpus_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchHit>, KnowledgeError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let normalized = normalize(query).to_lowercase();
        let key: CacheKey = (normalized.clone(), k, mode.as_str(), self.corpus_epoch());
        {
            let mut cache = self.cache.lock().expect("search cache lock");
            if let Some(cached) = cache.get(&key) {
                if cached.at.elapsed() <= CACHE_TTL {
                    debug!(k, mode = mode.as_str(), "search served from cache");
                    return Ok(cached.hits.clone());
                }
            }
        }

        let k_leaf = (2 * k).min(K_MAX);
        let hits = match mode {
            SearchMode::Keyword => leaf_as_hits(&self.keyword_leaf(&normalized, k_leaf).await?),
            SearchMode::Vector => leaf_as_hits(&self.vector_leaf(&normalized, k_leaf).await?),
            SearchMode::Hybrid => {
                let mut vector_ids = self.vector_leaf(&normalized, k_leaf).await?;
                let mut keyword_ids = self.keyword_leaf(&normalized, k_leaf).await?;

                if !vector_ids.is_empty() && !keyword_ids.is_empty() {
                    let overlap = vector_ids
                        .iter()
                        .filter(|id| keyword_ids.contains(id))
                        .count();
                    let ratio =
                        overlap as f64 / vector_ids.len().min(keyword_ids.len()).max(1) as f64;
                    if ratio < MIN_OVERLAP_RATIO && k_leaf < K_MAX {
                        let wider = (4 * k).min(K_MAX);
                        debug!(ratio, wider, "low leaf overlap, widening candidate pool");
                        vector_ids = self.vector_leaf(&normalized, wider).await?;
                        keyword_ids = self.keyword_leaf(&normalized, wider).await?;
                    }
                }
                rrf_fuse(&vector_ids, &keyword_ids, k)
            }
        };

        let hits = self.retain_live(hits).await?;
        let hits: Vec<SearchHit> = hits.into_iter().take(k).collect();
        self.cache.lock().expect("search cache lock").put(
            key,
            CachedResult {
                hits: hits.clone(),
                at: Instant::now(),
            },
        );
        Ok(hits)
    }

    async fn keyword_leaf(&self, query: &str, k_leaf: usize) -> Result<Vec<String>, KnowledgeError> {
        let hits = self.store.search_keyword(query, k_leaf).await?;
        Ok(hits.into_iter().map(|hit| hit.note_id).collect())
    }

    async fn vector_leaf(&self, query: &str, k_leaf: usize) -> Result<Vec<String>, KnowledgeError> {
        let outcome = self.embedder.embed_one(query).await?;
        if outcome.degraded {
            // Budget frozen: keyword results still serve the query.
            return Ok(Vec::new());
        }
        let hits = self.vector.query(outcome.vector, k_leaf).await?;
        Ok(hits.into_iter().map(|hit| hit.note_id).collect())
    }

    /// Drop hits whose notes are gone or tombstoned (the vector index
    /// may briefly lag behind deletions).
    async fn retain_live(&self, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>, KnowledgeError> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let ids: Vec<String> = hits.iter().map(|hit| hit.note_id.clone()).collect();
        let live: Vec<String> = self
            .store
            .with_conn(move |conn| {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT note_id FROM notes
                     WHERE deleted_at IS NULL AND note_id IN ({placeholders})"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(notevault_store::rusqlite::params_from_iter(ids.iter()), |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(hits
            .into_iter()
            .filter(|hit| live.contains(&hit.note_id))
            .collect())
    }
}

fn leaf_as_hits(ids: &[String]) -> Vec<SearchHit> {
    ids.iter()
        .enumerate()
        .map(|(rank, note_id)| SearchHit {
            note_id: note_id.clone(),
            score: 1.0 / (rank as f64 + RRF_C),
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fusion_matches_the_worked_example() {
        // vector ranks [N2, N1, N4], keyword ranks [N1, N2, N5].
        let fused = rrf_fuse(&ids(&["N2", "N1", "N4"]), &ids(&["N1", "N2", "N5"]), 5);
        let order: Vec<&str> = fused.iter().map(|hit| hit.note_id.as_str()).collect();
        assert_eq!(order, vec!["N1", "N2", "N4", "N5"]);

        let expected_n1 = 1.0 / 61.0 + 1.0 / 60.0 + PRESENCE_BONUS;
        assert!((fused[0].score - expected_n1).abs() < 1e-12);
        // N1 and N2 tie on raw score; presence and rank sums tie too,
        // so the id decides.
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
        let expected_n4 = 1.0 / 62.0;
        assert!((fused[2].score - expected_n4).abs() < 1e-12);
    }

    #[test]
    fn fusion_is_deterministic_across_runs() {
        let vector = ids(&["a", "c", "b", "e"]);
        let keyword = ids(&["d", "b", "a"]);
        let first = rrf_fuse(&vector, &keyword, 10);
        for _ in 0..10 {
            assert_eq!(rrf_fuse(&vector, &keyword, 10), first);
        }
    }

    #[test]
    fn presence_in_both_lists_outranks_single_list_heads() {
        // "both" sits mid-list twice; "solo" leads one list. The
        // presence bonus dominates 1/60 - 1/62.
        let fused = rrf_fuse(&ids(&["solo", "both"]), &ids(&["other", "both"]), 3);
        assert_eq!(fused[0].note_id, "both");
    }

    #[test]
    fn absent_documents_contribute_zero_from_that_list() {
        let fused = rrf_fuse(&ids(&["a"]), &[], 5);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn k_truncates_the_fused_list() {
        let fused = rrf_fuse(&ids(&["a", "b", "c"]), &ids(&["d", "e", "f"]), 2);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn equal_everything_breaks_on_note_id() {
        let fused = rrf_fuse(&ids(&["z"]), &ids(&["a"]), 5);
        // Same rank in one list each: same score, same presence, same
        // rank sum → id order.
        let order: Vec<&str> = fused.iter().map(|hit| hit.note_id.as_str()).collect();
        assert_eq!(order, vec!["a", "z"]);
    }
}
