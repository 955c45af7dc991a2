//! Embedding adapter: normalization, caching, batching.
//!
//! Text is NFKC-normalized and whitespace-collapsed before hashing, so
//! cosmetically different inputs share one cache entry and one billed
//! embedding. Cache misses are batched up to the provider limit and
//! routed through the fallback manager; in frozen mode the adapter
//! returns a degraded outcome with no vector, which callers treat as
//! "skip the vector index until the budget resets".

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::AiError;
use crate::fallback::{FallbackManager, RequestClass};

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub model: String,
    pub dimension: usize,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    /// Largest number of inputs per provider request.
    pub batch_limit: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            cache_size: 1024,
            cache_ttl: Duration::from_secs(24 * 3600),
            batch_limit: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(
        &self,
        provider: &str,
        model: &str,
        inputs: &[String],
    ) -> Result<EmbedResponse, AiError>;
}

/// One embedded text. `degraded` means the governor forbade the call
/// and no vector was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutcome {
    pub vector: Vec<f32>,
    pub content_hash: String,
    pub degraded: bool,
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted: Instant,
}

pub struct EmbeddingAdapter {
    fallback: Arc<FallbackManager>,
    backend: Arc<dyn EmbeddingBackend>,
    settings: EmbeddingSettings,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

/// NFKC-normalize, trim, and collapse internal whitespace.
pub fn normalize(text: &str) -> String {
    let folded: String = text.nfkc().collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hash of the normalized text; the identity key for both the
/// cache and the vector store's no-op detection.
pub fn content_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EmbeddingAdapter {
    pub fn new(
        fallback: Arc<FallbackManager>,
        backend: Arc<dyn EmbeddingBackend>,
        settings: EmbeddingSettings,
    ) -> Self {
        let capacity = NonZeroUsize::new(settings.cache_size.max(1)).expect("nonzero");
        Self {
            fallback,
            backend,
            settings,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.settings.dimension
    }

    pub async fn embed_one(&self, text: &str) -> Result<EmbedOutcome, AiError> {
        let texts = [text.to_string()];
        Ok(self.embed_many(&texts).await?.remove(0))
    }

    /// Embed a slice of texts, serving repeats and recent texts from
    /// cache. Outcomes line up with the inputs by index.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<EmbedOutcome>, AiError> {
        let normalized: Vec<String> = texts.iter().map(|t| normalize(t)).collect();
        let hashes: Vec<String> = normalized.iter().map(|n| content_hash(n)).collect();

        let mut outcomes: Vec<Option<EmbedOutcome>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().expect("embed cache lock");
            for (i, hash) in hashes.iter().enumerate() {
                let fresh = cache
                    .get(hash)
                    .filter(|entry| entry.inserted.elapsed() <= self.settings.cache_ttl)
                    .map(|entry| entry.vector.clone());
                match fresh {
                    Some(vector) => {
                        outcomes[i] = Some(EmbedOutcome {
                            vector,
                            content_hash: hash.clone(),
                            degraded: false,
                        });
                    }
                    None => misses.push(i),
                }
            }
        }
        if !misses.is_empty() {
            debug!(total = texts.len(), misses = misses.len(), "embedding cache misses");
        }

        // Deduplicate identical miss texts so each unique hash is
        // billed once per call.
        let mut unique: Vec<usize> = Vec::new();
        for &i in &misses {
            if !unique.iter().any(|&j| hashes[j] == hashes[i]) {
                unique.push(i);
            }
        }

        for chunk in unique.chunks(self.settings.batch_limit.max(1)) {
            let inputs: Vec<String> = chunk.iter().map(|&i| normalized[i].clone()).collect();
            let backend = Arc::clone(&self.backend);
            let model = self.settings.model.clone();
            let routed = self
                .fallback
                .execute(
                    RequestClass::Background,
                    move |provider| {
                        let backend = Arc::clone(&backend);
                        let model = model.clone();
                        let inputs = inputs.clone();
                        async move { backend.embed(&provider, &model, &inputs).await.map(Some) }
                    },
                    || None,
                )
                .await?;

            match (routed.value, routed.provider) {
                (Some(response), Some(provider)) => {
                    if response.vectors.len() != chunk.len() {
                        return Err(AiError::Permanent(format!(
                            "provider returned {} embeddings for {} inputs",
                            response.vectors.len(),
                            chunk.len()
                        )));
                    }
                    self.fallback
                        .governor()
                        .record_usage(
                            &provider,
                            &self.settings.model,
                            response.input_tokens,
                            response.output_tokens,
                            "embed",
                            None,
                        )
                        .await?;

                    let mut cache = self.cache.lock().expect("embed cache lock");
                    for (&i, vector) in chunk.iter().zip(response.vectors) {
                        if vector.len() != self.settings.dimension {
                            return Err(AiError::Permanent(format!(
                                "embedding dimension mismatch: provider returned {}, configured {}",
                                vector.len(),
                                self.settings.dimension
                            )));
                        }
                        cache.put(
                            hashes[i].clone(),
                            CacheEntry {
                                vector: vector.clone(),
                                inserted: Instant::now(),
                            },
                        );
                        outcomes[i] = Some(EmbedOutcome {
                            vector,
                            content_hash: hashes[i].clone(),
                            degraded: false,
                        });
                    }
                }
                _ => {
                    // Frozen: no vector, caller defers the upsert.
                    for &i in chunk {
                        outcomes[i] = Some(EmbedOutcome {
                            vector: Vec::new(),
                            content_hash: hashes[i].clone(),
                            degraded: true,
                        });
                    }
                }
            }
        }

        // Fill duplicate-miss slots from whichever twin was resolved.
        for &i in &misses {
            if outcomes[i].is_none() {
                let twin = outcomes
                    .iter()
                    .enumerate()
                    .find(|(j, o)| o.is_some() && hashes[*j] == hashes[i])
                    .and_then(|(_, o)| o.clone());
                outcomes[i] = twin;
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|o| o.expect("every input resolved"))
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::governor::TokenGovernor;
    use notevault_store::{Store, StoreOptions};

    struct FakeBackend {
        calls: AtomicUsize,
        inputs_seen: Mutex<Vec<Vec<String>>>,
        dimension: usize,
    }

    impl FakeBackend {
        fn new(dimension: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                inputs_seen: Mutex::new(Vec::new()),
                dimension,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for FakeBackend {
        async fn embed(
            &self,
            _provider: &str,
            _model: &str,
            inputs: &[String],
        ) -> Result<EmbedResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs_seen.lock().unwrap().push(inputs.to_vec());
            Ok(EmbedResponse {
                vectors: inputs.iter().map(|_| vec![1.0; self.dimension]).collect(),
                input_tokens: inputs.len() as u64 * 10,
                output_tokens: 0,
            })
        }
    }

    async fn adapter_with(
        backend: Arc<FakeBackend>,
        limit: u64,
        used: u64,
        settings: EmbeddingSettings,
    ) -> EmbeddingAdapter {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let governor = TokenGovernor::new(store, limit, chrono_tz::UTC).await.unwrap();
        if used > 0 {
            governor.record_usage("p", "m", used, 0, "seed", None).await.unwrap();
        }
        let fallback = Arc::new(FallbackManager::new(
            Arc::new(governor),
            "p".to_string(),
            None,
        ));
        EmbeddingAdapter::new(fallback, backend, settings)
    }

    fn settings(dimension: usize) -> EmbeddingSettings {
        EmbeddingSettings {
            dimension,
            model: "m".to_string(),
            ..EmbeddingSettings::default()
        }
    }

    #[test]
    fn normalize_applies_nfkc_and_collapses_whitespace() {
        // U+FB01 LATIN SMALL LIGATURE FI and a full-width A.
        assert_eq!(normalize("ﬁle  \t name\nＡ"), "file name A");
        assert_eq!(normalize("  plain  "), "plain");
    }

    #[test]
    fn content_hash_is_stable_across_cosmetic_variants() {
        assert_eq!(
            content_hash(&normalize("hello   world")),
            content_hash(&normalize(" hello world ")),
        );
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[tokio::test]
    async fn repeat_embeddings_are_served_from_cache() {
        let backend = Arc::new(FakeBackend::new(4));
        let adapter = adapter_with(Arc::clone(&backend), 1_000_000, 0, settings(4)).await;

        let first = adapter.embed_one("hello world").await.unwrap();
        assert!(!first.degraded);
        assert_eq!(first.vector.len(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // Cosmetic variant of the same text: no second provider call.
        let second = adapter.embed_one("  hello   world ").await.unwrap();
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misses_are_batched_up_to_the_limit() {
        let backend = Arc::new(FakeBackend::new(4));
        let mut s = settings(4);
        s.batch_limit = 2;
        let adapter = adapter_with(Arc::clone(&backend), 1_000_000, 0, s).await;

        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let outcomes = adapter.embed_many(&texts).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        // 5 misses at batch limit 2 → 3 provider calls.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let sizes: Vec<usize> = backend
            .inputs_seen
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn duplicate_inputs_bill_once_and_resolve_everywhere() {
        let backend = Arc::new(FakeBackend::new(4));
        let adapter = adapter_with(Arc::clone(&backend), 1_000_000, 0, settings(4)).await;
        let texts = vec!["same".to_string(), "same".to_string(), "other".to_string()];
        let outcomes = adapter.embed_many(&texts).await.unwrap();
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.inputs_seen.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_permanent_error() {
        let backend = Arc::new(FakeBackend::new(3));
        let adapter = adapter_with(backend, 1_000_000, 0, settings(4)).await;
        let err = adapter.embed_one("text").await.unwrap_err();
        assert!(matches!(err, AiError::Permanent(_)), "{err:?}");
    }

    #[tokio::test]
    async fn frozen_budget_yields_degraded_outcome_without_calls() {
        let backend = Arc::new(FakeBackend::new(4));
        let adapter = adapter_with(Arc::clone(&backend), 1000, 1000, settings(4)).await;
        let outcome = adapter.embed_one("text").await.unwrap();
        assert!(outcome.degraded);
        assert!(outcome.vector.is_empty());
        assert!(!outcome.content_hash.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn usage_is_recorded_per_provider_call() {
        let backend = Arc::new(FakeBackend::new(4));
        let adapter = adapter_with(Arc::clone(&backend), 1_000_000, 0, settings(4)).await;
        adapter.embed_one("some text").await.unwrap();
        let report = adapter.fallback.governor().monthly_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].input_tokens, 10);
    }
}
