//! One-shot construction of every component, and the long-running
//! process loop.
//!
//! Components are built exactly once, here, and handed to their
//! consumers as `Arc`s; nothing is looked up at runtime. The split
//! between [`build_core`] (store, vector, AI, knowledge) and
//! [`build`] (adds git, the batch processor, and event dispatch) lets
//! maintenance commands run without git credentials.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{error, info, warn};

use notevault_ai::{
    AiError, EmbeddingAdapter, EmbeddingSettings, FallbackManager, HttpAiBackend, TokenGovernor,
    TranscriptionAdapter,
};
use notevault_config::{AppConfig, ConfigError};
use notevault_git::{
    AuthProvider, GitError, GitOperator, GitWorkspace, InstallationAuthProvider,
    StaticTokenProvider,
};
use notevault_knowledge::{HybridSearch, KnowledgeManager, SyncCoordinator};
use notevault_queue::{Queue, QueueError, QueueSettings};
use notevault_security::{PrivacyFilter, PrivacyLevel};
use notevault_store::{Store, StoreError, StoreOptions};
use notevault_vector::{DistanceMetric, VectorError, VectorStore};

use crate::events::EventHandler;
use crate::processor::{BatchProcessor, BatchSettings};

/// Reconciliation cadence when no write wakes the coordinator.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TRANSCRIBE_MODEL: &str = "whisper-1";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Knowledge(#[from] notevault_knowledge::KnowledgeError),
}

impl BuildError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) => 64,
            BuildError::Store(StoreError::Corrupt(_)) => 65,
            BuildError::Store(StoreError::Transient(_)) => 70,
            BuildError::Vector(VectorError::Verification(_))
            | BuildError::Vector(VectorError::MetricMismatch { .. }) => 65,
            BuildError::Vector(VectorError::Dimension { .. }) => 64,
            BuildError::Vector(_) => 70,
            BuildError::Git(_) | BuildError::Ai(_) => 69,
            BuildError::Queue(_) | BuildError::Knowledge(_) => 70,
        }
    }
}

/// Everything that exists independent of the git pipeline.
pub struct Core {
    pub config: AppConfig,
    pub store: Store,
    pub vector: VectorStore,
    pub queue: Queue,
    pub governor: Arc<TokenGovernor>,
    pub fallback: Arc<FallbackManager>,
    pub embedder: Arc<EmbeddingAdapter>,
    pub manager: Arc<KnowledgeManager>,
    pub sync: Arc<SyncCoordinator>,
    pub transcriber: Arc<TranscriptionAdapter>,
    pub privacy: Arc<PrivacyFilter>,
}

pub struct App {
    pub core: Core,
    pub git: Arc<GitOperator>,
    pub processor: Arc<BatchProcessor>,
    pub handler: Arc<EventHandler>,
}

pub async fn build_core(
    config: &AppConfig,
    checksum_override: bool,
) -> Result<Core, BuildError> {
    std::fs::create_dir_all(config.data_root()).map_err(StoreError::from)?;
    std::fs::create_dir_all(config.tmp_dir()).map_err(StoreError::from)?;

    let store = Store::open(
        config.store_path(),
        StoreOptions {
            checksum_override,
            enable_fts: true,
        },
    )?;
    let vector = VectorStore::open(
        config.vectors_dir(),
        "notes",
        DistanceMetric::Cosine,
        config.ai.embed_dim,
    )?;
    let queue = Queue::new(
        store.clone(),
        QueueSettings {
            max_attempts: config.queue.max_attempts,
            soft_cap: config.queue.soft_cap,
        },
    );

    let zone: chrono_tz::Tz =
        config
            .ai
            .usage_time_zone
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "USAGE_TIME_ZONE".to_string(),
                reason: format!("unknown zone {:?}", config.ai.usage_time_zone),
            })?;
    let governor = Arc::new(
        TokenGovernor::new(store.clone(), config.ai.monthly_token_limit, zone).await?,
    );
    let fallback = Arc::new(FallbackManager::new(
        Arc::clone(&governor),
        config.ai.primary.clone(),
        Some(config.ai.secondary.clone()),
    ));
    let backend = Arc::new(HttpAiBackend::new(Some(Arc::clone(&fallback))));

    let embedder = Arc::new(EmbeddingAdapter::new(
        Arc::clone(&fallback),
        Arc::clone(&backend) as Arc<dyn notevault_ai::EmbeddingBackend>,
        EmbeddingSettings {
            dimension: config.ai.embed_dim,
            ..EmbeddingSettings::default()
        },
    ));

    let search = Arc::new(HybridSearch::new(
        store.clone(),
        vector.clone(),
        Arc::clone(&embedder),
    ));
    let sync_wake = Arc::new(Notify::new());
    let manager = Arc::new(KnowledgeManager::new(
        store.clone(),
        search,
        Arc::clone(&fallback),
        Arc::clone(&backend) as Arc<dyn notevault_ai::TextBackend>,
        DEFAULT_CHAT_MODEL,
        Arc::clone(&sync_wake),
    ));
    let sync = Arc::new(SyncCoordinator::new(
        store.clone(),
        vector.clone(),
        Arc::clone(&embedder),
        sync_wake,
        RECONCILE_INTERVAL,
    ));
    let transcriber = Arc::new(TranscriptionAdapter::new(
        Arc::clone(&fallback),
        Arc::clone(&backend) as Arc<dyn notevault_ai::TranscriptionBackend>,
        DEFAULT_TRANSCRIBE_MODEL,
        config.ai.max_audio_bytes,
        config.tmp_dir(),
    ));

    let level: PrivacyLevel = config
        .privacy
        .default_level
        .parse()
        .map_err(|_| ConfigError::Invalid {
            key: "PRIVACY_DEFAULT_LEVEL".to_string(),
            reason: config.privacy.default_level.clone(),
        })?;
    let privacy = Arc::new(PrivacyFilter::new(level));

    Ok(Core {
        config: config.clone(),
        store,
        vector,
        queue,
        governor,
        fallback,
        embedder,
        manager,
        sync,
        transcriber,
        privacy,
    })
}

/// Full construction: core plus the git pipeline. Runs queue crash
/// recovery, exactly once per process.
pub async fn build(config: &AppConfig, checksum_override: bool) -> Result<App, BuildError> {
    config.validate_git()?;
    let core = build_core(config, checksum_override).await?;

    let auth = auth_provider(config)?;
    let git = Arc::new(
        GitOperator::prepare(
            GitWorkspace {
                base_dir: config.git_dir(),
                remote_url: config.git.remote_url.clone(),
                branch: config.git.branch.clone(),
                instance_retention: config.git.instance_retention,
                instance_id: None,
            },
            auth,
        )
        .await?,
    );

    let processor = Arc::new(BatchProcessor::new(
        core.queue.clone(),
        Arc::clone(&git),
        Arc::clone(&core.privacy),
        core.store.clone(),
        Arc::clone(&core.governor),
        config.ai.primary.clone(),
        BatchSettings {
            batch_size: config.queue.batch_size,
            lease_duration: Duration::from_millis(config.queue.lease_duration_ms),
            batch_timeout: Duration::from_millis(config.queue.batch_timeout_ms),
        },
    ));
    let handler = Arc::new(EventHandler::new(
        Arc::clone(&core.manager),
        Arc::clone(&core.transcriber),
        core.queue.clone(),
    ));

    let recovered = core.queue.recover_on_startup().await?;
    if recovered > 0 {
        info!(recovered, "expired leases recovered at startup");
    }

    Ok(App {
        core,
        git,
        processor,
        handler,
    })
}

fn auth_provider(config: &AppConfig) -> Result<Arc<dyn AuthProvider>, BuildError> {
    match config.git.auth_mode.as_str() {
        "token" => Ok(Arc::new(StaticTokenProvider::new(config.git.token.clone()))),
        "installation" => {
            let exchange_url = if config.git.token_exchange_url.is_empty() {
                derive_exchange_url(&config.git.remote_url).ok_or_else(|| {
                    ConfigError::Missing("GIT_TOKEN_EXCHANGE_URL".to_string())
                })?
            } else {
                config.git.token_exchange_url.clone()
            };
            Ok(Arc::new(InstallationAuthProvider::new(
                config.git.app_key_path.clone(),
                config.git.app_install_id.clone(),
                exchange_url,
            )))
        }
        other => Err(ConfigError::Invalid {
            key: "GIT_AUTH_MODE".to_string(),
            reason: format!("unknown mode {other:?}"),
        }
        .into()),
    }
}

/// Default installation exchange endpoint on the remote's host.
fn derive_exchange_url(remote_url: &str) -> Option<String> {
    let rest = remote_url
        .strip_prefix("https://")
        .or_else(|| remote_url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    // Strip any userinfo that found its way into the configured URL.
    let host = host.rsplit('@').next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("https://{host}/api/app/token"))
}

/// Run the bot: reconciliation loop plus the worker pool, until
/// ctrl-c. Intake stops first; in-flight batches finish before the
/// workers exit.
pub async fn run(app: App) -> Result<(), BuildError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync = Arc::clone(&app.core.sync);
    let sync_shutdown = shutdown_rx.clone();
    let sync_task = tokio::spawn(async move {
        sync.run(sync_shutdown).await;
    });

    let workers: Vec<_> = (0..app.core.config.runtime.worker_concurrency)
        .map(|worker| {
            let processor = Arc::clone(&app.processor);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                info!(worker, "batch worker started");
                processor.run(shutdown).await;
            })
        })
        .collect();

    info!(
        workers = app.core.config.runtime.worker_concurrency,
        instance = app.git.instance_id(),
        "notevault running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(err) => error!(error = %err, "signal listener failed, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if worker.await.is_err() {
            warn!("batch worker ended abnormally");
        }
    }
    let _ = sync_task.await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_failure_class() {
        let config = BuildError::Config(ConfigError::Missing("GIT_TOKEN".to_string()));
        assert_eq!(config.exit_code(), 64);

        let corrupt = BuildError::Store(StoreError::Corrupt("checksum".to_string()));
        assert_eq!(corrupt.exit_code(), 65);

        let canary = BuildError::Vector(VectorError::Verification("probe".to_string()));
        assert_eq!(canary.exit_code(), 65);

        let remote = BuildError::Git(GitError::Transient("refused".to_string()));
        assert_eq!(remote.exit_code(), 69);

        let internal = BuildError::Store(StoreError::Transient("busy".to_string()));
        assert_eq!(internal.exit_code(), 70);
    }

    #[test]
    fn exchange_url_derives_from_the_remote_host() {
        assert_eq!(
            derive_exchange_url("https://git.example.com/me/vault.git").as_deref(),
            Some("https://git.example.com/api/app/token")
        );
        assert_eq!(
            derive_exchange_url("https://user@git.example.com/me/vault.git").as_deref(),
            Some("https://git.example.com/api/app/token")
        );
        assert!(derive_exchange_url("/local/path.git").is_none());
    }

    #[tokio::test]
    async fn core_builds_against_a_fresh_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_root = dir.path().join("data").display().to_string();
        config.ai.embed_dim = 8;

        let core = build_core(&config, false).await.unwrap();
        assert!(config.store_path().exists());
        assert_eq!(core.vector.dimension(), 8);
        assert_eq!(core.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn build_without_git_credentials_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_root = dir.path().display().to_string();
        config.git.remote_url = "https://example.com/vault.git".to_string();
        // token mode with empty token
        let err = match build(&config, false).await {
            Err(e) => e,
            Ok(_) => panic!("expected build to fail"),
        };
        assert_eq!(err.exit_code(), 64);
    }
}
