//! Built-in pipeline stages and their startup registration.
//!
//! | Kind       | Name        | Notes                                          |
//! |------------|-------------|------------------------------------------------|
//! | loader     | `basic`     | inline text or base64 content                  |
//! | loader     | `url`       | fetches `content` as a URL, yields a derived file |
//! | splitter   | `paragraph` | paragraph packing bounded by `max_tokens`      |
//! | splitter   | `token`     | word windows with `units` / `overlap`          |
//! | vectorizer | `hashing`   | deterministic feature hashing, no network      |
//! | vectorizer | `openai`    | OpenAI-compatible `/v1/embeddings`             |
//! | sink       | `memory`    | in-process [`MemoryStore`]                     |
//! | sink       | `sqlite`    | sqlx tables, registered when `[sqlite].path` is set |

pub mod loader;
pub mod sink;
pub mod splitter;
pub mod vectorizer;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ingest_relay_core::models::StageKind;
use ingest_relay_core::stage::StageRegistry;
use tracing::info;

use crate::config::Config;
use crate::{db, migrate};

pub use sink::MemoryStore;

/// Handles to built-in stages that other components read from.
pub struct BuiltinStages {
    pub memory: Arc<MemoryStore>,
}

/// Register every built-in stage. Fails on a duplicate name, or when the
/// sqlite sink is configured but its database cannot be opened.
pub async fn register_builtin_stages(
    registry: &mut StageRegistry,
    config: &Config,
) -> Result<BuiltinStages> {
    registry.register(loader::basic())?;
    registry.register(loader::url())?;

    registry.register(splitter::paragraph())?;
    registry.register(splitter::token())?;

    registry.register(vectorizer::hashing())?;
    registry.register(vectorizer::openai(&config.embedding))?;

    let memory = Arc::new(MemoryStore::new());
    registry.register(sink::memory(memory.clone()))?;

    if let Some(path) = &config.sqlite.path {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .with_context(|| format!("migrating {}", path.display()))?;
        registry.register(sink::sqlite(pool))?;
        info!(path = %path.display(), "sqlite sink enabled");
    }

    info!(stages = registry.len(), "built-in stages registered");
    Ok(BuiltinStages { memory })
}

/// Check that every configured default stage exists.
pub fn check_defaults(registry: &StageRegistry, config: &Config) -> Result<()> {
    let defaults = &config.pipeline;
    for (kind, name) in [
        (StageKind::Loader, &defaults.loader),
        (StageKind::Splitter, &defaults.splitter),
        (StageKind::Vectorizer, &defaults.vectorizer),
        (StageKind::Sink, &defaults.sink),
    ] {
        if !registry.contains(kind, name) {
            let known: Vec<String> = registry
                .list_available(kind)
                .into_iter()
                .map(|s| s.name)
                .collect();
            bail!(
                "default {} '{}' is not registered. Available: {}",
                kind,
                name,
                known.join(", ")
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins_register_and_defaults_resolve() {
        let config = Config::minimal();
        let mut registry = StageRegistry::new();
        register_builtin_stages(&mut registry, &config).await.unwrap();

        assert_eq!(registry.list_available(StageKind::Splitter).len(), 2);
        assert!(!registry.contains(StageKind::Sink, "sqlite"));
        check_defaults(&registry, &config).unwrap();
    }

    #[tokio::test]
    async fn test_double_registration_fails() {
        let config = Config::minimal();
        let mut registry = StageRegistry::new();
        register_builtin_stages(&mut registry, &config).await.unwrap();
        assert!(register_builtin_stages(&mut registry, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_default_is_rejected() {
        let mut config = Config::minimal();
        config.pipeline.vectorizer = "ada".to_string();
        let mut registry = StageRegistry::new();
        register_builtin_stages(&mut registry, &config).await.unwrap();
        let err = check_defaults(&registry, &config).unwrap_err();
        assert!(err.to_string().contains("ada"));
    }

    #[tokio::test]
    async fn test_sqlite_sink_registered_with_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.sqlite.path = Some(tmp.path().join("relay.db"));
        let mut registry = StageRegistry::new();
        register_builtin_stages(&mut registry, &config).await.unwrap();
        assert!(registry.contains(StageKind::Sink, "sqlite"));
    }
}
