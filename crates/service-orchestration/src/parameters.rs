//! Lazy parameter resolution.

use crate::cache::AsyncCache;
use crate::{Error, ResolvedValue, Result};
use app_model::{Parameter, ParameterSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// External source of secret values, such as a vault
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the value stored under `key`; `Ok(None)` if there is none
    async fn fetch(&self, key: &str) -> Result<Option<String>>;
}

/// In-memory secret store
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: HashMap<String, String>,
}

impl MemorySecretStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn fetch(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

/// Resolves parameters on first use and caches the result.
///
/// Values are only looked up when a resource that needs them is about to
/// start, so a missing secret only fails the resources depending on it.
pub struct ParameterResolver {
    parameters: HashMap<String, Parameter>,
    store: Option<Arc<dyn SecretStore>>,
    env: HashMap<String, String>,
    cache: AsyncCache<String, ResolvedValue>,
}

impl ParameterResolver {
    /// Resolver over the given parameters.
    ///
    /// `env` overrides the process environment for `env` sources.
    pub fn new<'a>(
        parameters: impl IntoIterator<Item = &'a Parameter>,
        store: Option<Arc<dyn SecretStore>>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            parameters: parameters
                .into_iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            store,
            env,
            cache: AsyncCache::new(),
        }
    }

    /// Value of a parameter
    pub async fn resolve(&self, name: &str) -> Result<ResolvedValue> {
        let parameter = self
            .parameters
            .get(name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;

        self.cache
            .get_or_try_load(&parameter.name, || async {
                let raw = self.lookup(parameter).await?;
                debug!(
                    "Resolved parameter '{}' from {}",
                    name,
                    parameter.source.describe()
                );
                Ok::<_, Error>(if parameter.secret {
                    ResolvedValue::secret(raw)
                } else {
                    ResolvedValue::plain(raw)
                })
            })
            .await
    }

    async fn lookup(&self, parameter: &Parameter) -> Result<String> {
        let unavailable = |reason: String| Error::SecretUnavailable {
            parameter: parameter.name.clone(),
            reason,
        };

        match &parameter.source {
            ParameterSource::Value(value) => Ok(value.clone()),
            ParameterSource::Env(var) => self
                .env
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok())
                .ok_or_else(|| unavailable(format!("environment variable {var} is not set"))),
            ParameterSource::Store { key } => {
                let Some(store) = &self.store else {
                    return Err(unavailable("no secret store is configured".to_string()));
                };
                match store.fetch(key).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(unavailable(format!("key '{key}' not found in secret store"))),
                    Err(e) => Err(unavailable(e.to_string())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::timeout;
    use futures::future::{Either, select};
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn fetch(&self, key: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((key == "pg").then(|| "hunter2".to_string()))
        }
    }

    #[smol_potat::test]
    async fn test_store_values_are_fetched_once() {
        let store = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
        });
        let parameters = [Parameter::secret(
            "pg-password",
            ParameterSource::Store {
                key: "pg".to_string(),
            },
        )];
        let resolver = ParameterResolver::new(
            &parameters,
            Some(store.clone() as Arc<dyn SecretStore>),
            HashMap::new(),
        );

        let first = resolver.resolve("pg-password").await.unwrap();
        let second = resolver.resolve("pg-password").await.unwrap();

        assert_eq!(first.expose(), "hunter2");
        assert_eq!(first.redacted(), "******");
        assert_eq!(first, second);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[smol_potat::test]
    async fn test_missing_sources_are_unavailable() {
        let parameters = [
            Parameter::secret(
                "token",
                ParameterSource::Store {
                    key: "token".to_string(),
                },
            ),
            Parameter::new(
                "region",
                ParameterSource::Env("APPHOST_TEST_SURELY_UNSET_VAR".to_string()),
            ),
        ];
        let resolver = ParameterResolver::new(&parameters, None, HashMap::new());

        for name in ["token", "region"] {
            match resolver.resolve(name).await {
                Err(Error::SecretUnavailable { parameter, .. }) => assert_eq!(parameter, name),
                other => panic!("Expected unavailable parameter, got {other:?}"),
            }
        }
    }

    struct GatedStore {
        gate: async_channel::Receiver<()>,
    }

    #[async_trait]
    impl SecretStore for GatedStore {
        async fn fetch(&self, key: &str) -> Result<Option<String>> {
            if key == "slow" {
                let _ = self.gate.recv().await;
            }
            Ok(Some(format!("{key}-value")))
        }
    }

    #[smol_potat::test]
    async fn test_slow_lookup_does_not_block_other_parameters() {
        let (release, gate) = async_channel::bounded(1);
        let parameters = ["slow", "fast"].map(|key| {
            Parameter::secret(
                key,
                ParameterSource::Store {
                    key: key.to_string(),
                },
            )
        });
        let store: Arc<dyn SecretStore> = Arc::new(GatedStore { gate });
        let resolver = ParameterResolver::new(&parameters, Some(store), HashMap::new());

        let mut slow = pin!(resolver.resolve("slow"));
        let fast = pin!(resolver.resolve("fast"));
        let first = timeout(Duration::from_secs(5), select(slow.as_mut(), fast)).await;
        match first {
            Some(Either::Right((value, _))) => assert_eq!(value.unwrap().expose(), "fast-value"),
            Some(Either::Left(_)) => panic!("slow lookup finished first"),
            None => panic!("fast lookup was blocked by the slow one"),
        }

        release.send(()).await.unwrap();
        assert_eq!(slow.await.unwrap().expose(), "slow-value");
    }

    #[smol_potat::test]
    async fn test_env_override() {
        let parameters = [Parameter::new(
            "region",
            ParameterSource::Env("REGION".to_string()),
        )];
        let env = HashMap::from([("REGION".to_string(), "eu-west".to_string())]);
        let resolver = ParameterResolver::new(&parameters, None, env);

        let value = resolver.resolve("region").await.unwrap();
        assert_eq!(value.expose(), "eu-west");
        assert_eq!(value.redacted(), "eu-west");
    }
}
