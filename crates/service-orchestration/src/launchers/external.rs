//! Launcher for resources that run somewhere else.

use super::{LaunchRequest, Launcher, Liveness, LogStream, ResourceHandle, RunningResource};
use crate::Result;
use app_model::{ResourceKind, ResourceNode};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Binds existing, external and database resources without starting
/// anything. Their connection information comes entirely from templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalLauncher;

#[async_trait]
impl Launcher for ExternalLauncher {
    fn can_handle(&self, resource: &ResourceNode) -> bool {
        resource.is_existing()
            || matches!(
                resource.kind(),
                ResourceKind::External { .. } | ResourceKind::Database { .. }
            )
    }

    async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>> {
        let info = RunningResource::new(request.resource.name(), request.resource.kind().label())
            .with_endpoints(request.endpoints);
        Ok(Arc::new(BoundHandle { info }))
    }
}

struct BoundHandle {
    info: RunningResource,
}

#[async_trait]
impl ResourceHandle for BoundHandle {
    fn info(&self) -> &RunningResource {
        &self.info
    }

    async fn liveness(&self) -> Liveness {
        Liveness::Running
    }

    async fn stop(&self, _grace: Duration) -> Result<()> {
        Ok(())
    }

    async fn logs(&self) -> Result<LogStream> {
        Ok(stream::empty().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_model::{Registry, ResourceConfig};
    use indexmap::IndexMap;

    #[smol_potat::test]
    async fn test_bound_handle() {
        let mut registry = Registry::new();
        registry
            .declare(
                "payments",
                ResourceKind::External {
                    connection_string: "https://payments.example.test".to_string(),
                },
                ResourceConfig::new(),
            )
            .unwrap();

        let handle = ExternalLauncher
            .start(LaunchRequest {
                resource: registry.get("payments").unwrap().clone(),
                env: IndexMap::new(),
                endpoints: IndexMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(handle.info().kind, "external");
        assert!(handle.info().pid.is_none());
        assert_eq!(handle.liveness().await, Liveness::Running);
        handle.stop(Duration::ZERO).await.unwrap();
        assert!(handle.logs().await.unwrap().next().await.is_none());
    }
}
