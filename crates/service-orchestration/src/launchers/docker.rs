//! Docker container launcher.

use super::{
    LaunchRequest, Launcher, Liveness, LogBuffer, LogStream, ResourceHandle, RunningResource,
    short_id,
};
use crate::{Error, Result};
use app_model::{ResourceKind, ResourceNode};
use async_process::{Child, Command, Output, Stdio};
use async_trait::async_trait;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::lock::Mutex;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Starts container resources with the docker CLI
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerLauncher;

impl ContainerLauncher {
    /// Create a new container launcher
    pub fn new() -> Self {
        Self
    }
}

async fn docker<I, S>(args: I) -> std::io::Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
}

/// Arguments of `docker run` for a request. Environment values are passed
/// by name only so secrets never appear on the command line.
fn run_args(
    container_name: &str,
    request: &LaunchRequest,
    image: &str,
    args: &[String],
    volumes: &[String],
) -> Vec<String> {
    let mut run = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];
    for endpoint in request.endpoints.values() {
        let target = endpoint.target_port.unwrap_or(endpoint.port);
        run.extend(["-p".to_string(), format!("{}:{}", endpoint.port, target)]);
    }
    for key in request.env.keys() {
        run.extend(["-e".to_string(), key.clone()]);
    }
    for volume in volumes {
        run.extend(["-v".to_string(), volume.clone()]);
    }
    run.push(image.to_string());
    run.extend(args.iter().cloned());
    run
}

#[async_trait]
impl Launcher for ContainerLauncher {
    fn can_handle(&self, resource: &ResourceNode) -> bool {
        matches!(resource.kind(), ResourceKind::Container { .. }) && !resource.is_existing()
    }

    async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>> {
        let resource = &request.resource;
        let start_failed = |reason: String| Error::StartFailed {
            resource: resource.name().to_string(),
            reason,
        };
        let ResourceKind::Container {
            image,
            args,
            volumes,
        } = resource.kind()
        else {
            return Err(start_failed(
                "ContainerLauncher can only start containers".to_string(),
            ));
        };

        let container_name = format!(
            "{}-{}",
            resource.name(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let run = run_args(&container_name, &request, image, args, volumes);
        debug!("Command: docker {}", run.join(" "));

        let mut cmd = Command::new("docker");
        cmd.args(&run).stdin(Stdio::null());
        for (key, value) in &request.env {
            cmd.env(key, value.expose());
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| start_failed(format!("failed to run docker: {e}")))?;
        if !output.status.success() {
            return Err(start_failed(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            "Container '{}' started as {}",
            container_name,
            short_id(&container_id)
        );

        let logs = LogBuffer::new();
        let log_child = follow_logs(resource.name(), &container_id, &logs);

        let info = RunningResource::new(resource.name(), resource.kind().label())
            .with_container_id(container_id)
            .with_endpoints(request.endpoints.clone());

        Ok(Arc::new(ContainerHandle {
            info,
            logs,
            log_child: Mutex::new(log_child),
        }))
    }
}

/// Spawn `docker logs -f` into `logs`. Log capture is best effort: a
/// failure is logged and the container still counts as started.
fn follow_logs(name: &str, container_id: &str, logs: &LogBuffer) -> Option<Child> {
    let spawned = Command::new("docker")
        .args(["logs", "-f", "--tail", "all", container_id])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to follow logs of '{}': {}", name, e);
            logs.close();
            return None;
        }
    };

    let stdout = child
        .stdout
        .take()
        .map(|out| BufReader::new(out).lines().boxed())
        .unwrap_or_else(|| stream::empty().boxed());
    let stderr = child
        .stderr
        .take()
        .map(|err| BufReader::new(err).lines().boxed())
        .unwrap_or_else(|| stream::empty().boxed());
    let lines = stream::select(stdout, stderr).filter_map(|line| async move { line.ok() });
    if let Err(e) = logs.pump(name, lines) {
        warn!("Failed to start log pump for '{}': {}", name, e);
    }
    Some(child)
}

/// Handle to a running container
struct ContainerHandle {
    info: RunningResource,
    logs: LogBuffer,
    log_child: Mutex<Option<Child>>,
}

impl ContainerHandle {
    fn container_id(&self) -> &str {
        self.info.container_id.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl ResourceHandle for ContainerHandle {
    fn info(&self) -> &RunningResource {
        &self.info
    }

    async fn liveness(&self) -> Liveness {
        let output = docker(["inspect", "-f", "{{.State.Running}}", self.container_id()]).await;
        match output {
            Ok(output) if output.status.success() => {
                match String::from_utf8_lossy(&output.stdout).trim() {
                    "true" => Liveness::Running,
                    _ => Liveness::Exited("container is not running".to_string()),
                }
            }
            Ok(_) => Liveness::Exited("container not found".to_string()),
            Err(e) => {
                debug!("docker inspect failed for '{}': {}", self.info.name, e);
                Liveness::Unknown
            }
        }
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let id = self.container_id().to_string();
        let secs = grace.as_secs().max(1).to_string();

        let stopped = docker(["stop", "-t", secs.as_str(), id.as_str()]).await?;
        if !stopped.status.success() {
            warn!(
                "docker stop failed for {}: {}",
                short_id(&id),
                String::from_utf8_lossy(&stopped.stderr).trim()
            );
        }
        let removed = docker(["rm", "-f", id.as_str()]).await?;
        if !removed.status.success() {
            warn!(
                "docker rm failed for {}: {}",
                short_id(&id),
                String::from_utf8_lossy(&removed.stderr).trim()
            );
        }

        if let Some(mut child) = self.log_child.lock().await.take() {
            let _ = child.kill();
            let _ = child.status().await;
        }
        Ok(())
    }

    async fn logs(&self) -> Result<LogStream> {
        Ok(self.logs.subscribe())
    }
}
