//! Local process launcher.

use super::{
    LaunchRequest, Launcher, Liveness, LogBuffer, LogStream, ResourceHandle, RunningResource,
};
use crate::shutdown::timeout;
use crate::{Error, Result};
use app_model::{ResourceKind, ResourceNode};
use async_process::{Child, Command, Stdio};
use async_trait::async_trait;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::lock::Mutex;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Starts project resources as local child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create a new process launcher
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn can_handle(&self, resource: &ResourceNode) -> bool {
        matches!(resource.kind(), ResourceKind::Project { .. }) && !resource.is_existing()
    }

    async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>> {
        let resource = &request.resource;
        let ResourceKind::Project {
            binary,
            args,
            working_dir,
        } = resource.kind()
        else {
            return Err(Error::StartFailed {
                resource: resource.name().to_string(),
                reason: "ProcessLauncher can only start projects".to_string(),
            });
        };

        debug!("Command: {} {}", binary, args.join(" "));

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value.expose());
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| Error::StartFailed {
            resource: resource.name().to_string(),
            reason: format!("failed to spawn {binary}: {e}"),
        })?;

        let logs = LogBuffer::new();
        let stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines().boxed());
        let stderr = child
            .stderr
            .take()
            .map(|err| BufReader::new(err).lines().boxed());
        let lines = stream::select(
            stdout.unwrap_or_else(|| stream::empty().boxed()),
            stderr.unwrap_or_else(|| stream::empty().boxed()),
        )
        .filter_map(|line| async move { line.ok() });
        logs.pump(resource.name(), lines)?;

        let info = RunningResource::new(resource.name(), resource.kind().label())
            .with_pid(child.id())
            .with_endpoints(request.endpoints.clone());

        Ok(Arc::new(ProcessHandle {
            info,
            child: Mutex::new(child),
            logs,
        }))
    }
}

/// Handle to a child process
struct ProcessHandle {
    info: RunningResource,
    child: Mutex<Child>,
    logs: LogBuffer,
}

#[async_trait]
impl ResourceHandle for ProcessHandle {
    fn info(&self) -> &RunningResource {
        &self.info
    }

    async fn liveness(&self) -> Liveness {
        match self.child.lock().await.try_status() {
            Ok(None) => Liveness::Running,
            Ok(Some(status)) => Liveness::Exited(status.to_string()),
            Err(e) => {
                debug!("Failed to query status of '{}': {}", self.info.name, e);
                Liveness::Unknown
            }
        }
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_status() {
            debug!("'{}' already exited: {}", self.info.name, status);
            return Ok(());
        }

        terminate(&mut child)?;
        if timeout(grace, child.status()).await.is_none() {
            warn!(
                "'{}' did not exit within {:?}, killing it",
                self.info.name, grace
            );
            child.kill()?;
            child.status().await?;
        }
        Ok(())
    }

    async fn logs(&self) -> Result<LogStream> {
        Ok(self.logs.subscribe())
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<()> {
    child.kill()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResolvedValue;
    use app_model::{Registry, ResourceConfig};
    use indexmap::IndexMap;
    use std::time::Instant;

    fn request(name: &str, script: &str, env: &[(&str, &str)]) -> LaunchRequest {
        let mut registry = Registry::new();
        registry
            .declare(
                name,
                ResourceKind::Project {
                    binary: "sh".to_string(),
                    args: vec!["-c".to_string(), script.to_string()],
                    working_dir: None,
                },
                ResourceConfig::new(),
            )
            .unwrap();
        LaunchRequest {
            resource: registry.get(name).unwrap().clone(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), ResolvedValue::plain(*v)))
                .collect::<IndexMap<_, _>>(),
            endpoints: IndexMap::new(),
        }
    }

    #[smol_potat::test]
    async fn test_environment_reaches_the_process() {
        let handle = ProcessLauncher
            .start(request("echo", "echo \"db=$DB_URL\"", &[("DB_URL", "Host=db")]))
            .await
            .unwrap();

        assert!(handle.info().pid.is_some());
        let lines: Vec<String> = handle.logs().await.unwrap().collect().await;
        assert_eq!(lines, vec!["db=Host=db"]);
        assert!(matches!(handle.liveness().await, Liveness::Exited(_)));
    }

    #[smol_potat::test]
    async fn test_stop_sends_sigterm() {
        let handle = ProcessLauncher
            .start(request("sleeper", "sleep 30", &[]))
            .await
            .unwrap();
        assert_eq!(handle.liveness().await, Liveness::Running);

        let started = Instant::now();
        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(handle.liveness().await, Liveness::Exited(_)));
    }

    #[smol_potat::test]
    async fn test_stop_kills_after_grace() {
        let handle = ProcessLauncher
            .start(request("stubborn", "trap '' TERM; sleep 30", &[]))
            .await
            .unwrap();
        // Give the shell time to install the trap
        async_io::Timer::after(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.stop(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[smol_potat::test]
    async fn test_spawn_failure() {
        let mut request = request("missing", "true", &[]);
        request.resource = {
            let mut registry = Registry::new();
            registry
                .declare(
                    "missing",
                    ResourceKind::Project {
                        binary: "/nonexistent/binary".to_string(),
                        args: vec![],
                        working_dir: None,
                    },
                    ResourceConfig::new(),
                )
                .unwrap();
            registry.get("missing").unwrap().clone()
        };

        assert!(matches!(
            ProcessLauncher.start(request).await,
            Err(Error::StartFailed { .. })
        ));
    }
}
