//! Built-in readiness probes.

use super::{ProbeOutcome, ReadinessProbe};
use crate::{AllocatedEndpoint, Error, Liveness, ResourceHandle, Result};
use app_model::{ReadinessCheck, ResourceNode};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Creates the probe for a started resource
pub trait ProbeFactory: Send + Sync {
    /// Probe for `resource`, started as `handle`
    fn probe_for(
        &self,
        resource: &ResourceNode,
        handle: &Arc<dyn ResourceHandle>,
    ) -> Result<Box<dyn ReadinessProbe>>;
}

/// Builds probes from each resource's effective readiness check
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProbes;

impl ProbeFactory for DefaultProbes {
    fn probe_for(
        &self,
        resource: &ResourceNode,
        handle: &Arc<dyn ResourceHandle>,
    ) -> Result<Box<dyn ReadinessProbe>> {
        let info = handle.info();
        let endpoint = |name: &Option<String>| -> Result<AllocatedEndpoint> {
            let found = match name {
                Some(name) => info.endpoints.get(name),
                None => info.endpoints.values().next(),
            };
            found.cloned().ok_or_else(|| Error::ProbeFailed {
                resource: resource.name().to_string(),
                reason: match name {
                    Some(name) => format!("endpoint '{name}' is not allocated"),
                    None => "no endpoint to probe".to_string(),
                },
            })
        };

        let check = resource.effective_readiness();
        debug!("Readiness check for '{}': {:?}", resource.name(), check);

        let probe: Box<dyn ReadinessProbe> = match check {
            ReadinessCheck::Immediate => Box::new(ImmediateProbe),
            ReadinessCheck::Running => Box::new(RunningProbe {
                handle: handle.clone(),
            }),
            ReadinessCheck::Command { command, args } => Box::new(CommandProbe { command, args }),
            ReadinessCheck::Tcp { endpoint: name } => {
                let endpoint = endpoint(&name)?;
                Box::new(TcpProbe {
                    host: endpoint.host,
                    port: endpoint.port,
                })
            }
            ReadinessCheck::Http {
                endpoint: name,
                path,
            } => {
                let endpoint = endpoint(&name)?;
                Box::new(HttpProbe {
                    url: format!("{}{}", endpoint.url(), path),
                })
            }
            ReadinessCheck::ContainerHealth => {
                let container_id =
                    info.container_id
                        .clone()
                        .ok_or_else(|| Error::ProbeFailed {
                            resource: resource.name().to_string(),
                            reason: "container health check on a resource without a container"
                                .to_string(),
                        })?;
                Box::new(ContainerHealthProbe { container_id })
            }
        };
        Ok(probe)
    }
}

/// Ready as soon as it is asked
pub struct ImmediateProbe;

#[async_trait]
impl ReadinessProbe for ImmediateProbe {
    async fn check(&self) -> ProbeOutcome {
        ProbeOutcome::Ready
    }

    fn describe(&self) -> String {
        "immediate".to_string()
    }
}

/// Ready while the backing process is alive
pub struct RunningProbe {
    handle: Arc<dyn ResourceHandle>,
}

#[async_trait]
impl ReadinessProbe for RunningProbe {
    async fn check(&self) -> ProbeOutcome {
        match self.handle.liveness().await {
            Liveness::Running => ProbeOutcome::Ready,
            Liveness::Exited(reason) => ProbeOutcome::Fatal(format!("exited: {reason}")),
            Liveness::Unknown => ProbeOutcome::NotReady("liveness unknown".to_string()),
        }
    }

    fn describe(&self) -> String {
        "running".to_string()
    }
}

/// Ready when a command exits successfully
pub struct CommandProbe {
    command: String,
    args: Vec<String>,
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn check(&self) -> ProbeOutcome {
        let status = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => ProbeOutcome::Ready,
            Ok(status) => ProbeOutcome::NotReady(format!("{} exited with {status}", self.command)),
            Err(e) => ProbeOutcome::Fatal(format!("failed to run {}: {e}", self.command)),
        }
    }

    fn describe(&self) -> String {
        format!("command {} {}", self.command, self.args.join(" "))
    }
}

/// Ready when the endpoint accepts a TCP connection
pub struct TcpProbe {
    host: String,
    port: u16,
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn check(&self) -> ProbeOutcome {
        match async_net::TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(_) => ProbeOutcome::Ready,
            Err(e) => ProbeOutcome::NotReady(format!("{}:{}: {e}", self.host, self.port)),
        }
    }

    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }
}

/// curl exit codes that mean "not up yet" rather than "misconfigured"
const CURL_TRANSIENT_CODES: [i32; 5] = [
    7,  // failed to connect
    22, // HTTP status >= 400
    28, // operation timed out
    52, // empty reply
    56, // failure receiving data
];

/// Ready when an HTTP GET succeeds
pub struct HttpProbe {
    url: String,
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        let output = Command::new("curl")
            .args(["-fsS", "-o", "/dev/null", "--max-time", "5", self.url.as_str()])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => ProbeOutcome::Ready,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                match output.status.code() {
                    Some(code) if CURL_TRANSIENT_CODES.contains(&code) => {
                        ProbeOutcome::NotReady(format!("GET {}: {stderr}", self.url))
                    }
                    _ => ProbeOutcome::Fatal(format!("GET {}: {stderr}", self.url)),
                }
            }
            Err(e) => ProbeOutcome::Fatal(format!("failed to run curl: {e}")),
        }
    }

    fn describe(&self) -> String {
        format!("http {}", self.url)
    }
}

/// Ready when the container's own health check reports healthy
pub struct ContainerHealthProbe {
    container_id: String,
}

#[async_trait]
impl ReadinessProbe for ContainerHealthProbe {
    async fn check(&self) -> ProbeOutcome {
        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
                self.container_id.as_str(),
            ])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                match String::from_utf8_lossy(&output.stdout).trim() {
                    "healthy" => ProbeOutcome::Ready,
                    "none" => ProbeOutcome::Fatal("container defines no health check".to_string()),
                    status => ProbeOutcome::NotReady(format!("container is {status}")),
                }
            }
            Ok(output) => ProbeOutcome::NotReady(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(e) => ProbeOutcome::Fatal(format!("failed to run docker: {e}")),
        }
    }

    fn describe(&self) -> String {
        format!("container health {}", self.container_id)
    }
}
