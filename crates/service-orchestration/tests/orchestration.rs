//! End-to-end runs of small app models with scripted launchers and probes.

use app_model::{
    AppModel, EndpointSpec, Parameter, ParameterSource, ProbePolicy, Registry, ResourceConfig,
    ResourceKind, ResourceNode,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use service_orchestration::{
    FailureCause, LaunchRequest, Launcher, LifecycleController, Liveness, LogStream,
    MemorySecretStore, Orchestrator, ProbeFactory, ProbeOutcome, ReadinessProbe, ReadinessState,
    ResourceHandle, Result, RunningResource, Shutdown,
};
use smol::Timer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Records what was started and stopped
#[derive(Clone, Default)]
struct Journal {
    started: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn started_names(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn env_of(&self, name: &str) -> HashMap<String, String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|(started, _)| started == name)
            .map(|(_, env)| env.clone())
            .unwrap_or_default()
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

struct FakeLauncher {
    journal: Journal,
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn can_handle(&self, _resource: &ResourceNode) -> bool {
        true
    }

    async fn start(&self, request: LaunchRequest) -> Result<Arc<dyn ResourceHandle>> {
        let env = request
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.expose().to_string()))
            .collect();
        self.journal
            .started
            .lock()
            .unwrap()
            .push((request.resource.name().to_string(), env));

        Ok(Arc::new(FakeHandle {
            info: RunningResource::new(request.resource.name(), request.resource.kind().label())
                .with_endpoints(request.endpoints),
            journal: self.journal.clone(),
        }))
    }
}

struct FakeHandle {
    info: RunningResource,
    journal: Journal,
}

#[async_trait]
impl ResourceHandle for FakeHandle {
    fn info(&self) -> &RunningResource {
        &self.info
    }

    async fn liveness(&self) -> Liveness {
        Liveness::Running
    }

    async fn stop(&self, _grace: Duration) -> Result<()> {
        // Stops of one batch overlap; a short delay makes ordering across
        // batches observable
        Timer::after(Duration::from_millis(10)).await;
        self.journal.stopped.lock().unwrap().push(self.info.name.clone());
        Ok(())
    }

    async fn logs(&self) -> Result<LogStream> {
        Ok(stream::iter(vec![format!("{} log", self.info.name)]).boxed())
    }
}

#[derive(Clone)]
enum Behaviour {
    ReadyAfter(Duration),
    Hang,
    NotReady,
}

struct ScriptedProbe(Behaviour);

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self) -> ProbeOutcome {
        match &self.0 {
            Behaviour::ReadyAfter(delay) => {
                Timer::after(*delay).await;
                ProbeOutcome::Ready
            }
            Behaviour::Hang => futures::future::pending().await,
            Behaviour::NotReady => ProbeOutcome::NotReady("connection refused".to_string()),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Probes by resource name; unlisted resources are ready immediately
#[derive(Default)]
struct ScriptedProbes(HashMap<String, Behaviour>);

impl ScriptedProbes {
    fn with(mut self, name: &str, behaviour: Behaviour) -> Self {
        self.0.insert(name.to_string(), behaviour);
        self
    }
}

impl ProbeFactory for ScriptedProbes {
    fn probe_for(
        &self,
        resource: &ResourceNode,
        _handle: &Arc<dyn ResourceHandle>,
    ) -> Result<Box<dyn ReadinessProbe>> {
        let behaviour = self
            .0
            .get(resource.name())
            .cloned()
            .unwrap_or(Behaviour::ReadyAfter(Duration::ZERO));
        Ok(Box::new(ScriptedProbe(behaviour)))
    }
}

fn container(image: &str) -> ResourceKind {
    ResourceKind::Container {
        image: image.to_string(),
        args: vec![],
        volumes: vec![],
    }
}

fn project(binary: &str) -> ResourceKind {
    ResourceKind::Project {
        binary: binary.to_string(),
        args: vec![],
        working_dir: None,
    }
}

fn orchestrator(model: AppModel, probes: ScriptedProbes) -> (Orchestrator, Journal) {
    let journal = Journal::default();
    let controller = LifecycleController::empty().with_launcher(FakeLauncher {
        journal: journal.clone(),
    });
    let orchestrator = Orchestrator::new(model)
        .with_controller(controller)
        .with_probes(probes);
    (orchestrator, journal)
}

#[smol_potat::test]
async fn test_api_starts_with_resolved_db_connection_string() {
    let mut registry = Registry::new();
    registry
        .declare(
            "db",
            ResourceKind::External {
                connection_string: "Host=db.internal;Port=5432".to_string(),
            },
            ResourceConfig::new(),
        )
        .unwrap();
    registry
        .declare("api", project("./api"), ResourceConfig::new())
        .unwrap();
    registry.add_wait_for("api", "db").unwrap();
    registry.add_reference("api", "db").unwrap();

    let (orchestrator, journal) = orchestrator(
        registry.build().unwrap(),
        ScriptedProbes::default().with("db", Behaviour::ReadyAfter(Duration::from_millis(50))),
    );
    let plan = orchestrator.plan().unwrap();
    assert_eq!(
        plan.batches(),
        &[vec!["db".to_string()], vec!["api".to_string()]]
    );

    let started = Instant::now();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));

    assert_eq!(deployment.state("db"), Some(ReadinessState::Ready));
    assert_eq!(deployment.state("api"), Some(ReadinessState::Ready));
    assert!(deployment.report().is_success());
    assert_eq!(journal.started_names(), vec!["db", "api"]);
    assert_eq!(
        journal.env_of("api").get("ConnectionStrings__db").map(String::as_str),
        Some("Host=db.internal;Port=5432")
    );
}

#[smol_potat::test]
async fn test_failure_isolation() {
    let mut registry = Registry::new();
    registry
        .declare(
            "cache",
            container("redis:7"),
            ResourceConfig::new().with_probe_policy(ProbePolicy {
                timeout: Duration::from_millis(100),
                ..ProbePolicy::default()
            }),
        )
        .unwrap();
    registry
        .declare("api", project("./api"), ResourceConfig::new())
        .unwrap();
    registry
        .declare("frontend", project("./frontend"), ResourceConfig::new())
        .unwrap();
    registry
        .declare("worker", project("./worker"), ResourceConfig::new())
        .unwrap();
    registry.add_wait_for("api", "cache").unwrap();
    registry.add_wait_for("frontend", "api").unwrap();

    let (orchestrator, journal) = orchestrator(
        registry.build().unwrap(),
        ScriptedProbes::default().with("cache", Behaviour::Hang),
    );
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();

    assert_eq!(deployment.state("cache"), Some(ReadinessState::Failed));
    assert_eq!(
        deployment.failure("cache"),
        Some(FailureCause::Timeout {
            timeout: Duration::from_millis(100)
        })
    );
    // The failed resource was torn down right away
    assert_eq!(journal.stopped(), vec!["cache"]);
    assert!(deployment.handle("cache").is_none());

    // Dependents are failed transitively and never started
    assert_eq!(
        deployment.failure("api"),
        Some(FailureCause::Upstream {
            producer: "cache".to_string()
        })
    );
    assert_eq!(
        deployment.failure("frontend"),
        Some(FailureCause::Upstream {
            producer: "api".to_string()
        })
    );
    assert!(!journal.started_names().contains(&"api".to_string()));
    assert!(!journal.started_names().contains(&"frontend".to_string()));

    // The independent branch is unaffected
    assert_eq!(deployment.state("worker"), Some(ReadinessState::Ready));

    let report = deployment.report();
    assert!(!report.is_success());
    assert_eq!(report.ready, vec!["worker"]);
    assert_eq!(report.failed.len(), 3);
    assert!(report.into_result().is_err());
}

fn secret_model() -> AppModel {
    let mut registry = Registry::new();
    registry
        .add_parameter(Parameter::secret(
            "pw",
            ParameterSource::Store {
                key: "db-password".to_string(),
            },
        ))
        .unwrap();
    registry
        .declare(
            "db",
            ResourceKind::External {
                connection_string: "Host=db.internal;Password={params.pw}".to_string(),
            },
            ResourceConfig::new(),
        )
        .unwrap();
    registry
        .declare("api", project("./api"), ResourceConfig::new())
        .unwrap();
    registry
        .declare("web", project("./web"), ResourceConfig::new())
        .unwrap();
    registry.add_reference("api", "db").unwrap();
    registry.add_wait_for("web", "api").unwrap();
    registry.build().unwrap()
}

#[smol_potat::test]
async fn test_unavailable_secret_fails_its_consumers() {
    let (orchestrator, journal) = orchestrator(secret_model(), ScriptedProbes::default());
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();

    // The producer itself never renders its connection string
    assert_eq!(deployment.state("db"), Some(ReadinessState::Ready));

    assert_eq!(deployment.state("api"), Some(ReadinessState::Failed));
    assert!(matches!(
        deployment.failure("api"),
        Some(FailureCause::SecretUnavailable { parameter, .. }) if parameter == "pw"
    ));
    assert_eq!(
        deployment.failure("web"),
        Some(FailureCause::Upstream {
            producer: "api".to_string()
        })
    );
    assert_eq!(journal.started_names(), vec!["db"]);

    deployment.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_secret_store_supplies_parameters() {
    let (orchestrator, journal) = orchestrator(secret_model(), ScriptedProbes::default());
    let orchestrator = orchestrator
        .with_secret_store(MemorySecretStore::new().with("db-password", "hunter2"));
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();

    assert!(deployment.report().is_success());
    assert_eq!(
        journal.env_of("api").get("ConnectionStrings__db").map(String::as_str),
        Some("Host=db.internal;Password=hunter2")
    );
    assert_eq!(journal.started_names(), vec!["db", "api", "web"]);

    deployment.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_shutdown_in_reverse_dependency_order() {
    let mut registry = Registry::new();
    registry
        .declare("web", project("./web"), ResourceConfig::new())
        .unwrap();
    registry
        .declare("api", project("./api"), ResourceConfig::new())
        .unwrap();
    registry
        .declare("db", container("postgres:16"), ResourceConfig::new())
        .unwrap();
    registry.add_wait_for("web", "api").unwrap();
    registry.add_wait_for("api", "db").unwrap();

    let (orchestrator, journal) =
        orchestrator(registry.build().unwrap(), ScriptedProbes::default());
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();
    assert_eq!(journal.started_names(), vec!["db", "api", "web"]);

    deployment.shutdown().await.unwrap();
    assert_eq!(journal.stopped(), vec!["web", "api", "db"]);
    for name in ["web", "api", "db"] {
        assert_eq!(deployment.state(name), Some(ReadinessState::Stopped));
    }
}

#[smol_potat::test]
async fn test_shutdown_cancels_pending_starts() {
    let mut registry = Registry::new();
    registry
        .declare(
            "db",
            container("postgres:16"),
            ResourceConfig::new().with_probe_policy(ProbePolicy {
                timeout: Duration::from_secs(30),
                max_attempts: 10,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(5),
            }),
        )
        .unwrap();
    registry
        .declare("api", project("./api"), ResourceConfig::new())
        .unwrap();
    registry.add_wait_for("api", "db").unwrap();

    let (orchestrator, journal) = orchestrator(
        registry.build().unwrap(),
        ScriptedProbes::default().with("db", Behaviour::NotReady),
    );
    let plan = orchestrator.plan().unwrap();

    let shutdown = Shutdown::new();
    let trigger = {
        let shutdown = shutdown.clone();
        smol::spawn(async move {
            Timer::after(Duration::from_millis(50)).await;
            shutdown.trigger();
        })
    };

    let started = Instant::now();
    let deployment = orchestrator.run(&plan, &shutdown).await.unwrap();
    trigger.await;

    // The backoff sleep is interrupted instead of running to completion
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(deployment.state("db"), Some(ReadinessState::Stopped));
    assert_eq!(deployment.state("api"), Some(ReadinessState::Stopped));
    assert_eq!(journal.started_names(), vec!["db"]);
    assert_eq!(journal.stopped(), vec!["db"]);
    assert!(deployment.report().into_result().is_ok());
}

#[smol_potat::test]
async fn test_endpoints_and_status() {
    let mut registry = Registry::new();
    registry
        .declare(
            "api",
            project("./api"),
            ResourceConfig::new()
                .with_endpoint(EndpointSpec::new("http", "http").with_env("PORT"))
                .with_env("PUBLIC_URL", "{url}"),
        )
        .unwrap();
    registry
        .declare("frontend", project("./frontend"), ResourceConfig::new())
        .unwrap();
    registry.add_reference("frontend", "api").unwrap();

    let (orchestrator, journal) =
        orchestrator(registry.build().unwrap(), ScriptedProbes::default());
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();

    let api_env = journal.env_of("api");
    let port = api_env.get("PORT").cloned().unwrap();
    let url = format!("http://localhost:{port}");
    assert_eq!(api_env.get("PUBLIC_URL"), Some(&url));

    let frontend_env = journal.env_of("frontend");
    assert_eq!(frontend_env.get("services__api__http__0"), Some(&url));
    assert!(!frontend_env.contains_key("ConnectionStrings__api"));

    let status = deployment.status();
    assert_eq!(status[0].name, "api");
    assert_eq!(status[0].endpoints.get("http"), Some(&url));
    assert_eq!(status[1].state, ReadinessState::Ready);

    let logs: Vec<String> = deployment.logs("api").await.unwrap().collect().await;
    assert_eq!(logs, vec!["api log"]);
}

#[cfg(unix)]
#[smol_potat::test]
async fn test_real_process_receives_environment() {
    let mut registry = Registry::new();
    registry
        .declare(
            "db",
            ResourceKind::External {
                connection_string: "Host=db.internal".to_string(),
            },
            ResourceConfig::new(),
        )
        .unwrap();
    registry
        .declare(
            "api",
            ResourceKind::Project {
                binary: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "echo \"$ConnectionStrings__db\"; exec sleep 30".to_string(),
                ],
                working_dir: None,
            },
            ResourceConfig::new().with_shutdown_grace(Duration::from_secs(2)),
        )
        .unwrap();
    registry.add_reference("api", "db").unwrap();

    let orchestrator = Orchestrator::new(registry.build().unwrap());
    let plan = orchestrator.plan().unwrap();
    let deployment = orchestrator.run(&plan, &Shutdown::new()).await.unwrap();

    assert_eq!(deployment.state("api"), Some(ReadinessState::Ready));
    assert!(deployment.status()[1].pid.is_some());

    let first_line = deployment.logs("api").await.unwrap().next().await;
    assert_eq!(first_line.as_deref(), Some("Host=db.internal"));

    let started = Instant::now();
    deployment.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(deployment.state("api"), Some(ReadinessState::Stopped));
}
