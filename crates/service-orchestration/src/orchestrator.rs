//! Readiness-gated startup of a whole app model.
//!
//! [`Orchestrator::run`] drives one task per resource. Each task waits for
//! the resources it depends on to settle, resolves its environment, starts
//! the resource and probes it until it is ready or has failed. Tasks run
//! concurrently, so a resource starts as soon as its own producers are
//! ready regardless of which batch it was planned in.

use crate::readiness::{DefaultProbes, ProbeFactory, ProbeReport, ReadinessFailure, observe};
use crate::{
    AllocatedEndpoint, EndpointTable, Error, FailureCause, LaunchRequest, LifecycleController,
    LogStream, ParameterResolver, ReadinessState, ReferenceResolver, ResolvedReference,
    ResolvedValue, ResourceHandle, Result, SecretStore, Shutdown, StartupPlan, StateBoard,
    StateCell, scheduler,
};
use app_model::{AppModel, ExecutionMode, ResourceNode};
use futures::future::{Either, join_all, select};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Runs an [`AppModel`]
pub struct Orchestrator {
    model: Arc<AppModel>,
    controller: Arc<LifecycleController>,
    probes: Arc<dyn ProbeFactory>,
    secrets: Option<Arc<dyn SecretStore>>,
    env: HashMap<String, String>,
}

impl Orchestrator {
    /// Orchestrator with the built-in launchers and readiness probes
    pub fn new(model: AppModel) -> Self {
        Self {
            model: Arc::new(model),
            controller: Arc::new(LifecycleController::new()),
            probes: Arc::new(DefaultProbes),
            secrets: None,
            env: HashMap::new(),
        }
    }

    /// Use a custom lifecycle controller
    pub fn with_controller(mut self, controller: LifecycleController) -> Self {
        self.controller = Arc::new(controller);
        self
    }

    /// Use a custom probe factory
    pub fn with_probes(mut self, probes: impl ProbeFactory + 'static) -> Self {
        self.probes = Arc::new(probes);
        self
    }

    /// Secret store backing `store` parameters
    pub fn with_secret_store(mut self, store: impl SecretStore + 'static) -> Self {
        self.secrets = Some(Arc::new(store));
        self
    }

    /// Override a process environment variable for `env` parameters
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The model being run
    pub fn model(&self) -> &AppModel {
        &self.model
    }

    /// Startup plan of the model
    pub fn plan(&self) -> Result<StartupPlan> {
        scheduler::plan(&self.model)
    }

    /// Start every resource of the plan.
    ///
    /// Returns once every resource has settled: ready, failed, or stopped
    /// because shutdown was requested. Individual failures are recorded in
    /// the returned [`Deployment`]; they do not fail the call.
    pub async fn run(&self, plan: &StartupPlan, shutdown: &Shutdown) -> Result<Deployment> {
        if self.model.mode() == ExecutionMode::Publish {
            return Err(Error::PublishMode);
        }
        for name in plan.order() {
            if self.model.resource(name).is_none() {
                return Err(Error::ResourceNotFound(name.to_string()));
            }
        }
        if let Some(missing) = self
            .model
            .resources()
            .find(|node| plan.batch_of(node.name()).is_none())
        {
            return Err(Error::ResourceNotFound(missing.name().to_string()));
        }

        let states = StateBoard::new(plan.order());
        let endpoints = EndpointTable::default();
        let parameters = Arc::new(ParameterResolver::new(
            self.model.parameters(),
            self.secrets.clone(),
            self.env.clone(),
        ));
        let resolver = Arc::new(ReferenceResolver::new(
            self.model.clone(),
            states.clone(),
            endpoints.clone(),
            parameters,
        ));
        let run = Run {
            states,
            endpoints,
            resolver,
            shutdown: shutdown.clone(),
            handles: Mutex::new(IndexMap::new()),
        };

        info!(
            "Starting {} resource(s) in {} batch(es)",
            plan.len(),
            plan.batches().len()
        );
        let tasks = plan
            .order()
            .filter_map(|name| self.model.resource(name))
            .map(|node| self.start_node(&run, node));
        join_all(tasks).await;

        let Run {
            states,
            endpoints,
            resolver,
            handles,
            ..
        } = run;
        let deployment = Deployment {
            model: self.model.clone(),
            controller: self.controller.clone(),
            plan: plan.clone(),
            states,
            endpoints,
            resolver,
            handles: handles.into_inner().unwrap_or_else(PoisonError::into_inner),
        };

        let report = deployment.report();
        info!(
            "Startup finished: {} ready, {} failed, {} stopped",
            report.ready.len(),
            report.failed.len(),
            report.stopped.len()
        );
        Ok(deployment)
    }

    async fn start_node(&self, run: &Run, node: &ResourceNode) {
        let name = node.name();
        let Some(cell) = run.states.cell(name).cloned() else {
            return;
        };

        match wait_for_producers(run, node).await {
            Gate::Open => {}
            Gate::Upstream(producer) => {
                warn!("Not starting '{}': '{}' failed", name, producer);
                let _ = cell.fail(FailureCause::Upstream { producer });
                return;
            }
            Gate::Cancelled => {
                debug!("Start of '{}' cancelled", name);
                let _ = cell.transition(ReadinessState::Stopped);
                return;
            }
        }

        if let Err(e) = cell.transition(ReadinessState::Starting) {
            warn!("{}", e);
            return;
        }

        let handle = match self.launch(run, node).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to start '{}': {}", name, e);
                let _ = cell.fail(FailureCause::from_error(&e));
                return;
            }
        };
        run.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handle.clone());

        self.await_readiness(run, node, &cell, handle).await;
    }

    async fn launch(&self, run: &Run, node: &ResourceNode) -> Result<Arc<dyn ResourceHandle>> {
        let mut endpoints = IndexMap::new();
        if !node.is_existing() {
            for spec in &node.config().endpoints {
                let endpoint = AllocatedEndpoint::allocate(spec)?;
                debug!("'{}' endpoint '{}' at {}", node.name(), spec.name, endpoint.url());
                endpoints.insert(spec.name.clone(), endpoint);
            }
        }
        run.endpoints.insert(node.name(), endpoints.clone());

        let mut env: IndexMap<String, ResolvedValue> = IndexMap::new();
        for spec in &node.config().endpoints {
            if let (Some(var), Some(endpoint)) = (&spec.env, endpoints.get(&spec.name)) {
                env.insert(var.clone(), ResolvedValue::plain(endpoint.port.to_string()));
            }
        }
        for edge in node.references() {
            let reference = run.resolver.resolve(edge).await?;
            env.extend(reference.env_bindings());
        }
        for (key, raw) in &node.config().env {
            let value = run.resolver.render(node, raw).await?;
            env.insert(key.clone(), value);
        }

        self.controller
            .start(LaunchRequest {
                resource: node.clone(),
                env,
                endpoints,
            })
            .await
    }

    async fn await_readiness(
        &self,
        run: &Run,
        node: &ResourceNode,
        cell: &StateCell,
        handle: Arc<dyn ResourceHandle>,
    ) {
        let name = node.name();
        let probe = match self.probes.probe_for(node, &handle) {
            Ok(probe) => probe,
            Err(e) => {
                warn!("No readiness probe for '{}': {}", name, e);
                self.tear_down(run, node).await;
                let _ = cell.fail(FailureCause::from_error(&e));
                return;
            }
        };
        debug!("Probing '{}' with {}", name, probe.describe());

        let policy = node.config().readiness.policy;
        let mut reports = observe(probe, handle, policy, run.shutdown.clone());
        let mut terminal = None;
        while let Some(report) = reports.next().await {
            match &report {
                ProbeReport::Retrying {
                    attempt,
                    delay,
                    reason,
                } => debug!(
                    "'{}' not ready (attempt {}): {}; retrying in {:?}",
                    name, attempt, reason, delay
                ),
                ProbeReport::Starting => debug!("Waiting for '{}' to become ready", name),
                _ => {}
            }
            if report.is_terminal() {
                terminal = Some(report);
            }
        }

        let failure = match terminal {
            Some(ProbeReport::Ready { attempts }) => {
                info!("'{}' is ready ({} attempt(s))", name, attempts);
                if let Err(e) = cell.transition(ReadinessState::Ready) {
                    warn!("{}", e);
                }
                return;
            }
            Some(ProbeReport::Failed(ReadinessFailure::Cancelled)) => {
                info!("Readiness of '{}' cancelled by shutdown", name);
                self.tear_down(run, node).await;
                let _ = cell.transition(ReadinessState::Stopped);
                return;
            }
            Some(ProbeReport::Failed(ReadinessFailure::Timeout { timeout })) => {
                FailureCause::Timeout { timeout }
            }
            Some(ProbeReport::Failed(ReadinessFailure::ProbeFailed { reason, .. })) => {
                FailureCause::ProbeFailed { reason }
            }
            Some(ProbeReport::Failed(ReadinessFailure::Crashed { reason })) => {
                FailureCause::Crashed { reason }
            }
            _ => FailureCause::ProbeFailed {
                reason: "probe ended without a result".to_string(),
            },
        };

        warn!("'{}' failed: {}", name, failure);
        self.tear_down(run, node).await;
        let _ = cell.fail(failure);
    }

    /// Stop a resource that will not become ready
    async fn tear_down(&self, run: &Run, node: &ResourceNode) {
        let handle = run
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(node.name());
        if let Some(handle) = handle {
            let grace = self.controller.grace_for(node);
            if let Err(e) = self.controller.stop(handle.as_ref(), grace).await {
                warn!("Failed to stop '{}': {}", node.name(), e);
            }
        }
    }
}

/// Shared state of one run
struct Run {
    states: StateBoard,
    endpoints: EndpointTable,
    resolver: Arc<ReferenceResolver>,
    shutdown: Shutdown,
    handles: Mutex<IndexMap<String, Arc<dyn ResourceHandle>>>,
}

enum Gate {
    Open,
    Upstream(String),
    Cancelled,
}

/// Wait until every producer of `node` has settled
async fn wait_for_producers(run: &Run, node: &ResourceNode) -> Gate {
    let mut pending: FuturesUnordered<_> = node
        .producers()
        .into_iter()
        .filter_map(|producer| run.states.cell(producer).cloned())
        .map(|cell| async move {
            let state = cell.settled().await;
            (cell.name().to_string(), state)
        })
        .collect();

    let gate = async move {
        while let Some((producer, state)) = pending.next().await {
            match state {
                ReadinessState::Ready => {}
                ReadinessState::Failed => return Gate::Upstream(producer),
                _ => return Gate::Cancelled,
            }
        }
        Gate::Open
    };

    let gate = match select(pin!(gate), pin!(run.shutdown.wait())).await {
        Either::Left((gate, _)) => gate,
        Either::Right(_) => Gate::Cancelled,
    };
    match gate {
        Gate::Open if run.shutdown.is_triggered() => Gate::Cancelled,
        gate => gate,
    }
}

/// Status row of one resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Resource name
    pub name: String,
    /// Kind label
    pub kind: String,
    /// Current state
    pub state: ReadinessState,
    /// Failure description, if failed
    pub failure: Option<String>,
    /// Process ID, if running as a process
    pub pid: Option<u32>,
    /// Container ID, if running as a container
    pub container_id: Option<String>,
    /// Endpoint name -> URL
    pub endpoints: IndexMap<String, String>,
}

/// Outcome of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Ready resources
    pub ready: Vec<String>,
    /// Failed resources with their causes
    pub failed: Vec<(String, FailureCause)>,
    /// Stopped or never started resources
    pub stopped: Vec<String>,
}

impl RunReport {
    /// Whether every resource is ready
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.stopped.is_empty()
    }

    /// The first failure as an error
    pub fn into_result(self) -> Result<()> {
        match self.failed.into_iter().next() {
            Some((name, cause)) => Err(cause.into_error(&name)),
            None => Ok(()),
        }
    }
}

/// The started resources of a run
pub struct Deployment {
    model: Arc<AppModel>,
    controller: Arc<LifecycleController>,
    plan: StartupPlan,
    states: StateBoard,
    endpoints: EndpointTable,
    resolver: Arc<ReferenceResolver>,
    handles: IndexMap<String, Arc<dyn ResourceHandle>>,
}

impl Deployment {
    /// State board of the run
    pub fn states(&self) -> &StateBoard {
        &self.states
    }

    /// Current state of a resource
    pub fn state(&self, name: &str) -> Option<ReadinessState> {
        self.states.state(name)
    }

    /// Failure cause of a resource
    pub fn failure(&self, name: &str) -> Option<FailureCause> {
        self.states.failure(name)
    }

    /// Handle of a started resource
    pub fn handle(&self, name: &str) -> Option<&Arc<dyn ResourceHandle>> {
        self.handles.get(name)
    }

    /// The plan this deployment was started from
    pub fn plan(&self) -> &StartupPlan {
        &self.plan
    }

    /// The value `consumer` received for its reference to `producer`
    pub async fn resolved_reference(
        &self,
        consumer: &str,
        producer: &str,
    ) -> Result<ResolvedReference> {
        let node = self
            .model
            .resource(consumer)
            .ok_or_else(|| Error::ResourceNotFound(consumer.to_string()))?;
        let edge = node
            .references()
            .find(|edge| edge.producer == producer)
            .ok_or_else(|| Error::Resolution {
                resource: consumer.to_string(),
                reason: format!("no reference to '{producer}'"),
            })?;
        self.resolver.resolve(edge).await
    }

    /// Log lines of a started resource
    pub async fn logs(&self, name: &str) -> Result<LogStream> {
        let handle = self
            .handles
            .get(name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;
        self.controller.logs_of(handle.as_ref()).await
    }

    /// Status of every resource in plan order
    pub fn status(&self) -> Vec<ResourceStatus> {
        self.plan
            .order()
            .filter_map(|name| self.model.resource(name))
            .map(|node| {
                let name = node.name();
                let info = self.handles.get(name).map(|handle| handle.info());
                ResourceStatus {
                    name: name.to_string(),
                    kind: node.kind().label().to_string(),
                    state: self.states.state(name).unwrap_or(ReadinessState::Pending),
                    failure: self.states.failure(name).map(|cause| cause.to_string()),
                    pid: info.and_then(|info| info.pid),
                    container_id: info.and_then(|info| info.container_id.clone()),
                    endpoints: self
                        .endpoints
                        .of(name)
                        .into_iter()
                        .map(|(endpoint, allocated)| (endpoint, allocated.url()))
                        .collect(),
                }
            })
            .collect()
    }

    /// Summary of the current states
    pub fn report(&self) -> RunReport {
        let mut report = RunReport::default();
        for (name, state) in self.states.snapshot() {
            match state {
                ReadinessState::Ready => report.ready.push(name),
                ReadinessState::Failed => {
                    let cause = self.states.failure(&name).unwrap_or_else(|| {
                        FailureCause::Resolution {
                            reason: "unknown failure".to_string(),
                        }
                    });
                    report.failed.push((name, cause));
                }
                _ => report.stopped.push(name),
            }
        }
        report
    }

    /// Stop every started resource, dependents before their producers.
    ///
    /// Resources in one batch are stopped concurrently. Every resource is
    /// stopped even if some fail to stop; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down {} resource(s)", self.handles.len());
        let mut first_error = None;

        for batch in self.plan.shutdown_order() {
            let stops = batch.iter().filter_map(|name| {
                let handle = self.handles.get(name)?;
                let node = self.model.resource(name)?;
                let grace = self.controller.grace_for(node);
                Some(async move {
                    let result = self.controller.stop(handle.as_ref(), grace).await;
                    (name, result)
                })
            });

            for (name, result) in join_all(stops).await {
                if let Err(e) = result {
                    warn!("Failed to stop '{}': {}", name, e);
                    first_error.get_or_insert(e);
                }
                if let Some(cell) = self.states.cell(name) {
                    if matches!(cell.state(), ReadinessState::Ready | ReadinessState::Failed) {
                        let _ = cell.transition(ReadinessState::Stopped);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Shutdown complete");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("plan", &self.plan)
            .field("states", &self.states.snapshot())
            .finish()
    }
}
