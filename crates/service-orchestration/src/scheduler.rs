//! Startup planning.

use crate::Result;
use app_model::{AppModel, DependencyGraph};
use serde::Serialize;
use tracing::debug;

/// Resources grouped into startup batches.
///
/// Every producer sits in an earlier batch than its consumers. Batches are
/// informational for startup, where each resource starts as soon as its own
/// producers are ready, and authoritative for shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupPlan {
    batches: Vec<Vec<String>>,
}

impl StartupPlan {
    /// Layer a dependency graph by longest path, ties in declaration order
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self> {
        let batches = graph.layers()?;
        debug!("Startup plan: {:?}", batches);
        Ok(Self { batches })
    }

    /// Batches in startup order
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Every resource in startup order
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }

    /// Index of the batch containing `name`
    pub fn batch_of(&self, name: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|member| member == name))
    }

    /// Batches in shutdown order: dependents before their producers
    pub fn shutdown_order(&self) -> impl Iterator<Item = &[String]> {
        self.batches.iter().rev().map(Vec::as_slice)
    }

    /// Number of resources in the plan
    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Whether the plan is empty
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Plan the startup of every resource in `model`
pub fn plan(model: &AppModel) -> Result<StartupPlan> {
    StartupPlan::from_graph(model.graph())
}
