use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::client::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{Config, Metrics, Result};

pub mod workloads;

/// The most recent decision taken by any reconcile pass
#[derive(Clone, Debug, Serialize)]
pub struct LastDecision {
    pub workload: String,
    pub decision: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub last_decision: Option<LastDecision>,
    pub cache_entries: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            last_decision: None,
            cache_entries: 0,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Validated settings, shared read-only with every pass
    pub config: Arc<Config>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: Config) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            config: Arc::new(config),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Connect to the cluster and run the controllers until shutdown
pub async fn run(state: State) -> Result<()> {
    let client = Client::try_default().await?;
    let metrics = Metrics::default().register(&state.registry)?;
    workloads::run(client, metrics, state).await
}
