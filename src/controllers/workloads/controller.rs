use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PartialObjectMeta, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::*;

use super::reconciler::{jittered, Reconciler};
use super::reconcilers::cache::InjectionCache;
use super::reconcilers::webhook::WebhookClient;
use crate::controllers::{Diagnostics, LastDecision, State};
use crate::metrics::Metrics;
use crate::resources::{KubeCluster, WorkloadKey, WorkloadKind};
use crate::telemetry;
use crate::{Error, ErrorClass, Result};

/// Only pods the mesh has injected carry this label
pub const INJECTED_POD_LABEL: &str = "security.istio.io/tlsMode";

pub(super) struct Context {
    pub reconciler: Reconciler,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub backoff: ErrorBackoff,
}

/// Per-workload exponential backoff for failed passes. A successful pass resets it.
pub(super) struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<WorkloadKey, u32>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record one more failure for `key` and return how long to wait before retrying
    pub fn next(&self, key: &WorkloadKey) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(key.clone()).or_default();
        *count = count.saturating_add(1);

        let exponent = (*count - 1).min(16);
        self.base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn reset(&self, key: &WorkloadKey) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}

fn workload_key<K: Resource<DynamicType = ()>>(obj: &K) -> Result<WorkloadKey> {
    let kind = K::kind(&());
    let kind = WorkloadKind::from_kind(&kind)
        .ok_or_else(|| Error::InvariantViolation(format!("unexpected kind {kind}")))?;
    Ok(WorkloadKey::new(
        kind,
        obj.namespace().unwrap_or_default(),
        obj.name_any(),
    ))
}

#[instrument(skip(obj, ctx), fields(trace_id, workload))]
async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: Resource<DynamicType = ()>,
{
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let key = workload_key(obj.as_ref())?;
    Span::current().record("workload", field::display(&key));
    let _timer = ctx.metrics.count_and_measure(key.kind);
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!(
        "Reconciling {} {} in namespace {}",
        key.kind, key.name, key.namespace
    );

    match ctx.reconciler.reconcile(&key).await {
        Ok(outcome) => {
            ctx.backoff.reset(&key);
            if let Some(decision) = outcome.decision {
                ctx.metrics.decision(key.kind, decision);
            }

            let mut diagnostics = ctx.diagnostics.write().await;
            diagnostics.cache_entries = ctx.reconciler.cache().len();
            if let Some(decision) = outcome.decision {
                diagnostics.last_decision = Some(LastDecision {
                    workload: key.to_string(),
                    decision: decision.to_string(),
                    reason: outcome.reason.clone(),
                    at: Utc::now(),
                });
            }

            Ok(outcome.action())
        }
        Err(err) => {
            warn!("reconcile of {key} failed: {err}");
            ctx.metrics.reconcile_failure(key.kind, &key.name, &err);
            Err(err)
        }
    }
}

fn error_policy<K>(obj: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let Ok(key) = workload_key(obj.as_ref()) else {
        return Action::await_change();
    };

    if err.class() == ErrorClass::Fatal {
        error!("{key} hit an unexpected error: {err}");
    }

    let delay = ctx.backoff.next(&key);
    Action::requeue(jittered(&key, delay, Utc::now()))
}

/// Only spec changes trigger a pass; status churn is covered by the pod watch
fn generation_predicate<K: Resource>(obj: &K) -> Option<u64> {
    obj.meta().generation.map(|g| g as u64)
}

fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Map a pod to the workload that directly controls it, if that workload is a `K`
fn pod_owner<K>(pod: PartialObjectMeta<Pod>) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = pod.namespace()?;
    let owner = controller_owner(&pod.metadata)?;
    (owner.kind == K::kind(&())).then(|| ObjectRef::new(&owner.name).within(&namespace))
}

fn injected_pods(
    client: &Client,
) -> impl Stream<Item = Result<PartialObjectMeta<Pod>, watcher::Error>> + Send + 'static {
    metadata_watcher(
        Api::<Pod>::all(client.clone()),
        watcher::Config::default().labels(INJECTED_POD_LABEL),
    )
    .touched_objects()
    .default_backoff()
}

async fn run_controller<K>(
    client: &Client,
    ctx: Arc<Context>,
    config: controller::Config,
    wire: impl FnOnce(Controller<K>) -> Controller<K>,
) where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let (store, writer) = reflector::store();
    let workloads = reflector(
        writer,
        watcher(Api::<K>::all(client.clone()), watcher::Config::default()),
    )
    .touched_objects()
    .default_backoff()
    .predicate_filter(generation_predicate);

    let controller = Controller::for_stream(workloads, store)
        .with_config(config)
        .shutdown_on_signal();

    wire(controller)
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// Run one controller per workload kind until a shutdown signal arrives
pub async fn run(client: Client, metrics: Metrics, state: State) -> Result<()> {
    let config = state.config.clone();

    let deployments: Api<Deployment> = Api::all(client.clone());
    if let Err(e) = deployments.list(&ListParams::default().limit(1)).await {
        error!("Deployments are not queryable; {e:?}. Check the RBAC rules of the operator");
        return Err(e.into());
    }

    let reconciler = Reconciler::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(WebhookClient::new(&config)?),
        Arc::new(InjectionCache::new()),
        config.clone(),
        metrics.clone(),
    );
    let ctx = Arc::new(Context {
        reconciler,
        diagnostics: state.diagnostics.clone(),
        metrics,
        backoff: ErrorBackoff::new(config.error_backoff_base, config.error_backoff_max),
    });

    let controller_config = controller::Config::default()
        .debounce(config.debounce)
        .concurrency(config.concurrency);

    info!(
        "Watching Deployments, StatefulSets and DaemonSets for outdated {} sidecars",
        config.sidecar_container
    );

    // pods of a deployment are owned by one of its replicasets
    let (replicasets_store, replicasets_writer) = reflector::store();
    let replicaset_reflector = reflector(
        replicasets_writer,
        metadata_watcher(Api::<ReplicaSet>::all(client.clone()), watcher::Config::default()),
    )
    .touched_objects()
    .default_backoff();

    let deployment_controller = run_controller::<Deployment>(
        &client,
        ctx.clone(),
        controller_config.clone(),
        |controller| {
            controller
                .owns_stream(replicaset_reflector)
                .watches_stream(
                    injected_pods(&client),
                    move |pod: PartialObjectMeta<Pod>| {
                        let namespace = pod.namespace()?;
                        let owner = controller_owner(&pod.metadata)?;
                        if owner.kind != "ReplicaSet" {
                            return None;
                        }
                        let replicaset = replicasets_store
                            .get(&ObjectRef::new(&owner.name).within(&namespace))?;
                        let deployment = controller_owner(&replicaset.metadata)?;
                        (deployment.kind == "Deployment")
                            .then(|| ObjectRef::new(&deployment.name).within(&namespace))
                    },
                )
        },
    );

    let statefulset_controller = run_controller::<StatefulSet>(
        &client,
        ctx.clone(),
        controller_config.clone(),
        |controller| controller.watches_stream(injected_pods(&client), pod_owner::<StatefulSet>),
    );

    let daemonset_controller = run_controller::<DaemonSet>(
        &client,
        ctx,
        controller_config,
        |controller| controller.watches_stream(injected_pods(&client), pod_owner::<DaemonSet>),
    );

    futures::join!(
        deployment_controller,
        statefulset_controller,
        daemonset_controller
    );
    Ok(())
}
