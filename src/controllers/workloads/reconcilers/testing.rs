//! In-memory stand-ins for the API server and the injection webhook.
//!
//! Every fake pod carries the label `tier=mesh` and every fake workload selects on it, so label
//! selection alone never decides ownership.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde_json::Value;

use super::annotator::restart_patch;
use super::webhook::{DesiredInjectionResult, InjectionWebhook, WebhookValidationError};
use crate::resources::{ClusterApi, Workload, WorkloadEvent, WorkloadKey, WorkloadRef};
use crate::{Error, Result};

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("tier".to_string(), "mesh".to_string())])
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: reason.into(),
        reason: reason.into(),
        code,
    }))
}

pub fn deployment(namespace: &str, name: &str, uid: &str, app_image: &str) -> Workload {
    Workload::Deployment(Deployment {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(uid.into()),
            resource_version: Some("1".into()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".into(),
                        image: Some(app_image.into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

pub fn statefulset(namespace: &str, name: &str, uid: &str, app_image: &str) -> Workload {
    let Workload::Deployment(d) = deployment(namespace, name, uid, app_image) else {
        unreachable!()
    };
    let spec = d.spec.unwrap();
    Workload::StatefulSet(StatefulSet {
        metadata: d.metadata,
        spec: Some(StatefulSetSpec {
            selector: spec.selector,
            template: spec.template,
            ..Default::default()
        }),
        status: None,
    })
}

/// Metadata of a ControllerRevision belonging to a StatefulSet
pub fn controller_revision_meta(
    namespace: &str,
    name: &str,
    uid: &str,
    statefulset: &str,
    statefulset_uid: &str,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        uid: Some(uid.into()),
        labels: Some(labels()),
        owner_references: Some(vec![owner("StatefulSet", statefulset, statefulset_uid)]),
        ..Default::default()
    }
}

fn owner(kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".into(),
        kind: kind.into(),
        name: name.into(),
        uid: uid.into(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn replica_set_meta(
    namespace: &str,
    name: &str,
    uid: &str,
    deployment: &str,
    deployment_uid: &str,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        uid: Some(uid.into()),
        labels: Some(labels()),
        owner_references: Some(vec![owner("Deployment", deployment, deployment_uid)]),
        ..Default::default()
    }
}

/// A running pod with an `istio-proxy` sidecar on `proxy_image`
pub fn pod_owned_by(
    namespace: &str,
    name: &str,
    owner_kind: &str,
    owner_name: &str,
    owner_uid: &str,
    proxy_image: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels()),
            owner_references: Some(vec![owner(owner_kind, owner_name, owner_uid)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![
                Container {
                    name: "app".into(),
                    image: Some("app:1".into()),
                    ..Default::default()
                },
                Container {
                    name: "istio-proxy".into(),
                    image: Some(proxy_image.into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(vec![ContainerStatus {
                name: "istio-proxy".into(),
                image: proxy_image.into(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[derive(Default)]
struct ClusterState {
    workloads: BTreeMap<WorkloadKey, Workload>,
    pods: Vec<Pod>,
    replica_sets: Vec<ObjectMeta>,
    controller_revisions: Vec<ObjectMeta>,
    patches: Vec<(WorkloadKey, Value)>,
    events: Vec<WorkloadEvent>,
    conflicts_left: usize,
    competing_write: Option<(String, String)>,
}

/// An API server that applies merge patches to the pod template annotations and enforces
/// `metadata.resourceVersion` preconditions.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    workload_reads: AtomicUsize,
    fail_pod_list: AtomicBool,
}

impl FakeCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Store `workload`, replacing any previous version with a newer resourceVersion
    pub fn add_workload(&self, mut workload: Workload) {
        let key = workload.key();
        let mut state = self.state();
        let version = state
            .workloads
            .get(&key)
            .and_then(|w| w.resource_version())
            .and_then(|rv| rv.parse::<u64>().ok())
            .map_or(1, |rv| rv + 1);
        meta_mut(&mut workload).resource_version = Some(version.to_string());
        state.workloads.insert(key, workload);
    }

    pub fn remove_workload(&self, namespace: &str, name: &str) {
        self.state()
            .workloads
            .retain(|key, _| !(key.namespace == namespace && key.name == name));
    }

    pub fn pause(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        for (key, workload) in state.workloads.iter_mut() {
            if key.namespace == namespace && key.name == name {
                if let Workload::Deployment(d) = workload {
                    if let Some(spec) = d.spec.as_mut() {
                        spec.paused = Some(true);
                    }
                }
            }
        }
    }

    fn find(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.state()
            .workloads
            .iter()
            .find(|(key, _)| key.namespace == namespace && key.name == name)
            .map(|(_, w)| w.clone())
    }

    pub fn workload_ref(&self, namespace: &str, name: &str, annotation: &str) -> WorkloadRef {
        self.find(namespace, name)
            .expect("workload not stored")
            .to_ref(annotation)
            .unwrap()
    }

    pub fn template_annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.find(namespace, name)?
            .template_annotation(key)
            .map(str::to_owned)
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    pub fn add_replica_set(&self, meta: ObjectMeta) {
        self.state().replica_sets.push(meta);
    }

    pub fn add_controller_revision(&self, meta: ObjectMeta) {
        self.state().controller_revisions.push(meta);
    }

    /// Make every pod list fail with a 503
    pub fn fail_pod_list(&self) {
        self.fail_pod_list.store(true, Ordering::SeqCst);
    }

    /// Answer the next `n` patches with a conflict, as if someone else wrote first
    pub fn conflict_next_patches(&self, n: usize) {
        self.state().conflicts_left = n;
    }

    /// Before the next patch lands, let another writer set `annotation=value` first. The
    /// other write is accepted and bumps the resourceVersion; the patch itself gets a conflict.
    pub fn lose_next_patch_to(&self, annotation: &str, value: &str) {
        self.state().competing_write = Some((annotation.to_owned(), value.to_owned()));
    }

    /// Patches that were accepted
    pub fn patches(&self) -> Vec<(WorkloadKey, Value)> {
        self.state().patches.clone()
    }

    pub fn events(&self) -> Vec<WorkloadEvent> {
        self.state().events.clone()
    }

    pub fn workload_reads(&self) -> usize {
        self.workload_reads.load(Ordering::SeqCst)
    }
}

fn meta_mut(workload: &mut Workload) -> &mut ObjectMeta {
    match workload {
        Workload::Deployment(d) => &mut d.metadata,
        Workload::StatefulSet(s) => &mut s.metadata,
        Workload::DaemonSet(d) => &mut d.metadata,
    }
}

fn template_mut(workload: &mut Workload) -> Option<&mut PodTemplateSpec> {
    match workload {
        Workload::Deployment(d) => d.spec.as_mut().map(|s| &mut s.template),
        Workload::StatefulSet(s) => s.spec.as_mut().map(|s| &mut s.template),
        Workload::DaemonSet(d) => d.spec.as_mut().map(|s| &mut s.template),
    }
}

fn selects(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let Some((key, value)) = term.split_once('=') else {
            return false;
        };
        labels.and_then(|l| l.get(key)).map(String::as_str) == Some(value)
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>> {
        self.workload_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().workloads.get(key).cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        if self.fail_pod_list.load(Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| selects(selector, p.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn list_replica_sets(&self, namespace: &str, selector: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .state()
            .replica_sets
            .iter()
            .filter(|m| m.namespace.as_deref() == Some(namespace))
            .filter(|m| selects(selector, m.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .state()
            .controller_revisions
            .iter()
            .filter(|m| m.namespace.as_deref() == Some(namespace))
            .filter(|m| selects(selector, m.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn patch_workload(&self, key: &WorkloadKey, patch: &Value) -> Result<()> {
        let mut state = self.state();
        if state.conflicts_left > 0 {
            state.conflicts_left -= 1;
            return Err(Error::Conflict(key.to_string()));
        }

        if let Some((annotation, value)) = state.competing_write.take() {
            let current = state
                .workloads
                .get(key)
                .and_then(|w| w.resource_version())
                .unwrap_or_default()
                .to_owned();
            apply_patch(&mut state, key, &restart_patch(&annotation, &value, &current))?;
            return Err(Error::Conflict(key.to_string()));
        }

        apply_patch(&mut state, key, patch)
    }

    async fn publish_event(&self, _workload: &Workload, event: WorkloadEvent) -> Result<()> {
        self.state().events.push(event);
        Ok(())
    }
}

fn apply_patch(state: &mut ClusterState, key: &WorkloadKey, patch: &Value) -> Result<()> {
    let Some(workload) = state.workloads.get_mut(key) else {
        return Err(api_error(404, "NotFound"));
    };

    let current = workload.resource_version().unwrap_or_default().to_owned();
    let expected = patch
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str);
    if expected.is_some_and(|expected| expected != current) {
        return Err(Error::Conflict(key.to_string()));
    }

    if let Some(changes) = patch
        .pointer("/spec/template/metadata/annotations")
        .and_then(Value::as_object)
    {
        let template = template_mut(workload).expect("workload without template");
        let annotations = template
            .metadata
            .get_or_insert_default()
            .annotations
            .get_or_insert_default();
        for (name, value) in changes {
            match value.as_str() {
                Some(value) => {
                    annotations.insert(name.clone(), value.to_owned());
                }
                None => {
                    annotations.remove(name);
                }
            }
        }
    }

    let next = current.parse::<u64>().unwrap_or_default() + 1;
    meta_mut(workload).resource_version = Some(next.to_string());
    state.patches.push((key.clone(), patch.clone()));
    Ok(())
}

enum Answer {
    Image(String),
    Invalid(WebhookValidationError),
    Unavailable,
}

/// A webhook that always gives the same answer and counts how often it was asked
pub struct FakeWebhook {
    answer: Answer,
    calls: AtomicUsize,
}

impl FakeWebhook {
    fn new(answer: Answer) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answering(image: &str) -> Self {
        Self::new(Answer::Image(image.into()))
    }

    pub fn invalid(err: WebhookValidationError) -> Self {
        Self::new(Answer::Invalid(err))
    }

    pub fn unavailable() -> Self {
        Self::new(Answer::Unavailable)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InjectionWebhook for FakeWebhook {
    async fn desired_injection(
        &self,
        workload: &WorkloadRef,
        _template: &PodTemplateSpec,
        _timeout: Duration,
    ) -> Result<DesiredInjectionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.answer {
            Answer::Image(image) => Ok(DesiredInjectionResult {
                template_fingerprint: workload.fingerprint.clone(),
                desired_image: image.clone(),
                webhook_latency_ok: true,
                raw_patch_validated: true,
            }),
            Answer::Invalid(err) => Err(err.clone().into()),
            Answer::Unavailable => Err(Error::WebhookUnavailable("connection refused".into())),
        }
    }
}
