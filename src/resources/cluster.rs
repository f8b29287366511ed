use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::*;

use super::workloads::{Workload, WorkloadKey, WorkloadKind};
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "sidecar-drift-operator";

/// Something worth surfacing on the workload as a Kubernetes Event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadEvent {
    RestartTriggered { desired_image: String },
    WebhookValidationFailed { reason: String },
}

/// The part of the Kubernetes API the reconciler consumes. Reads go to the API server rather
/// than an informer cache so that the cooldown check always sees the latest annotation.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_replica_sets(&self, namespace: &str, selector: &str) -> Result<Vec<ObjectMeta>>;

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ObjectMeta>>;

    /// Apply a JSON merge patch to the workload. A stale `metadata.resourceVersion` in the
    /// patch surfaces as [`Error::Conflict`].
    async fn patch_workload(&self, key: &WorkloadKey, patch: &serde_json::Value) -> Result<()>;

    async fn publish_event(&self, workload: &Workload, event: WorkloadEvent) -> Result<()>;
}

pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.into()),
        }
    }

    async fn get_opt<K>(&self, key: &WorkloadKey) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn merge_patch<K>(&self, key: &WorkloadKey, patch: &serde_json::Value) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };

        match api.patch(&key.name, &params, &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Err(Error::Conflict(key.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Option<Workload>> {
        Ok(match key.kind {
            WorkloadKind::Deployment => self
                .get_opt::<Deployment>(key)
                .await?
                .map(Workload::Deployment),
            WorkloadKind::StatefulSet => self
                .get_opt::<StatefulSet>(key)
                .await?
                .map(Workload::StatefulSet),
            WorkloadKind::DaemonSet => self
                .get_opt::<DaemonSet>(key)
                .await?
                .map(Workload::DaemonSet),
        })
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn list_replica_sets(&self, namespace: &str, selector: &str) -> Result<Vec<ObjectMeta>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list_metadata(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.into_iter().map(|rs| rs.metadata).collect())
    }

    async fn list_controller_revisions(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ObjectMeta>> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list_metadata(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.into_iter().map(|cr| cr.metadata).collect())
    }

    async fn patch_workload(&self, key: &WorkloadKey, patch: &serde_json::Value) -> Result<()> {
        match key.kind {
            WorkloadKind::Deployment => self.merge_patch::<Deployment>(key, patch).await,
            WorkloadKind::StatefulSet => self.merge_patch::<StatefulSet>(key, patch).await,
            WorkloadKind::DaemonSet => self.merge_patch::<DaemonSet>(key, patch).await,
        }
    }

    async fn publish_event(&self, workload: &Workload, event: WorkloadEvent) -> Result<()> {
        let reference = match workload {
            Workload::Deployment(d) => d.object_ref(&()),
            Workload::StatefulSet(s) => s.object_ref(&()),
            Workload::DaemonSet(d) => d.object_ref(&()),
        };

        let event = match event {
            WorkloadEvent::RestartTriggered { desired_image } => Event {
                type_: EventType::Normal,
                reason: "SidecarDriftRestart".into(),
                note: Some(format!(
                    "Restarting pods to pick up sidecar image {desired_image}"
                )),
                action: "Restart".into(),
                secondary: None,
            },
            WorkloadEvent::WebhookValidationFailed { reason } => Event {
                type_: EventType::Warning,
                reason: "WebhookValidationFailed".into(),
                note: Some(reason),
                action: "EvaluateInjection".into(),
                secondary: None,
            },
        };

        debug!(
            "Publishing {} event on {}",
            event.reason,
            workload.key()
        );
        self.recorder.publish(&event, &reference).await?;
        Ok(())
    }
}
