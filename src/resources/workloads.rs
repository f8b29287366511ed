use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::Selector;
use kube::Resource;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// The kinds of workload whose pods we reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }

    /// The kind of the object that sits between a pod and this workload, if any
    pub fn intermediate_kind(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "ReplicaSet",
            WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => "ControllerRevision",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a workload as carried by a reconcile request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A live workload object as read from the API server
#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(d) => d.meta(),
            Workload::StatefulSet(s) => s.meta(),
            Workload::DaemonSet(d) => d.meta(),
        }
    }

    pub fn api_version(&self) -> String {
        match self {
            Workload::Deployment(_) => Deployment::api_version(&()).into_owned(),
            Workload::StatefulSet(_) => StatefulSet::api_version(&()).into_owned(),
            Workload::DaemonSet(_) => DaemonSet::api_version(&()).into_owned(),
        }
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.selector),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.selector),
            Workload::DaemonSet(d) => d.spec.as_ref().map(|s| &s.selector),
        }
    }

    /// Label selector in its query-string form. An empty selector would match every pod in the
    /// namespace, so it is refused.
    pub fn selector_string(&self) -> Result<String> {
        let selector = self.selector().ok_or_else(|| {
            Error::InvalidWorkload(format!("{} has no label selector", self.key()))
        })?;

        let selector: Selector = selector.clone().try_into().map_err(|err| {
            Error::InvalidWorkload(format!("{} has an invalid selector: {err}", self.key()))
        })?;

        let selector = selector.to_string();
        if selector.is_empty() {
            return Err(Error::InvalidWorkload(format!(
                "{} has an empty label selector",
                self.key()
            )));
        }

        Ok(selector)
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Paused deployments do not roll out when their template changes
    pub fn is_paused(&self) -> bool {
        match self {
            Workload::Deployment(d) => d
                .spec
                .as_ref()
                .and_then(|s| s.paused)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn key(&self) -> WorkloadKey {
        let meta = self.meta();
        WorkloadKey::new(
            self.kind(),
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    pub fn template_annotation(&self, key: &str) -> Option<&str> {
        self.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Capture the identity and fingerprint of this object for one reconcile pass.
    pub fn to_ref(&self, restart_annotation: &str) -> Result<WorkloadRef> {
        let template = self.pod_template().ok_or_else(|| {
            Error::InvalidWorkload(format!("{} has no pod template", self.key()))
        })?;

        let WorkloadKey {
            kind,
            namespace,
            name,
        } = self.key();

        Ok(WorkloadRef {
            kind,
            namespace,
            name,
            resource_version: self.resource_version().map(str::to_owned),
            fingerprint: template_fingerprint(template, restart_annotation)?,
        })
    }
}

/// Identity of the target of a reconcile pass. Built fresh from a live read on every pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    /// As observed on the read; informational only
    pub resource_version: Option<String>,
    /// Content hash of the template fields that influence injection
    pub fingerprint: String,
}

impl WorkloadRef {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.kind, self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: BTreeMap<&'a str, &'a str>,
    containers: Vec<(&'a str, Option<&'a str>)>,
    init_containers: Vec<(&'a str, Option<&'a str>)>,
}

fn container_images(containers: &[Container]) -> Vec<(&str, Option<&str>)> {
    containers
        .iter()
        .map(|c| (c.name.as_str(), c.image.as_deref()))
        .collect()
}

/// Hash the parts of a pod template that the injection webhook reads: labels and annotations
/// (injection toggles, proxy overrides) and the container images. Our own restart annotation is
/// left out, otherwise every restart would invalidate the cached webhook result.
pub fn template_fingerprint(
    template: &PodTemplateSpec,
    restart_annotation: &str,
) -> Result<String> {
    let metadata = template.metadata.as_ref();
    let spec = template.spec.as_ref();

    let input = FingerprintInput {
        labels: metadata.and_then(|m| m.labels.as_ref()),
        annotations: metadata
            .and_then(|m| m.annotations.as_ref())
            .map(|a| {
                a.iter()
                    .filter(|(k, _)| k.as_str() != restart_annotation)
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect()
            })
            .unwrap_or_default(),
        containers: spec
            .map(|s| container_images(&s.containers))
            .unwrap_or_default(),
        init_containers: spec
            .and_then(|s| s.init_containers.as_deref())
            .map(container_images)
            .unwrap_or_default(),
    };

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&input)?);
    let digest = hasher.finalize();

    Ok(format!("{:x}", digest)[..16].to_string())
}
