use std::collections::HashMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::*;

use crate::resources::{ClusterApi, Workload, WorkloadKind};
use crate::Result;

/// Pod → ReplicaSet/ControllerRevision → workload
pub const MAX_OWNER_HOPS: usize = 2;

/// The sidecar image one live pod is running
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarImageObservation {
    pub pod_name: String,
    pub actual_image: String,
    pub observed_at: DateTime<Utc>,
}

/// A link in an owner chain, as found on an object's controller owner reference
#[derive(Clone, Debug, PartialEq, Eq)]
struct OwnerLink {
    kind: String,
    name: String,
    uid: String,
}

impl From<&OwnerReference> for OwnerLink {
    fn from(oref: &OwnerReference) -> Self {
        Self {
            kind: oref.kind.clone(),
            name: oref.name.clone(),
            uid: oref.uid.clone(),
        }
    }
}

/// An intermediate object between a pod and its workload. Only ever used as a pass-through link.
#[derive(Clone, Debug)]
struct OwnerChainNode {
    kind: &'static str,
    namespace: String,
    name: String,
    parent: Option<OwnerLink>,
}

/// Intermediate owners of one namespace, keyed by uid
struct OwnerArena {
    nodes: HashMap<String, OwnerChainNode>,
}

impl OwnerArena {
    fn new(kind: &'static str, metas: Vec<ObjectMeta>) -> Self {
        let nodes = metas
            .into_iter()
            .filter_map(|meta| {
                let uid = meta.uid.clone()?;
                let parent = controller_of(meta.owner_references.as_deref()).map(OwnerLink::from);
                Some((
                    uid,
                    OwnerChainNode {
                        kind,
                        namespace: meta.namespace.unwrap_or_default(),
                        name: meta.name.unwrap_or_default(),
                        parent,
                    },
                ))
            })
            .collect();
        Self { nodes }
    }

    fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Walk up from `start` for at most [`MAX_OWNER_HOPS`] links and report whether `target`
    /// is reached.
    fn resolves_to(&self, start: Option<OwnerLink>, target: &Target<'_>) -> bool {
        let mut link = start;
        for _ in 0..MAX_OWNER_HOPS {
            let Some(current) = link else {
                return false;
            };

            if target.is(&current) {
                return true;
            }

            if current.kind != target.kind.intermediate_kind() {
                return false;
            }

            link = match self.nodes.get(&current.uid) {
                Some(node) if node.name == current.name => {
                    trace!(
                        "Following {} {}/{} to its owner",
                        node.kind,
                        node.namespace,
                        node.name
                    );
                    node.parent.clone()
                }
                _ => None,
            };
        }
        false
    }
}

struct Target<'a> {
    kind: WorkloadKind,
    name: &'a str,
    uid: Option<&'a str>,
}

impl Target<'_> {
    fn is(&self, link: &OwnerLink) -> bool {
        if link.kind != self.kind.as_str() || link.name != self.name {
            return false;
        }
        match self.uid {
            Some(uid) => link.uid == uid,
            None => true,
        }
    }
}

fn controller_of(orefs: Option<&[OwnerReference]>) -> Option<&OwnerReference> {
    orefs?.iter().find(|o| o.controller == Some(true))
}

/// List the workload's pods and report the sidecar image each of them runs.
///
/// Pods matched by the selector but owned by something else are skipped, as are pods without a
/// sidecar container. A workload without pods yields an empty list.
pub async fn scan(
    cluster: &dyn ClusterApi,
    workload: &Workload,
    sidecar_container: &str,
    now: DateTime<Utc>,
) -> Result<Vec<SidecarImageObservation>> {
    let key = workload.key();
    let selector = workload.selector_string()?;

    let pods = cluster.list_pods(&key.namespace, &selector).await?;
    if pods.is_empty() {
        return Ok(Vec::new());
    }

    let needs_arena = pods.iter().any(|pod| {
        controller_of(pod.metadata.owner_references.as_deref())
            .is_some_and(|o| o.kind == key.kind.intermediate_kind())
    });

    let arena = if !needs_arena {
        OwnerArena::empty()
    } else {
        match key.kind {
            WorkloadKind::Deployment => OwnerArena::new(
                "ReplicaSet",
                cluster.list_replica_sets(&key.namespace, &selector).await?,
            ),
            WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => OwnerArena::new(
                "ControllerRevision",
                cluster
                    .list_controller_revisions(&key.namespace, &selector)
                    .await?,
            ),
        }
    };

    let target = Target {
        kind: key.kind,
        name: &key.name,
        uid: workload.uid(),
    };

    let observations = pods
        .iter()
        .filter(|pod| {
            let owner =
                controller_of(pod.metadata.owner_references.as_deref()).map(OwnerLink::from);
            let owned = arena.resolves_to(owner, &target);
            if !owned {
                debug!(
                    "Skipping pod {} in namespace {}: not owned by {key}",
                    pod.name_any(),
                    key.namespace
                );
            }
            owned
        })
        .filter(|pod| !is_finished(pod))
        .filter_map(|pod| {
            let image = sidecar_image(pod, sidecar_container);
            if image.is_none() {
                trace!("Pod {} has no {sidecar_container} container", pod.name_any());
            }
            Some(SidecarImageObservation {
                pod_name: pod.name_any(),
                actual_image: image?,
                observed_at: now,
            })
        })
        .collect();

    Ok(observations)
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// The image the sidecar container is actually running. The status image is preferred; the
/// spec image is used while the container has not started yet. Native sidecars live among the
/// init containers.
pub fn sidecar_image(pod: &Pod, sidecar_container: &str) -> Option<String> {
    let from_status = pod.status.as_ref().and_then(|status| {
        status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
            .find(|cs| cs.name == sidecar_container)
            .map(|cs| cs.image.clone())
            .filter(|image| !image.is_empty())
    });

    from_status.or_else(|| {
        let spec = pod.spec.as_ref()?;
        let find = |containers: &[Container]| {
            containers
                .iter()
                .find(|c| c.name == sidecar_container)
                .and_then(|c| c.image.clone())
                .filter(|image| !image.is_empty())
        };
        find(&spec.containers).or_else(|| find(spec.init_containers.as_deref().unwrap_or_default()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::workloads::reconcilers::testing::{
        controller_revision_meta, deployment, pod_owned_by, replica_set_meta, statefulset,
        FakeCluster,
    };
    use k8s_openapi::api::core::v1::{ContainerStatus, PodSpec, PodStatus};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn status_image_wins_over_spec_image() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "istio-proxy".into(),
                    image: Some("istio/proxyv2:1.19".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            sidecar_image(&pod, "istio-proxy").as_deref(),
            Some("istio/proxyv2:1.19")
        );

        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "istio-proxy".into(),
                image: "docker.io/istio/proxyv2:1.19".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            sidecar_image(&pod, "istio-proxy").as_deref(),
            Some("docker.io/istio/proxyv2:1.19")
        );
    }

    #[test]
    fn native_sidecar_is_found_among_init_containers() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    image: Some("app:1".into()),
                    ..Default::default()
                }],
                init_containers: Some(vec![Container {
                    name: "istio-proxy".into(),
                    image: Some("istio/proxyv2:1.22".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            sidecar_image(&pod, "istio-proxy").as_deref(),
            Some("istio/proxyv2:1.22")
        );
        assert_eq!(sidecar_image(&pod, "linkerd-proxy"), None);
    }

    #[tokio::test]
    async fn pods_of_other_workloads_are_excluded() {
        let cluster = FakeCluster::default();
        let web = deployment("ns", "web", "uid-web", "app:1");
        cluster.add_replica_set(replica_set_meta("ns", "web-abc", "uid-rs-web", "web", "uid-web"));
        cluster.add_replica_set(replica_set_meta(
            "ns",
            "other-def",
            "uid-rs-other",
            "other",
            "uid-other",
        ));
        cluster.add_pod(pod_owned_by(
            "ns",
            "web-abc-1",
            "ReplicaSet",
            "web-abc",
            "uid-rs-web",
            "proxy:1.19",
        ));
        cluster.add_pod(pod_owned_by(
            "ns",
            "other-def-1",
            "ReplicaSet",
            "other-def",
            "uid-rs-other",
            "proxy:1.18",
        ));
        // a bare pod sharing the labels
        cluster.add_pod(pod_owned_by("ns", "stray", "Job", "stray", "uid-job", "proxy:1.17"));

        let observations = scan(&cluster, &web, "istio-proxy", now()).await.unwrap();
        assert_eq!(
            observations,
            vec![SidecarImageObservation {
                pod_name: "web-abc-1".into(),
                actual_image: "proxy:1.19".into(),
                observed_at: now(),
            }]
        );
    }

    #[tokio::test]
    async fn no_pods_is_an_empty_scan() {
        let cluster = FakeCluster::default();
        let web = deployment("ns", "web", "uid-web", "app:1");
        let observations = scan(&cluster, &web, "istio-proxy", now()).await.unwrap();
        assert!(observations.is_empty());
    }

    #[tokio::test]
    async fn list_failures_are_propagated() {
        let cluster = FakeCluster::default();
        cluster.fail_pod_list();
        let web = deployment("ns", "web", "uid-web", "app:1");
        let err = scan(&cluster, &web, "istio-proxy", now()).await.unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn statefulset_pods_are_owned_directly() {
        let cluster = FakeCluster::default();
        let db = statefulset("ns", "db", "uid-db", "db:1");
        cluster.add_controller_revision(controller_revision_meta(
            "ns", "db-7f9", "uid-cr", "db", "uid-db",
        ));
        cluster.add_pod(pod_owned_by("ns", "db-0", "StatefulSet", "db", "uid-db", "proxy:1.19"));
        cluster.add_pod(pod_owned_by("ns", "db-1", "StatefulSet", "db", "uid-db", "proxy:1.19"));
        // same name, but a previous incarnation of the statefulset
        cluster.add_pod(pod_owned_by("ns", "db-2", "StatefulSet", "db", "uid-old", "proxy:1.18"));

        let observations = scan(&cluster, &db, "istio-proxy", now()).await.unwrap();
        let names: Vec<_> = observations.iter().map(|o| o.pod_name.as_str()).collect();
        assert_eq!(names, vec!["db-0", "db-1"]);
    }

    #[tokio::test]
    async fn finished_pods_are_ignored() {
        let cluster = FakeCluster::default();
        let web = deployment("ns", "web", "uid-web", "app:1");
        cluster.add_replica_set(replica_set_meta("ns", "web-abc", "uid-rs", "web", "uid-web"));
        let mut done = pod_owned_by(
            "ns",
            "web-abc-1",
            "ReplicaSet",
            "web-abc",
            "uid-rs",
            "proxy:1.18",
        );
        done.status.as_mut().unwrap().phase = Some("Succeeded".into());
        cluster.add_pod(done);
        cluster.add_pod(pod_owned_by(
            "ns",
            "web-abc-2",
            "ReplicaSet",
            "web-abc",
            "uid-rs",
            "proxy:1.19",
        ));

        let observations = scan(&cluster, &web, "istio-proxy", now()).await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].actual_image, "proxy:1.19");
    }

    #[test]
    fn owner_walk_is_bounded() {
        // a replicaset owned by another replicaset never resolves, however long the chain
        let metas = (0..5)
            .map(|i| ObjectMeta {
                name: Some(format!("rs-{i}")),
                namespace: Some("ns".into()),
                uid: Some(format!("uid-{i}")),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: if i == 4 { "Deployment" } else { "ReplicaSet" }.into(),
                    name: if i == 4 { "web".into() } else { format!("rs-{}", i + 1) },
                    uid: if i == 4 { "uid-web".into() } else { format!("uid-{}", i + 1) },
                    controller: Some(true),
                    block_owner_deletion: None,
                }]),
                ..Default::default()
            })
            .collect();
        let arena = OwnerArena::new("ReplicaSet", metas);
        let target = Target {
            kind: WorkloadKind::Deployment,
            name: "web",
            uid: Some("uid-web"),
        };
        let start = Some(OwnerLink {
            kind: "ReplicaSet".into(),
            name: "rs-0".into(),
            uid: "uid-0".into(),
        });
        assert!(!arena.resolves_to(start, &target));

        let one_hop = Some(OwnerLink {
            kind: "ReplicaSet".into(),
            name: "rs-4".into(),
            uid: "uid-4".into(),
        });
        assert!(arena.resolves_to(one_hop, &target));
    }
}
