use std::fmt;

use super::pods::SidecarImageObservation;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriftReason {
    NoLivePods,
    InSync,
    RolloutInProgress,
    Outdated { actual_image: String },
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftReason::NoLivePods => f.write_str("no live pods to compare"),
            DriftReason::InSync => f.write_str("all pods run the desired image"),
            DriftReason::RolloutInProgress => f.write_str("rollout in progress"),
            DriftReason::Outdated { actual_image } => {
                write!(f, "all pods run outdated image {actual_image}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriftVerdict {
    pub has_drift: bool,
    pub reason: DriftReason,
}

impl DriftVerdict {
    fn no_drift(reason: DriftReason) -> Self {
        Self {
            has_drift: false,
            reason,
        }
    }
}

/// Decide whether the pods of a workload have drifted away from the desired sidecar image.
///
/// Drift is only reported when every pod runs the same image and that image differs from the
/// desired one. Any pod already on the desired image, or pods disagreeing among themselves,
/// mean a rollout is underway and nothing should be restarted.
pub fn compare(
    desired_image: &str,
    observations: &[SidecarImageObservation],
    hub_aware: bool,
) -> DriftVerdict {
    let Some((first, rest)) = observations.split_first() else {
        return DriftVerdict::no_drift(DriftReason::NoLivePods);
    };

    let matching = observations
        .iter()
        .filter(|o| images_equal(desired_image, &o.actual_image, hub_aware))
        .count();

    if matching == observations.len() {
        return DriftVerdict::no_drift(DriftReason::InSync);
    }

    if matching > 0 {
        return DriftVerdict::no_drift(DriftReason::RolloutInProgress);
    }

    if !rest
        .iter()
        .all(|o| images_equal(&first.actual_image, &o.actual_image, hub_aware))
    {
        return DriftVerdict::no_drift(DriftReason::RolloutInProgress);
    }

    DriftVerdict {
        has_drift: true,
        reason: DriftReason::Outdated {
            actual_image: first.actual_image.clone(),
        },
    }
}

pub fn images_equal(a: &str, b: &str, hub_aware: bool) -> bool {
    if !hub_aware {
        return a == b;
    }

    let a = ImageReference::parse(a);
    let b = ImageReference::parse(b);

    if a.name != b.name {
        return false;
    }

    match (a.digest, b.digest) {
        (Some(a), Some(b)) => a == b,
        _ => a.tag.unwrap_or("latest") == b.tag.unwrap_or("latest"),
    }
}

/// An image reference split into the parts hub-aware comparison cares about. The hub (registry
/// and repository path up to the last `/`) is dropped.
#[derive(Debug, PartialEq, Eq)]
struct ImageReference<'a> {
    name: &'a str,
    tag: Option<&'a str>,
    digest: Option<&'a str>,
}

impl<'a> ImageReference<'a> {
    fn parse(image: &'a str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest)),
            None => (image, None),
        };

        let last = rest.rsplit('/').next().unwrap_or(rest);
        // a ':' before the last '/' is a registry port, not a tag
        let (name, tag) = match last.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (last, None),
        };

        Self { name, tag, digest }
    }
}
