use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::*;

use crate::resources::{ClusterApi, Workload, WorkloadRef};
use crate::{Error, Result};

/// Result of an attempt to trigger a restart
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The annotation was written; the workload controller will roll the pods
    Applied { at: DateTime<Utc> },
    /// A restart was triggered too recently
    CooldownActive { remaining: Duration },
    /// The annotation already carries the timestamp we would write
    AlreadyApplied,
    /// The template changed since the pass started; its drift verdict is stale
    TemplateChanged,
    /// The workload no longer exists
    Gone,
}

impl RestartOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, RestartOutcome::Applied { .. })
    }
}

/// Whether the cooldown window allows another restart
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cooldown {
    Elapsed,
    Active { remaining: Duration },
}

/// Writes the restart-trigger annotation on a workload's pod template
pub struct Annotator<'a> {
    cluster: &'a dyn ClusterApi,
    annotation: &'a str,
    cooldown: Duration,
    max_conflict_retries: u32,
}

impl<'a> Annotator<'a> {
    pub fn new(
        cluster: &'a dyn ClusterApi,
        annotation: &'a str,
        cooldown: Duration,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            cluster,
            annotation,
            cooldown,
            max_conflict_retries,
        }
    }

    /// Last restart trigger recorded on the live object. An unparsable value counts as none.
    pub fn last_restarted_at(&self, workload: &Workload) -> Option<DateTime<Utc>> {
        let value = workload.template_annotation(self.annotation)?;
        let parsed = parse_restarted_at(value);
        if parsed.is_none() {
            debug!(
                "Ignoring unparsable {} annotation on {}",
                self.annotation,
                workload.key()
            );
        }
        parsed
    }

    pub fn cooldown(
        &self,
        last_restarted_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Cooldown {
        let Some(last) = last_restarted_at else {
            return Cooldown::Elapsed;
        };

        let since = now.signed_duration_since(last);
        // a timestamp from the future (clock skew) keeps the window open for its full length
        let since = since.to_std().unwrap_or(Duration::ZERO);

        if since < self.cooldown {
            Cooldown::Active {
                remaining: self.cooldown - since,
            }
        } else {
            Cooldown::Elapsed
        }
    }

    /// Re-read the workload and, if the cooldown allows, set the restart annotation to `now`.
    ///
    /// The patch is conditional on the resourceVersion that was read, so a concurrent writer
    /// makes it fail; the sequence is then retried against a fresh read, which usually turns into
    /// a cooldown no-op if the other writer was another pass restarting the same workload.
    /// `cached_restart` is only used to notice disagreement; the live annotation decides.
    pub async fn apply_restart(
        &self,
        workload: &WorkloadRef,
        now: DateTime<Utc>,
        cached_restart: Option<DateTime<Utc>>,
    ) -> Result<RestartOutcome> {
        let key = workload.key();
        let value = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        for attempt in 0..=self.max_conflict_retries {
            let Some(live) = self.cluster.get_workload(&key).await? else {
                return Ok(RestartOutcome::Gone);
            };

            if live.key() != key {
                return Err(Error::InvariantViolation(format!(
                    "read of {key} returned {}",
                    live.key()
                )));
            }

            let live_ref = live.to_ref(self.annotation)?;
            if live_ref.fingerprint != workload.fingerprint {
                debug!("Pod template of {key} changed during reconcile; not restarting");
                return Ok(RestartOutcome::TemplateChanged);
            }

            if live.template_annotation(self.annotation) == Some(value.as_str()) {
                return Ok(RestartOutcome::AlreadyApplied);
            }

            let live_restart = self.last_restarted_at(&live);
            if cached_restart.is_some() && cached_restart != live_restart {
                debug!(
                    "Cached restart time {cached_restart:?} of {key} disagrees with the live annotation {live_restart:?}"
                );
            }

            if let Cooldown::Active { remaining } = self.cooldown(live_restart, now) {
                return Ok(RestartOutcome::CooldownActive { remaining });
            }

            let Some(resource_version) = live.resource_version() else {
                return Err(Error::InvariantViolation(format!(
                    "{key} has no resourceVersion"
                )));
            };

            let patch = restart_patch(self.annotation, &value, resource_version);
            match self.cluster.patch_workload(&key, &patch).await {
                Ok(()) => {
                    info!("Set {}={value} on {key}", self.annotation);
                    return Ok(RestartOutcome::Applied { at: now });
                }
                Err(err) if err.is_conflict() => {
                    debug!(
                        "Conflict patching {key} (attempt {} of {}), re-reading",
                        attempt + 1,
                        self.max_conflict_retries + 1
                    );
                    continue;
                }
                Err(Error::KubeError(kube::Error::Api(err))) if err.code == 404 => {
                    return Ok(RestartOutcome::Gone);
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::ConflictRetriesExhausted(
            key.to_string(),
            self.max_conflict_retries + 1,
        ))
    }
}

/// The only write this controller ever performs: one annotation on the pod template, guarded by
/// the resourceVersion it was computed against.
pub fn restart_patch(annotation: &str, value: &str, resource_version: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(annotation.to_owned(), Value::String(value.to_owned()));

    json!({
        "metadata": {
            "resourceVersion": resource_version,
        },
        "spec": {
            "template": {
                "metadata": {
                    "annotations": annotations,
                }
            }
        }
    })
}

/// Parse a restart timestamp, accepting the formats earlier versions and `kubectl rollout restart`
/// write. Returns `None` for anything else.
pub fn parse_restarted_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.to_utc());
    }

    for format in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, format) {
            return Some(t.and_utc());
        }
    }

    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
