use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use tracing::*;

use super::reconcilers::annotator::{Annotator, RestartOutcome};
use super::reconcilers::cache::InjectionCache;
use super::reconcilers::comparator::{self, DriftReason};
use super::reconcilers::pods;
use super::reconcilers::webhook::InjectionWebhook;
use crate::resources::{ClusterApi, Workload, WorkloadEvent, WorkloadKey, WorkloadRef};
use crate::{Config, Error, ErrorClass, Metrics, Result};

/// The terminal decision of one reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RestartDecision {
    NoDriftNoOp,
    DriftDetectedPatchApplied,
    DriftDetectedCooldownSkipped,
    InconclusiveSkipped,
}

impl RestartDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartDecision::NoDriftNoOp => "NoDriftNoOp",
            RestartDecision::DriftDetectedPatchApplied => "DriftDetectedPatchApplied",
            RestartDecision::DriftDetectedCooldownSkipped => "DriftDetectedCooldownSkipped",
            RestartDecision::InconclusiveSkipped => "InconclusiveSkipped",
        }
    }
}

impl fmt::Display for RestartDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a successful pass ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// `None` when the workload no longer exists
    pub decision: Option<RestartDecision>,
    pub reason: String,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn gone() -> Self {
        Self {
            decision: None,
            reason: "workload no longer exists".into(),
            requeue_after: None,
        }
    }

    pub fn action(&self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

/// Drives scan → desired → compare → decide → patch for one workload at a time.
///
/// Nothing is carried from one pass to the next except through the cache, so passes may run in
/// any order, be repeated, or overlap for the same workload.
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    webhook: Arc<dyn InjectionWebhook>,
    cache: Arc<InjectionCache>,
    config: Arc<Config>,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        webhook: Arc<dyn InjectionWebhook>,
        cache: Arc<InjectionCache>,
        config: Arc<Config>,
        metrics: Metrics,
    ) -> Self {
        Self {
            cluster,
            webhook,
            cache,
            config,
            metrics,
        }
    }

    pub fn cache(&self) -> &InjectionCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one pass for `key`. Errors returned from here are transient or fatal; a workload that
    /// disappeared, or a webhook answer that could not be trusted, both end the pass successfully.
    pub async fn reconcile(&self, key: &WorkloadKey) -> Result<ReconcileOutcome> {
        self.reconcile_at(key, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        key: &WorkloadKey,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let timeout = self.config.reconcile_timeout;
        let result = match tokio::time::timeout(timeout, self.pass(key, now)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };

        match result {
            Err(err) if err.class() == ErrorClass::NotFound => {
                debug!("{key} disappeared during reconcile");
                self.cache.forget(key);
                Ok(ReconcileOutcome::gone())
            }
            Err(err) if err.class() == ErrorClass::Validation => {
                error!("Not reconciling {key}: {err}");
                Ok(ReconcileOutcome {
                    decision: Some(RestartDecision::InconclusiveSkipped),
                    reason: err.to_string(),
                    requeue_after: None,
                })
            }
            other => other,
        }
    }

    async fn pass(&self, key: &WorkloadKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let config = &*self.config;

        let evicted = self.cache.evict_idle(now, config.cache_idle_eviction);
        if evicted > 0 {
            debug!("Evicted {evicted} idle cache entries");
        }

        let Some(workload) = self.cluster.get_workload(key).await? else {
            self.cache.forget(key);
            return Ok(ReconcileOutcome::gone());
        };

        if workload.is_deleting() {
            return Ok(self.inconclusive(key, "workload is being deleted"));
        }
        if workload.is_paused() {
            return Ok(self.inconclusive(key, "deployment is paused"));
        }

        let wref = workload.to_ref(&config.restart_annotation)?;

        // Start → Scanned
        let observations =
            pods::scan(&*self.cluster, &workload, &config.sidecar_container, now).await?;
        if observations.is_empty() {
            return Ok(self.settle(
                &wref,
                RestartDecision::NoDriftNoOp,
                DriftReason::NoLivePods.to_string(),
                Some(self.jittered(key, config.resync_interval, now)),
                now,
            ));
        }

        // Scanned → DesiredResolved
        let desired_image = match self.desired_image(&workload, &wref, now).await {
            Ok(image) => image,
            Err(Error::WebhookValidation(err)) => {
                error!(
                    "Injection webhook gave an untrusted answer for {wref}, not restarting: {err}"
                );
                self.publish(
                    &workload,
                    WorkloadEvent::WebhookValidationFailed {
                        reason: err.to_string(),
                    },
                )
                .await;
                return Ok(self.settle(
                    &wref,
                    RestartDecision::InconclusiveSkipped,
                    err.to_string(),
                    None,
                    now,
                ));
            }
            Err(err) => return Err(err),
        };

        // DesiredResolved → Compared
        let verdict = comparator::compare(&desired_image, &observations, config.hub_aware);
        if !verdict.has_drift {
            return Ok(self.settle(
                &wref,
                RestartDecision::NoDriftNoOp,
                verdict.reason.to_string(),
                Some(self.jittered(key, config.resync_interval, now)),
                now,
            ));
        }

        info!(
            "Sidecar drift on {wref}: {}, desired {desired_image}",
            verdict.reason
        );

        // Compared → Decided → Patched | Skipped
        let annotator = Annotator::new(
            &*self.cluster,
            &config.restart_annotation,
            config.cooldown,
            config.max_conflict_retries,
        );
        let cached_restart = self.cache.last_restarted_at(key, &wref.fingerprint);

        match annotator.apply_restart(&wref, now, cached_restart).await? {
            RestartOutcome::Applied { at } => {
                self.cache.record_restart(key, &wref.fingerprint, at);
                self.publish(
                    &workload,
                    WorkloadEvent::RestartTriggered {
                        desired_image: desired_image.clone(),
                    },
                )
                .await;
                Ok(self.settle(
                    &wref,
                    RestartDecision::DriftDetectedPatchApplied,
                    format!("{}, restart triggered", verdict.reason),
                    Some(self.jittered(key, config.resync_interval, now)),
                    now,
                ))
            }
            RestartOutcome::CooldownActive { remaining } => {
                let requeue_after = self.jittered(key, remaining.min(config.resync_interval), now);
                Ok(self.settle(
                    &wref,
                    RestartDecision::DriftDetectedCooldownSkipped,
                    format!("cooldown active for another {}s", remaining.as_secs()),
                    Some(requeue_after),
                    now,
                ))
            }
            RestartOutcome::AlreadyApplied => Ok(self.settle(
                &wref,
                RestartDecision::DriftDetectedCooldownSkipped,
                "restart already triggered".into(),
                Some(self.jittered(key, config.cooldown.min(config.resync_interval), now)),
                now,
            )),
            // the template change is its own event; that pass will judge the new template
            RestartOutcome::TemplateChanged => Ok(self.inconclusive(
                key,
                "pod template changed during reconcile",
            )),
            RestartOutcome::Gone => {
                self.cache.forget(key);
                Ok(ReconcileOutcome::gone())
            }
        }
    }

    /// The sidecar image the webhook would inject today, from the cache when the template is
    /// unchanged and the last answer is recent enough.
    async fn desired_image(
        &self,
        workload: &Workload,
        wref: &WorkloadRef,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let key = wref.key();
        let config = &*self.config;

        if let Some(image) =
            self.cache
                .fresh_desired_image(&key, &wref.fingerprint, now, config.desired_image_ttl)
        {
            debug!("Reusing cached desired image for {wref}");
            self.metrics.webhook_request("cached");
            return Ok(image);
        }

        let template = workload
            .pod_template()
            .ok_or_else(|| Error::InvalidWorkload(format!("{wref} has no pod template")))?;

        let _timer = self.metrics.measure_webhook();
        let call = self
            .webhook
            .desired_injection(wref, template, config.webhook_timeout);
        let result = match tokio::time::timeout(config.webhook_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::WebhookUnavailable(format!(
                "no answer within {:?}",
                config.webhook_timeout
            ))),
        };

        let result = match result {
            Ok(result) => {
                self.metrics.webhook_request("ok");
                result
            }
            Err(err) => {
                self.metrics.webhook_request(match &err {
                    Error::WebhookValidation(_) => "invalid",
                    _ => "unavailable",
                });
                return Err(err);
            }
        };

        if !result.raw_patch_validated {
            return Err(Error::InvariantViolation(format!(
                "unvalidated webhook result for {wref}"
            )));
        }
        if result.template_fingerprint != wref.fingerprint {
            return Err(Error::InvariantViolation(format!(
                "webhook result for {wref} belongs to another template"
            )));
        }

        self.cache
            .record_desired_image(&key, &wref.fingerprint, &result.desired_image, now);

        Ok(result.desired_image)
    }

    fn settle(
        &self,
        wref: &WorkloadRef,
        decision: RestartDecision,
        reason: String,
        requeue_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        self.cache
            .record_decision(&wref.key(), &wref.fingerprint, decision, now);
        info!(decision = %decision, "Reconciled {wref}: {reason}");
        ReconcileOutcome {
            decision: Some(decision),
            reason,
            requeue_after,
        }
    }

    fn inconclusive(&self, key: &WorkloadKey, reason: &str) -> ReconcileOutcome {
        info!("Skipping {key}: {reason}");
        ReconcileOutcome {
            decision: Some(RestartDecision::InconclusiveSkipped),
            reason: reason.into(),
            requeue_after: None,
        }
    }

    async fn publish(&self, workload: &Workload, event: WorkloadEvent) {
        if let Err(err) = self.cluster.publish_event(workload, event).await {
            warn!("Failed to publish event on {}: {err}", workload.key());
        }
    }

    fn jittered(&self, key: &WorkloadKey, base: Duration, now: DateTime<Utc>) -> Duration {
        jittered(key, base, now)
    }
}

/// `base` stretched by up to 10%, spread by workload and time so that requeues of many
/// workloads do not line up.
pub fn jittered(key: &WorkloadKey, base: Duration, now: DateTime<Utc>) -> Duration {
    let mut hasher = fnv::FnvHasher::default();
    key.hash(&mut hasher);
    now.timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher);
    let fraction = (hasher.finish() % 1000) as f64 / 10_000.0;
    base + base.mul_f64(fraction)
}
