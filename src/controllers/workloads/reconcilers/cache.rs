use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controllers::workloads::reconciler::RestartDecision;
use crate::resources::WorkloadKey;

/// What we last learned about one workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub template_fingerprint: String,
    pub desired_image: Option<String>,
    pub last_webhook_call_at: Option<DateTime<Utc>>,
    pub last_restarted_at: Option<DateTime<Utc>>,
    pub last_decision: Option<RestartDecision>,
    pub last_seen_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(template_fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            template_fingerprint: template_fingerprint.to_owned(),
            desired_image: None,
            last_webhook_call_at: None,
            last_restarted_at: None,
            last_decision: None,
            last_seen_at: now,
        }
    }
}

/// Process-wide memory of previous passes, shared by all workers.
///
/// The cache is advisory: losing it only costs extra webhook calls, since cooldown is always
/// confirmed against the annotation on the live object. An entry belongs to exactly one template
/// fingerprint; reading or writing with a different fingerprint discards the whole entry.
///
/// The lock is only held inside these methods, never across an await point.
#[derive(Default)]
pub struct InjectionCache {
    entries: Mutex<HashMap<WorkloadKey, CacheEntry>>,
}

impl InjectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkloadKey, CacheEntry>> {
        // a panic while holding the lock cannot leave an entry half-written
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the entry for `key` if it was built for `fingerprint`, dropping it otherwise.
    pub fn get(&self, key: &WorkloadKey, fingerprint: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.template_fingerprint == fingerprint => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// A previously learned desired image, if it is still fresh for this template.
    pub fn fresh_desired_image(
        &self,
        key: &WorkloadKey,
        fingerprint: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<String> {
        let entry = self.get(key, fingerprint)?;
        let called_at = entry.last_webhook_call_at?;
        let age = now.signed_duration_since(called_at).to_std().ok()?;
        if age <= ttl {
            entry.desired_image
        } else {
            None
        }
    }

    pub fn record_desired_image(
        &self,
        key: &WorkloadKey,
        fingerprint: &str,
        desired_image: &str,
        now: DateTime<Utc>,
    ) {
        self.update(key, fingerprint, now, |entry| {
            entry.desired_image = Some(desired_image.to_owned());
            entry.last_webhook_call_at = Some(now);
        })
    }

    pub fn record_decision(
        &self,
        key: &WorkloadKey,
        fingerprint: &str,
        decision: RestartDecision,
        now: DateTime<Utc>,
    ) {
        self.update(key, fingerprint, now, |entry| {
            entry.last_decision = Some(decision);
        })
    }

    pub fn record_restart(&self, key: &WorkloadKey, fingerprint: &str, at: DateTime<Utc>) {
        self.update(key, fingerprint, at, |entry| {
            entry.last_restarted_at = Some(at);
            entry.last_decision = Some(RestartDecision::DriftDetectedPatchApplied);
        })
    }

    pub fn last_restarted_at(&self, key: &WorkloadKey, fingerprint: &str) -> Option<DateTime<Utc>> {
        self.get(key, fingerprint)?.last_restarted_at
    }

    pub fn forget(&self, key: &WorkloadKey) {
        self.lock().remove(key);
    }

    /// Drop entries of workloads that have not been reconciled for longer than `max_idle`.
    /// Returns how many entries were removed.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            now.signed_duration_since(entry.last_seen_at)
                .to_std()
                .map(|idle| idle <= max_idle)
                .unwrap_or(true)
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(
        &self,
        key: &WorkloadKey,
        fingerprint: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut CacheEntry),
    ) {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(fingerprint, now));

        if entry.template_fingerprint != fingerprint {
            // desired image and cooldown clock go stale together
            *entry = CacheEntry::new(fingerprint, now);
        }

        entry.last_seen_at = now;
        f(entry);
    }
}
