use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;

use crate::{Error, Result};

pub const DEFAULT_SIDECAR_CONTAINER: &str = "istio-proxy";
pub const DEFAULT_RESTART_ANNOTATION: &str = "sidecar-drift.io/restartedAt";
pub const DEFAULT_WEBHOOK_URL: &str = "https://istiod.istio-system.svc:443/inject";

/// Settings consumed by every reconcile pass. Built once at startup and shared read-only.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the injected proxy container
    pub sidecar_container: String,
    /// The one annotation on the pod template that records the last restart trigger
    pub restart_annotation: String,
    /// Compare images ignoring the registry/repository prefix
    pub hub_aware: bool,
    /// Minimum time between two restart triggers of the same workload
    pub cooldown: Duration,

    /// Injection webhook endpoint that is called in dry-run mode
    pub webhook_url: Url,
    /// PEM bundle used to verify the webhook's serving certificate
    pub webhook_ca_file: Option<PathBuf>,
    pub webhook_timeout: Duration,
    /// Webhook calls slower than this are reported as not latency-ok
    pub webhook_slow_threshold: Duration,

    /// How long a desired image learned from the webhook may be reused
    pub desired_image_ttl: Duration,
    /// Cache entries not touched for this long are dropped
    pub cache_idle_eviction: Duration,

    /// Deadline for one whole reconcile pass
    pub reconcile_timeout: Duration,
    pub max_conflict_retries: u32,

    pub resync_interval: Duration,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,

    pub concurrency: u16,
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sidecar_container: DEFAULT_SIDECAR_CONTAINER.into(),
            restart_annotation: DEFAULT_RESTART_ANNOTATION.into(),
            hub_aware: false,
            cooldown: Duration::from_secs(30 * 60),
            webhook_url: Url::parse(DEFAULT_WEBHOOK_URL).expect("default webhook url to parse"),
            webhook_ca_file: None,
            webhook_timeout: Duration::from_secs(10),
            webhook_slow_threshold: Duration::from_secs(2),
            desired_image_ttl: Duration::from_secs(5 * 60),
            cache_idle_eviction: Duration::from_secs(60 * 60),
            reconcile_timeout: Duration::from_secs(60),
            max_conflict_retries: 3,
            resync_interval: Duration::from_secs(10 * 60),
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(5 * 60),
            concurrency: 8,
            debounce: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn validate(self) -> Result<Self> {
        if self.sidecar_container.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "sidecar container name must not be empty".into(),
            ));
        }

        if !is_qualified_annotation_key(&self.restart_annotation) {
            return Err(Error::InvalidConfig(format!(
                "'{}' is not a valid annotation key",
                self.restart_annotation
            )));
        }

        for (name, value) in [
            ("cooldown", self.cooldown),
            ("webhook timeout", self.webhook_timeout),
            ("reconcile timeout", self.reconcile_timeout),
            ("resync interval", self.resync_interval),
            ("error backoff base", self.error_backoff_base),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
            }
        }

        if self.error_backoff_max < self.error_backoff_base {
            return Err(Error::InvalidConfig(
                "error backoff max must not be below the base".into(),
            ));
        }

        if self.webhook_timeout >= self.reconcile_timeout {
            return Err(Error::InvalidConfig(
                "webhook timeout must be shorter than the reconcile timeout".into(),
            ));
        }

        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }

        match self.webhook_url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported webhook url scheme '{scheme}'"
                )))
            }
        }

        Ok(self)
    }
}

// prefix/name, where prefix is a DNS subdomain and name follows the label rules
fn is_qualified_annotation_key(key: &str) -> bool {
    static KEY: OnceLock<Regex> = OnceLock::new();
    let regex = KEY.get_or_init(|| {
        Regex::new(
            r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$",
        )
        .expect("annotation key regex to compile")
    });

    match key.split_once('/') {
        Some((prefix, _)) if prefix.len() > 253 => false,
        _ => regex.is_match(key),
    }
}
