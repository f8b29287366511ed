use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::ByteString;
use regex::Regex;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::*;

use crate::resources::WorkloadRef;
use crate::{Config, Error, Result};

/// Responses larger than this are not parsed
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

/// Every way an admission review returned by the webhook can fail to be trusted
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookValidationError {
    #[error("webhook answered with status {0}")]
    UnexpectedStatus(u16),
    #[error("response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,
    #[error("response is not a JSON document")]
    NotJson,
    #[error("response apiVersion is {0:?}, expected {ADMISSION_API_VERSION}")]
    UnexpectedApiVersion(String),
    #[error("response kind is {0:?}, expected {ADMISSION_REVIEW_KIND}")]
    UnexpectedKind(String),
    #[error("response has no 'response' object")]
    MissingResponse,
    #[error("response carries no uid")]
    MissingUid,
    #[error("response answers request {0:?}, not ours")]
    UidMismatch(String),
    #[error("'{0}' has an unexpected type")]
    MalformedField(&'static str),
    #[error("webhook did not allow the pod: {0}")]
    NotAllowed(String),
    #[error("unsupported patch type {0}")]
    UnsupportedPatchType(String),
    #[error("response carries no patch")]
    MissingPatch,
    #[error("patch is not base64 encoded JSON")]
    UndecodablePatch,
    #[error("patch is not a list of operations")]
    PatchNotAList,
    #[error("patch operation {index} is malformed: {problem}")]
    MalformedOperation { index: usize, problem: &'static str },
    #[error("patch does not inject a '{0}' container")]
    NoSidecar(String),
    #[error("patch injects '{0}' with more than one image")]
    AmbiguousSidecar(String),
    #[error("sidecar image is not a valid image reference")]
    InvalidImage,
}

/// What the webhook would inject for a pod template today. Only ever constructed from a
/// response that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredInjectionResult {
    pub template_fingerprint: String,
    pub desired_image: String,
    pub webhook_latency_ok: bool,
    pub raw_patch_validated: bool,
}

#[async_trait]
pub trait InjectionWebhook: Send + Sync {
    /// Ask the webhook, in dry-run mode, which sidecar image it would inject into `template`.
    async fn desired_injection(
        &self,
        workload: &WorkloadRef,
        template: &PodTemplateSpec,
        timeout: Duration,
    ) -> Result<DesiredInjectionResult>;
}

/// Calls the Istio sidecar injector over HTTPS
pub struct WebhookClient {
    http_client: reqwest::Client,
    url: Url,
    sidecar_container: String,
    slow_threshold: Duration,
}

impl WebhookClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.webhook_timeout)
            .connect_timeout(config.webhook_timeout);

        if let Some(ca_file) = &config.webhook_ca_file {
            let pem = std::fs::read(ca_file).map_err(|err| {
                Error::InvalidConfig(format!(
                    "cannot read webhook CA bundle {}: {err}",
                    ca_file.display()
                ))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                Error::InvalidConfig(format!("invalid webhook CA bundle: {err}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let http_client = builder
            .build()
            .map_err(|err| Error::InvalidConfig(format!("cannot build webhook client: {err}")))?;

        Ok(Self {
            http_client,
            url: config.webhook_url.clone(),
            sidecar_container: config.sidecar_container.clone(),
            slow_threshold: config.webhook_slow_threshold,
        })
    }

    async fn call(&self, review: &Value, timeout: Duration) -> Result<Vec<u8>> {
        let resp = self
            .http_client
            .post(self.url.clone())
            .timeout(timeout)
            .json(review)
            .send()
            .await
            .map_err(unavailable)?;

        check_status(resp.status())?;

        if resp
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
        {
            return Err(WebhookValidationError::ResponseTooLarge.into());
        }

        let body = resp.bytes().await.map_err(unavailable)?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(WebhookValidationError::ResponseTooLarge.into());
        }

        Ok(body.to_vec())
    }
}

/// 5xx, 408 and 429 are worth retrying; any other non-2xx answer is not trusted
fn check_status(status: StatusCode) -> Result<()> {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(Error::WebhookUnavailable(format!(
            "webhook answered with status {status}"
        )));
    }
    if !status.is_success() {
        return Err(WebhookValidationError::UnexpectedStatus(status.as_u16()).into());
    }
    Ok(())
}

fn unavailable(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::WebhookUnavailable("request timed out".into())
    } else if err.is_connect() {
        Error::WebhookUnavailable("could not connect".into())
    } else {
        Error::WebhookUnavailable(err.without_url().to_string())
    }
}

#[async_trait]
impl InjectionWebhook for WebhookClient {
    async fn desired_injection(
        &self,
        workload: &WorkloadRef,
        template: &PodTemplateSpec,
        timeout: Duration,
    ) -> Result<DesiredInjectionResult> {
        let uid = review_uid(workload, Utc::now().timestamp_millis());
        let review = admission_review(workload, template, &uid)?;

        let start = Instant::now();
        let result = self.call(&review, timeout).await.and_then(|body| {
            desired_image_from_review(&body, &uid, &self.sidecar_container).map_err(Error::from)
        });
        let elapsed = start.elapsed();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::WebhookValidation(_)) => "invalid",
            Err(_) => "unavailable",
        };
        info!(
            namespace = %workload.namespace,
            name = %workload.name,
            kind = %workload.kind,
            outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Evaluated sidecar injection"
        );

        let desired_image = result?;

        let webhook_latency_ok = elapsed <= self.slow_threshold;
        if !webhook_latency_ok {
            warn!(
                "Injection webhook took {}ms for {workload}, above the {}ms threshold",
                elapsed.as_millis(),
                self.slow_threshold.as_millis()
            );
        }

        Ok(DesiredInjectionResult {
            template_fingerprint: workload.fingerprint.clone(),
            desired_image,
            webhook_latency_ok,
            raw_patch_validated: true,
        })
    }
}

/// Unique per call so that a response can be matched to the request it answers
pub fn review_uid(workload: &WorkloadRef, millis: i64) -> String {
    format!("sidecar-drift-{}-{millis}", workload.fingerprint)
}

/// A synthetic pod CREATE review for `template`, flagged as a dry run so nothing is persisted.
pub fn admission_review(
    workload: &WorkloadRef,
    template: &PodTemplateSpec,
    uid: &str,
) -> Result<Value> {
    let mut metadata = serde_json::to_value(template.metadata.clone().unwrap_or_default())?;
    metadata["namespace"] = json!(workload.namespace);
    metadata["generateName"] = json!(format!("{}-", workload.name));

    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
        "spec": template.spec,
    });

    Ok(json!({
        "apiVersion": ADMISSION_API_VERSION,
        "kind": ADMISSION_REVIEW_KIND,
        "request": {
            "uid": uid,
            "kind": { "group": "", "version": "v1", "kind": "Pod" },
            "resource": { "group": "", "version": "v1", "resource": "pods" },
            "requestKind": { "group": "", "version": "v1", "kind": "Pod" },
            "requestResource": { "group": "", "version": "v1", "resource": "pods" },
            "namespace": workload.namespace,
            "operation": "CREATE",
            "userInfo": {},
            "object": pod,
            "dryRun": true,
        }
    }))
}

/// Extract the sidecar image from an admission review response, refusing anything that does not
/// look exactly like a JSON patch injecting one sidecar container with one image, or that
/// answers a request other than `request_uid`.
pub fn desired_image_from_review(
    body: &[u8],
    request_uid: &str,
    sidecar_container: &str,
) -> Result<String, WebhookValidationError> {
    use WebhookValidationError::*;

    let review: Value = serde_json::from_slice(body).map_err(|_| NotJson)?;
    let api_version = str_field(&review, "apiVersion");
    if api_version != ADMISSION_API_VERSION {
        return Err(UnexpectedApiVersion(api_version.to_owned()));
    }
    let kind = str_field(&review, "kind");
    if kind != ADMISSION_REVIEW_KIND {
        return Err(UnexpectedKind(kind.to_owned()));
    }

    let response = review
        .get("response")
        .and_then(Value::as_object)
        .ok_or(MissingResponse)?;

    match response.get("uid").and_then(Value::as_str) {
        None => return Err(MissingUid),
        Some(uid) if uid != request_uid => return Err(UidMismatch(uid.to_owned())),
        Some(_) => {}
    }

    match response.get("allowed") {
        Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            let message = response
                .get("status")
                .and_then(|s| s.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            return Err(NotAllowed(message.to_owned()));
        }
        _ => return Err(MalformedField("response.allowed")),
    }

    match response.get("patchType") {
        None => {}
        Some(Value::String(t)) if t == "JSONPatch" => {}
        Some(Value::String(t)) => return Err(UnsupportedPatchType(t.clone())),
        Some(_) => return Err(MalformedField("response.patchType")),
    }

    let patch = response.get("patch").ok_or(MissingPatch)?;
    let patch: ByteString = serde_json::from_value(patch.clone()).map_err(|_| UndecodablePatch)?;
    let operations: Value = serde_json::from_slice(&patch.0).map_err(|_| UndecodablePatch)?;
    let operations = operations.as_array().ok_or(PatchNotAList)?;

    let mut images = BTreeSet::new();
    for (index, operation) in operations.iter().enumerate() {
        let malformed = |problem| MalformedOperation { index, problem };

        let operation = operation.as_object().ok_or(malformed("not an object"))?;
        let op = operation
            .get("op")
            .and_then(Value::as_str)
            .ok_or(malformed("missing 'op'"))?;
        let path = operation
            .get("path")
            .and_then(Value::as_str)
            .ok_or(malformed("missing 'path'"))?;

        match op {
            "add" | "replace" => {}
            "remove" | "move" | "copy" | "test" => continue,
            _ => return Err(malformed("unknown 'op'")),
        }

        let value = operation.get("value").ok_or(malformed("missing 'value'"))?;

        let segments: Vec<&str> = path.split('/').skip(1).collect();
        match segments.as_slice() {
            ["spec", "containers" | "initContainers"] => {
                let containers = value.as_array().ok_or(malformed("'value' is not a list"))?;
                for container in containers {
                    collect_sidecar_image(container, sidecar_container, &mut images, malformed)?;
                }
            }
            ["spec", "containers" | "initContainers", _] => {
                collect_sidecar_image(value, sidecar_container, &mut images, malformed)?;
            }
            _ => {}
        }
    }

    let mut images = images.into_iter();
    match (images.next(), images.next()) {
        (None, _) => Err(NoSidecar(sidecar_container.to_owned())),
        (Some(image), None) => Ok(image),
        (Some(_), Some(_)) => Err(AmbiguousSidecar(sidecar_container.to_owned())),
    }
}

fn str_field<'a>(value: &'a Value, name: &str) -> &'a str {
    value.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn collect_sidecar_image(
    container: &Value,
    sidecar_container: &str,
    images: &mut BTreeSet<String>,
    malformed: impl Fn(&'static str) -> WebhookValidationError,
) -> Result<(), WebhookValidationError> {
    let container = container
        .as_object()
        .ok_or_else(|| malformed("container is not an object"))?;

    if container.get("name").and_then(Value::as_str) != Some(sidecar_container) {
        return Ok(());
    }

    let image = container
        .get("image")
        .and_then(Value::as_str)
        .ok_or(WebhookValidationError::InvalidImage)?;

    if !is_image_reference(image) {
        return Err(WebhookValidationError::InvalidImage);
    }

    images.insert(image.to_owned());
    Ok(())
}

fn is_image_reference(image: &str) -> bool {
    static IMAGE: OnceLock<Regex> = OnceLock::new();
    IMAGE
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:@+-]{0,511}$").expect("image regex to compile")
        })
        .is_match(image)
}
