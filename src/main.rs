use std::path::PathBuf;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use reqwest::Url;

pub use sidecar_drift_operator::{self, config, telemetry, Config, State};

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Arguments {
    /// Name of the injected proxy container
    #[arg(long, env = "SIDECAR_CONTAINER", default_value = config::DEFAULT_SIDECAR_CONTAINER)]
    sidecar_container: String,

    /// Pod template annotation used to trigger restarts
    #[arg(long, env = "RESTART_ANNOTATION", default_value = config::DEFAULT_RESTART_ANNOTATION)]
    restart_annotation: String,

    /// Compare sidecar images without their registry and repository path
    #[arg(long, env = "HUB_AWARE")]
    hub_aware: bool,

    #[arg(long, env = "COOLDOWN_SECONDS", default_value_t = 30 * 60)]
    cooldown_seconds: u64,

    #[arg(long, env = "WEBHOOK_URL", default_value = config::DEFAULT_WEBHOOK_URL)]
    webhook_url: Url,

    /// PEM bundle that signs the webhook's serving certificate
    #[arg(long, env = "WEBHOOK_CA_FILE", value_name = "PATH")]
    webhook_ca_file: Option<PathBuf>,

    #[arg(long, env = "WEBHOOK_TIMEOUT_SECONDS", default_value_t = 10)]
    webhook_timeout_seconds: u64,

    #[arg(long, env = "WEBHOOK_SLOW_THRESHOLD_MS", default_value_t = 2000)]
    webhook_slow_threshold_ms: u64,

    #[arg(long, env = "DESIRED_IMAGE_TTL_SECONDS", default_value_t = 5 * 60)]
    desired_image_ttl_seconds: u64,

    #[arg(long, env = "CACHE_IDLE_EVICTION_SECONDS", default_value_t = 60 * 60)]
    cache_idle_eviction_seconds: u64,

    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value_t = 60)]
    reconcile_timeout_seconds: u64,

    #[arg(long, env = "MAX_CONFLICT_RETRIES", default_value_t = 3)]
    max_conflict_retries: u32,

    #[arg(long, env = "RESYNC_INTERVAL_SECONDS", default_value_t = 10 * 60)]
    resync_interval_seconds: u64,

    #[arg(long, env = "ERROR_BACKOFF_BASE_SECONDS", default_value_t = 5)]
    error_backoff_base_seconds: u64,

    #[arg(long, env = "ERROR_BACKOFF_MAX_SECONDS", default_value_t = 5 * 60)]
    error_backoff_max_seconds: u64,

    /// Workloads reconciled in parallel, per kind
    #[arg(long, env = "CONCURRENCY", default_value_t = 8)]
    concurrency: u16,

    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 2000)]
    debounce_ms: u64,
}

impl From<Arguments> for Config {
    fn from(args: Arguments) -> Self {
        Config {
            sidecar_container: args.sidecar_container,
            restart_annotation: args.restart_annotation,
            hub_aware: args.hub_aware,
            cooldown: Duration::from_secs(args.cooldown_seconds),
            webhook_url: args.webhook_url,
            webhook_ca_file: args.webhook_ca_file,
            webhook_timeout: Duration::from_secs(args.webhook_timeout_seconds),
            webhook_slow_threshold: Duration::from_millis(args.webhook_slow_threshold_ms),
            desired_image_ttl: Duration::from_secs(args.desired_image_ttl_seconds),
            cache_idle_eviction: Duration::from_secs(args.cache_idle_eviction_seconds),
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_seconds),
            max_conflict_retries: args.max_conflict_retries,
            resync_interval: Duration::from_secs(args.resync_interval_seconds),
            error_backoff_base: Duration::from_secs(args.error_backoff_base_seconds),
            error_backoff_max: Duration::from_secs(args.error_backoff_max_seconds),
            concurrency: args.concurrency,
            debounce: Duration::from_millis(args.debounce_ms),
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args: Arguments = Arguments::parse();
    let config = Config::from(args).validate()?;

    // Initiatilize Kubernetes controller state
    let state = State::new(config);
    let controller = sidecar_drift_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    controller?;
    server?;
    Ok(())
}
