mod config;
mod context;
mod maintenance;
mod media;
mod outbox;
mod parser;
mod providers;
mod quota;
mod scheduler;
mod stages;
mod supervisor;

use crate::config::PipelineConfig;
use crate::context::AppContext;
use crate::providers::Providers;
use crate::stages::digest::DigestStage;
use crate::stages::enrichment::EnrichmentStage;
use crate::stages::graph::GraphStage;
use crate::stages::indexing::IndexingStage;
use crate::stages::tagging::TaggingStage;
use crate::stages::trends::TrendStage;
use crate::stages::vision::VisionStage;
use crate::supervisor::{Supervisor, TaskConfig};
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use miette::IntoDiagnostic;
use std::sync::Arc;
use tgclient::TgClient;
use tgpulse_bus::{Coordinator, StreamBus};
use tgpulse_cas::Cas;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = Arc::new(PipelineConfig::config().into_diagnostic()?);
    info!(
        "Starting pipeline for {} tenant(s) on instance {}",
        config.tenants.len(),
        std::process::id()
    );

    // Metrics double as the health surface: task-state gauges, counters,
    // and the exporter's HTTP listener.
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .into_diagnostic()?;

    // Migrations before anything touches the schema; the advisory lock
    // keeps concurrent instances from racing each other.
    tokio::task::spawn_blocking(tgpulse_db::migrations::run_migrations)
        .await
        .into_diagnostic()??;

    let pool = tgpulse_db::pool::get_pool(config.db_pool_size).into_diagnostic()?;
    {
        let mut conn = pool.get().into_diagnostic()?;
        tgpulse_db::db::set_statement_timeout(&mut conn, 30).into_diagnostic()?;
    }
    let bus = StreamBus::connect(&config.redis_url)
        .await
        .into_diagnostic()?;
    let coordinator = Coordinator::new(&bus);
    let cas = Cas::from_environment(config.s3_bucket.clone()).await;
    let tg = TgClient::new(
        config.gateway.base_url.clone(),
        config.gateway.token.clone(),
        config.gateway.page_size,
    );
    let providers = Arc::new(Providers::new(config.providers.clone()));

    let ctx = AppContext {
        config: config.clone(),
        pool,
        bus,
        coordinator,
        cas,
        tg,
        providers,
        instance_id: Uuid::new_v4().to_string(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received; draining");
                shutdown.cancel();
            }
        }
    });

    let mut supervisor = Supervisor::new(ctx, shutdown.clone());

    supervisor.register(TaskConfig::new(
        "scheduler",
        Box::new(|ctx, cancel| Box::pin(scheduler::run_scheduler(ctx, cancel))),
    ));
    supervisor.register(TaskConfig::new(
        "outbox_relay",
        Box::new(|ctx, cancel| Box::pin(outbox::run_outbox_relay(ctx, cancel))),
    ));
    supervisor.register(TaskConfig::new(
        "maintenance",
        Box::new(|ctx, cancel| Box::pin(maintenance::run_maintenance(ctx, cancel))),
    ));

    supervisor.register(TaskConfig::new(
        "tagging",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.tagging_workers;
            Box::pin(stages::run_stage(Arc::new(TaggingStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "enrichment",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.enrichment_workers;
            Box::pin(stages::run_stage(Arc::new(EnrichmentStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "indexing",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.indexing_workers;
            Box::pin(stages::run_stage(Arc::new(IndexingStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "graph",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.graph_workers;
            Box::pin(stages::run_stage(Arc::new(GraphStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "vision",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.vision_workers;
            Box::pin(stages::run_stage(Arc::new(VisionStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "trends",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.trend_workers;
            Box::pin(stages::run_stage(Arc::new(TrendStage), ctx, workers, cancel))
        }),
    ));
    supervisor.register(TaskConfig::new(
        "digest",
        Box::new(|ctx, cancel| {
            let workers = ctx.config.stages.digest_workers;
            Box::pin(stages::run_stage(Arc::new(DigestStage), ctx, workers, cancel))
        }),
    ));

    supervisor.run().await
}
