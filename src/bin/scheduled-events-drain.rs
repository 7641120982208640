use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::config::Frame;
use eyre::{eyre, Context, Result};
use tokio::select;
use tracing::{debug, error, info, Level};
use tracing_error::ErrorLayer;
use tracing_subscriber::filter::FromEnvError;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, EnvFilter};

use scheduled_events_drain::{
    spawn_service, start_server, CommandBackend, Config, DrainMode, Evacuate, EvacuationBackend,
    EventEngine, HealthStatus, Identity, KubernetesBackend, MetadataClient, MetadataSource,
    Metrics, NoopBackend, Shutdown, ShutdownReason,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let config = Config::parse();

    init_tracing_subscriber(config.log_json)?;
    install_color_eyre()?;

    print_build_info();

    let shutdown = Shutdown::new();
    if let Err(err) = try_main(config, &shutdown).await {
        error!(?err, "Failed to start");
        shutdown.trigger_shutdown(ShutdownReason::Failure);
    }

    let reason = shutdown.wait_shutdown_triggered().await;

    select! {
        _ = shutdown.wait_shutdown_complete() => {},
        _ = tokio::time::sleep(Duration::from_secs(1)) => {
            info!("Waiting for graceful shutdown");
            shutdown.wait_shutdown_complete().await;
        }
    }

    info!("Bye!");
    match reason {
        ShutdownReason::Signal => Ok(ExitCode::SUCCESS),
        ShutdownReason::Failure => Ok(ExitCode::from(1)),
    }
}

async fn try_main(config: Config, shutdown: &Shutdown) -> Result<()> {
    let metadata = MetadataClient::try_new(&config.metadata_config())?;
    let identity = match &config.vm_node_name {
        Some(name) => Identity::new(name.clone()),
        None => metadata
            .fetch_identity()
            .await
            .context("resolving instance name from metadata")?,
    };

    info!(vm = %identity.local_resource_name, "Starting");

    let backend = build_backend(&config, &identity).await?;
    if config.drain_enable {
        backend.test().await.context("testing drain backend")?;
        info!("Drain backend ready");
    }

    let metrics = Arc::new(Metrics::new());
    let health = HealthStatus::default();
    start_server(config.server_bind, health.clone(), metrics.clone(), shutdown).await?;

    let engine = EventEngine::new(config.engine_config(), identity, metadata, backend, metrics)
        .with_notifier(config.notifier())
        .with_observer(Arc::new(health));

    spawn_service(shutdown, "engine", {
        let shutdown = shutdown.clone();

        async move {
            engine
                .run(async move {
                    shutdown.wait_shutdown_triggered().await;
                })
                .await?;
            Ok(())
        }
    })?;

    info!("Services started");
    Ok(())
}

async fn build_backend(config: &Config, identity: &Identity) -> Result<EvacuationBackend> {
    if !config.drain_enable {
        return Ok(EvacuationBackend::Noop(NoopBackend::new(
            identity.local_resource_name.clone(),
        )));
    }

    match config.drain_mode {
        Some(DrainMode::Kubernetes) => {
            let Some(node_name) = config.kube_node_name.clone() else {
                return Err(eyre!("kube-node-name is required in kubernetes drain mode"));
            };
            let client = kube::Client::try_default().await?;
            Ok(EvacuationBackend::Kubernetes(KubernetesBackend::new(
                client,
                node_name,
                config.kube_drain_config(),
            )))
        }
        Some(DrainMode::Command) => Ok(EvacuationBackend::Command(CommandBackend::new(
            config.command_config(),
            identity.local_resource_name.clone(),
        ))),
        None => Err(eyre!("drain-mode is required when drain is enabled")),
    }
}

fn selfish_frame_filter(frames: &mut Vec<&Frame>) {
    frames.retain(|frame| {
        matches!(frame.name.as_ref(),
            Some(name) if name == "scheduled_events_drain"
            || name.starts_with("scheduled_events_drain::"))
    });
}

fn init_tracing_subscriber(json: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(json.then(|| {
            let layer = Layer::default().json();
            layer.with_filter(env_filter())
        }))
        .with((!json).then(|| {
            let layer = Layer::default();
            layer.with_filter(env_filter())
        }))
        .with({
            let layer = ErrorLayer::default();
            layer.with_filter(env_filter())
        })
        .try_init()?;

    return Ok(());

    fn env_filter() -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(Directive::from(Level::INFO))
            .from_env()
            .unwrap_or_else(|err: FromEnvError| {
                eprintln!("ignoring invalid RUST_LOG: {err}");
                EnvFilter::new(Level::INFO.as_str())
            })
    }
}

fn install_color_eyre() -> Result<()> {
    color_eyre::config::HookBuilder::new()
        .capture_span_trace_by_default(true)
        .add_frame_filter(Box::new(selfish_frame_filter))
        .install()?;
    Ok(())
}

fn print_build_info() {
    info!("tag: {}", env!("VERGEN_GIT_DESCRIBE"));
    debug!("branch: {}", env!("VERGEN_GIT_BRANCH"));
    debug!("commit: {}", env!("VERGEN_GIT_SHA"));
    debug!("commit date: {}", env!("VERGEN_GIT_COMMIT_DATE"));

    debug!("rustc: {}", env!("VERGEN_RUSTC_SEMVER"));
    debug!("build date: {}", env!("VERGEN_BUILD_TIMESTAMP"));
}
