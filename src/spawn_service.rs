use std::future::Future;
use std::time::Duration;

use eyre::{Context, Report, Result};
use tokio::task::{JoinError, JoinHandle};
use tokio::{select, spawn};
use tracing::{debug, error, span, warn, Instrument, Level};

use crate::shutdown::{Shutdown, ShutdownReason};

#[derive(Debug)]
pub enum ServiceExit {
    GracefulShutdown,
    EarlyStop,
    Failed(Report),
    Panic(JoinError),
}

/// Runs a long-lived task. A task that stops on its own takes the whole process down with it.
pub fn spawn_service<F>(
    shutdown: &Shutdown,
    name: impl Into<String>,
    future: F,
) -> Result<JoinHandle<ServiceExit>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let service_name = name.into();

    let wrapped = {
        let shutdown = shutdown.clone();
        async move {
            match spawn(future).await {
                Ok(Ok(())) if shutdown.is_shutdown_triggered() => ServiceExit::GracefulShutdown,
                Ok(Ok(())) => {
                    shutdown.trigger_shutdown(ShutdownReason::Failure);
                    ServiceExit::EarlyStop
                }
                Ok(Err(err)) => {
                    shutdown.trigger_shutdown(ShutdownReason::Failure);
                    ServiceExit::Failed(err)
                }
                Err(err) => {
                    shutdown.trigger_shutdown(ShutdownReason::Failure);
                    ServiceExit::Panic(err)
                }
            }
        }
    };

    let logged = {
        let shutdown = shutdown.clone();
        async move {
            let mut wrapped = Box::pin(wrapped);
            let shutdown_log = async move {
                shutdown.wait_shutdown_triggered().await;
                tokio::time::sleep(Duration::from_secs(3)).await;
            };

            debug!("Service starting");
            select! {
                exit = &mut wrapped => {
                    log_exit(&exit);
                    exit
                },
                _ = shutdown_log => {
                    warn!("Service shutdown is taking some time");
                    let exit = wrapped.await;
                    log_exit(&exit);
                    exit
                },
            }
        }
    };

    let instrumented = logged.instrument(span!(Level::ERROR, "service", "{}", service_name));

    let waited = shutdown
        .wrap_delay_shutdown(instrumented)
        .context(service_name)?;

    Ok(spawn(waited))
}

fn log_exit(exit: &ServiceExit) {
    match exit {
        ServiceExit::GracefulShutdown => debug!("Service gracefully shutdown"),
        ServiceExit::EarlyStop => error!("Service stopped early"),
        ServiceExit::Failed(err) => error!(?err, "Service failed"),
        ServiceExit::Panic(err) => error!(%err, "Service panicked"),
    }
}
