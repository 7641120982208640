use std::future::Future;

use async_shutdown::{
    ShutdownAlreadyCompleted, ShutdownComplete, ShutdownManager, ShutdownSignal,
    WrapDelayShutdown,
};
use tokio::signal;
use tracing::info;

/// Why the process is going down. The first reason given wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    Failure,
}

#[derive(Clone)]
pub struct Shutdown {
    manager: ShutdownManager<ShutdownReason>,
}

impl Shutdown {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Shutdown {
        Self::new_with_signal(shutdown_signal())
    }

    pub fn new_with_signal<F>(signal: F) -> Shutdown
    where
        F: Future + Send + 'static,
    {
        let manager = ShutdownManager::new();

        tokio::spawn({
            let manager = manager.clone();

            async move {
                select_signal(signal, manager.wait_shutdown_triggered()).await;
                if manager.trigger_shutdown(ShutdownReason::Signal).is_ok() {
                    info!("Shutdown start");
                }
            }
        });

        Shutdown { manager }
    }

    pub fn wrap_delay_shutdown<F: Future>(
        &self,
        future: F,
    ) -> Result<WrapDelayShutdown<ShutdownReason, F>, ShutdownAlreadyCompleted<ShutdownReason>> {
        self.manager.wrap_delay_shutdown(future)
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        _ = self.manager.trigger_shutdown(reason);
    }

    pub fn is_shutdown_triggered(&self) -> bool {
        self.manager.is_shutdown_triggered()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.manager.shutdown_reason()
    }

    pub fn wait_shutdown_triggered(&self) -> ShutdownSignal<ShutdownReason> {
        self.manager.wait_shutdown_triggered()
    }

    pub fn wait_shutdown_complete(&self) -> ShutdownComplete<ShutdownReason> {
        self.manager.wait_shutdown_complete()
    }
}

// Stops listening for signals once something else started the shutdown.
async fn select_signal<F: Future>(signal: F, triggered: ShutdownSignal<ShutdownReason>) {
    tokio::select! {
        _ = signal => {},
        _ = triggered => {},
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler")
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    {
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        };
    }
}
