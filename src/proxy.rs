//! The proxy engine: runs every configured context until shutdown.

use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::{ProxyContext, ProxyContextSpec};
use crate::error::{Error, Result};

/// Requests an orderly shutdown of a running [`Proxy`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Tear down every context and make [`Proxy::run`] return.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// One or more proxy contexts sharing the process event loop.
#[derive(Debug)]
pub struct Proxy {
    specs: Vec<ProxyContextSpec>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Proxy {
    pub fn new(specs: Vec<ProxyContextSpec>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            specs,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Start every context and serve them until shutdown.
    ///
    /// A context that fails to start is skipped. With a single context its
    /// error is returned; otherwise the run only fails if no context started.
    /// Returns once every context is closed.
    pub async fn run(mut self) -> Result<()> {
        info!(contexts = self.specs.len(), "Proxy starting");

        let single = self.specs.len() == 1;
        let mut contexts = Vec::with_capacity(self.specs.len());
        let mut last_error = None;

        for spec in std::mem::take(&mut self.specs) {
            if self.shutdown_requested() {
                break;
            }
            let label = spec.label.clone();
            match ProxyContext::start(spec).await {
                Ok(context) => contexts.push(context),
                Err(e) => {
                    error!(context = %label, error = %e, "Skipping proxy context");
                    last_error = Some(e);
                }
            }
        }

        if contexts.is_empty() {
            if self.shutdown_requested() {
                return Ok(());
            }
            return Err(match last_error {
                Some(e) if single => e,
                _ => Error::NoActiveContexts,
            });
        }

        info!(running = contexts.len(), "Proxy running");

        let mut lost_all = false;
        loop {
            if self.shutdown_requested() {
                break;
            }
            if contexts.is_empty() {
                lost_all = true;
                break;
            }

            let closed = {
                let waits = contexts.iter_mut().map(|c| Box::pin(c.closed()));
                tokio::select! {
                    _ = self.shutdown_rx.changed() => None,
                    (role, index, _) = select_all(waits) => Some((index, role)),
                }
            };

            if let Some((index, role)) = closed {
                let mut context = contexts.swap_remove(index);
                warn!(context = %context.label(), role = %role, "Bus connection closed; tearing down context");
                context.shutdown().await;
            }
        }

        info!("Shutting down proxy contexts");
        for context in contexts.iter_mut() {
            context.shutdown().await;
        }

        if lost_all {
            error!("Every proxy context lost its bus connection");
            return Err(Error::ConnectionClosed("all proxy contexts".to_string()));
        }
        info!("Proxy stopped");
        Ok(())
    }
}
