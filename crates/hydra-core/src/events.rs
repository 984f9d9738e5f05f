//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Inbound handler task queue.
//!
//! Every inbound message is handled on its own task so a slow handler never
//! stalls the subscription. The handles are funnelled to a single drain task,
//! which lets shutdown wait for in-flight handlers up to a deadline.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Runs inbound handlers as independent tasks and tracks them for flushing.
pub struct EventQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<JoinHandle<()>>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JoinHandle<()>>();
        let drain = tokio::spawn(async move {
            while let Some(handle) = rx.recv().await {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        error!(error = %err, "inbound handler panicked");
                    }
                }
            }
            debug!("event queue drained");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Run `work` on its own task. Returns false once the queue is closed.
    pub fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!("event queue closed; dropping inbound work");
            return false;
        };
        tx.send(tokio::spawn(work)).is_ok()
    }

    /// Stop accepting work and wait for queued handlers, at most `deadline`.
    /// Returns whether everything finished in time.
    pub async fn flush(&self, deadline: Duration) -> bool {
        self.tx.lock().take();
        let Some(drain) = self.drain.lock().take() else {
            return true;
        };
        match tokio::time::timeout(deadline, drain).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(error = %err, "event queue drain task join error");
                false
            }
            Err(_) => {
                warn!(?deadline, "inbound handlers still running at flush deadline");
                false
            }
        }
    }

    /// Stop accepting work without waiting. Running handlers are left to finish detached.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(drain) = self.drain.lock().take() {
            drain.abort();
        }
    }
}
