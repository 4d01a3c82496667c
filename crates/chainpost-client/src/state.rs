//! Connection-scoped state owned by the manager.
//!
//! A [`Session`] lives exactly as long as one node connection. Everything it
//! holds is torn down together; the pool, pruner records and consensus view
//! live on the manager and survive reconnection.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use chainpost_net::ConnectionHandle;

/// A cancellable background task and its join handle.
pub(crate) struct Supervised {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Supervised {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self, name: &'static str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }
}

pub(crate) struct Session {
    /// Distinguishes this session from the one that replaced it
    pub id: u64,
    pub address: String,
    pub handle: ConnectionHandle,
    /// Shared by every task below
    pub cancel: CancellationToken,
    /// The socket task from `open_connection`
    pub connection: JoinHandle<()>,
    /// Dispatch, sync heartbeat and retry sweep
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
}
