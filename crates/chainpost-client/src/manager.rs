//! Connection manager: owns the node connection and the lifecycle stores.
//!
//! ```text
//! DISCONNECTED --connect--> CONNECTING --open--> CONNECTED
//! CONNECTED --disconnect--> DISCONNECTED
//! CONNECTED --lost--> RECONNECTING --ok--> CONNECTED
//!                                  --gave up--> DISCONNECTED
//! ```
//!
//! Connect, disconnect and every reconnect attempt run under one lifecycle
//! lock. Connection-scoped tasks (dispatch, sync heartbeat, retry sweep and
//! the pruner sweep) are started per session and torn down with it; the
//! pool, pruner records and consensus view outlive sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainpost_net::{open_connection, ConnectionHandle, NetError};
use chainpost_shared::constants::{MAX_RETRY_REASON, NORMAL_CLOSURE_CODE, POOL_CLEANUP_INTERVAL};
use chainpost_shared::{
    ChainError, ConnectionState, Frame, IdentityError, IdentityProvider, NetworkStatus,
    Transaction, TransactionRequest, TransactionSigner,
};
use chainpost_store::{
    ConsensusHandler, DeliveredMessage, MessagePruner, PruneNotifier, TransactionPool, TxStatus,
};

use crate::config::ClientConfig;
use crate::events::{InboundMessage, SubscriberRegistry};
use crate::observer::{DeliveryObserver, NoopObserver};
use crate::state::{Session, Supervised};

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    signer: TransactionSigner,
    pub(crate) pool: TransactionPool,
    pub(crate) pruner: MessagePruner,
    pub(crate) consensus: ConsensusHandler,
    pub(crate) subscribers: SubscriberRegistry,
    pub(crate) observer: Arc<dyn DeliveryObserver>,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) status_tx: watch::Sender<NetworkStatus>,
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    known_address: Mutex<Option<String>>,
    reconnect: Mutex<Option<Supervised>>,
    pool_cleanup: Mutex<Option<Supervised>>,
    next_session_id: AtomicU64,
    initialized: AtomicBool,
}

/// Entry point for the presentation layer. Cheap to clone; all clones drive
/// the same connection.
///
/// Background tasks hold clones too, so call [`shutdown`](Self::shutdown)
/// before dropping the last handle.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::with_observer(config, identity, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: ClientConfig,
        identity: Arc<dyn IdentityProvider>,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        let pruner = MessagePruner::with_interval(config.prune_interval);
        let subscribers = SubscriberRegistry::new(config.subscriber_buffer);
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                signer: TransactionSigner::new(),
                pool: TransactionPool::new(),
                pruner,
                consensus: ConsensusHandler::new(),
                subscribers,
                observer,
                state_tx: watch::channel(ConnectionState::Disconnected).0,
                status_tx: watch::channel(NetworkStatus::disconnected()).0,
                lifecycle: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
                known_address: Mutex::new(None),
                reconnect: Mutex::new(None),
                pool_cleanup: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the pool cleanup task and prepare the pruner. Safe to call more
    /// than once; returns `false` when already initialized. Must run inside
    /// a Tokio runtime.
    pub fn initialize(&self) -> bool {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.inner.pruner.initialize();
        let cancel = CancellationToken::new();
        let task = self
            .inner
            .pool
            .spawn_cleanup(POOL_CLEANUP_INTERVAL, cancel.clone());
        *lock(&self.inner.pool_cleanup) = Some(Supervised::new(cancel, task));

        info!(user = %self.inner.identity.user_id(), "Connection manager initialized");
        true
    }

    /// Connect to a node, replacing any existing connection.
    ///
    /// Fails if the WebSocket handshake does not complete within the
    /// configured timeout. The manager is left DISCONNECTED in that case and
    /// no automatic reconnection is scheduled.
    pub async fn connect(&self, address: &str) -> Result<(), ChainError> {
        self.initialize();
        self.cancel_reconnect().await;

        let _guard = self.inner.lifecycle.lock().await;
        self.teardown_session().await;
        *lock(&self.inner.known_address) = Some(address.to_string());
        self.set_state(ConnectionState::Connecting);

        match self.establish(address).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(address, error = %e, "Connect failed");
                self.mark_disconnected();
                Err(e)
            }
        }
    }

    /// Connect to the node the identity is homed on, falling back to the
    /// configured node address.
    pub async fn connect_as_user(&self) -> Result<(), ChainError> {
        let address = self
            .inner
            .identity
            .node_address()
            .or_else(|| self.inner.config.node_address.clone())
            .ok_or(IdentityError::NoNodeAddress)?;
        self.connect(&address).await
    }

    /// Connect again to the last node address used.
    pub async fn reconnect(&self) -> Result<(), ChainError> {
        let address = self.known_node_address().ok_or(ChainError::NoKnownNode)?;
        info!(address = %address, "Reconnect requested");
        self.connect(&address).await
    }

    /// Close the connection with a normal closure and stop every
    /// connection-scoped task. Pool and pruner records are kept.
    pub async fn disconnect(&self) {
        self.cancel_reconnect().await;

        let _guard = self.inner.lifecycle.lock().await;
        if !self.teardown_session().await {
            debug!("Disconnect while not connected");
        }
        self.inner.pruner.stop().await;
        self.mark_disconnected();
    }

    /// Disconnect and stop the pool cleanup task.
    pub async fn shutdown(&self) {
        self.disconnect().await;

        let cleanup = lock(&self.inner.pool_cleanup).take();
        if let Some(cleanup) = cleanup {
            cleanup.stop("pool-cleanup").await;
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Connection manager shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected() && lock(&self.inner.session).is_some()
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sign, track and transmit a transaction. Returns its hash as soon as
    /// the frame is queued; confirmation arrives through the inbound path.
    pub async fn send(&self, request: TransactionRequest) -> Result<String, ChainError> {
        let handle = self.live_handle().ok_or(ChainError::NotConnected)?;

        let unsigned = Transaction::from_request(request, self.inner.identity.user_id());
        let signed = self
            .inner
            .signer
            .sign_with(&unsigned, self.inner.identity.as_ref())?;
        let frame = Frame::send_transaction(&signed)
            .map_err(|e| ChainError::Serialization(e.to_string()))?;

        if !self.inner.pool.add(signed.clone()).await {
            // Same id submitted before: keep the first attempt
            let existing = self
                .inner
                .pool
                .get(&signed.id)
                .await
                .map(|entry| entry.transaction.transaction_hash);
            return Ok(existing.unwrap_or(signed.transaction_hash));
        }

        if let Err(e) = handle.try_send_frame(&frame) {
            let reason = format!("transmission failed: {e}");
            self.inner.pool.fail(&signed.id, &reason).await;
            self.inner.observer.on_failed(&signed.id, &reason);
            return Err(ChainError::Connection(reason));
        }

        debug!(tx_id = %signed.id, hash = %signed.transaction_hash, "Transaction sent");
        Ok(signed.transaction_hash)
    }

    /// Force-prune delivered records older than `cutoff`, telling the node
    /// when connected. Returns the pruned hashes.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let pruned = self.inner.pruner.force_prune_older_than(cutoff).await;
        if pruned.is_empty() {
            return pruned;
        }

        match self.live_handle() {
            Some(handle) => {
                let frame = Frame::prune_messages(cutoff.timestamp_millis());
                if let Err(e) = handle.try_send_frame(&frame) {
                    warn!(error = %e, "Prune notification not sent");
                }
            }
            None => debug!(count = pruned.len(), "Pruned locally while disconnected"),
        }
        pruned
    }

    /// Ask the node to delete a message. Best effort: returns `false` and
    /// does nothing else when not connected.
    pub fn send_deletion(&self, message_id: &str) -> bool {
        let Some(handle) = self.live_handle() else {
            info!(message_id, "Not connected, deletion skipped");
            return false;
        };
        match handle.try_send_frame(&Frame::delete_message(message_id)) {
            Ok(()) => true,
            Err(e) => {
                warn!(message_id, error = %e, "Deletion not sent");
                false
            }
        }
    }

    /// Resend every pending transaction due for retry, then count the
    /// attempt. The attempt that reaches `MAX_RETRY` is still sent before the
    /// entry fails.
    pub(crate) async fn retry_pending(&self, handle: &ConnectionHandle) -> usize {
        self.retry_pending_at(handle, Utc::now()).await
    }

    pub(crate) async fn retry_pending_at(
        &self,
        handle: &ConnectionHandle,
        now: DateTime<Utc>,
    ) -> usize {
        let mut resent = 0;
        for tx in self.inner.pool.transactions_for_retry_at(now).await {
            match Frame::send_transaction(&tx) {
                Ok(frame) => match handle.try_send_frame(&frame) {
                    Ok(()) => {
                        debug!(tx_id = %tx.id, "Transaction resent");
                        resent += 1;
                    }
                    Err(e) => warn!(tx_id = %tx.id, error = %e, "Resend failed"),
                },
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "Could not encode transaction for retry")
                }
            }

            if self.inner.pool.increment_retry_at(&tx.id, now).await == Some(TxStatus::Failed) {
                self.inner.observer.on_failed(&tx.id, MAX_RETRY_REASON);
            }
        }
        if resent > 0 {
            info!(resent, "Retry sweep finished");
        }
        resent
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Inbound messages addressed to `user_id`, in arrival order.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<InboundMessage> {
        self.inner.subscribers.subscribe(user_id)
    }

    /// Live receivers on `user_id`'s stream.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.inner.subscribers.subscriber_count(user_id)
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn watch_network_status(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn known_node_address(&self) -> Option<String> {
        lock(&self.inner.known_address).clone()
    }

    pub fn user_id(&self) -> String {
        self.inner.identity.user_id()
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.inner.pool
    }

    pub fn pruner(&self) -> &MessagePruner {
        &self.inner.pruner
    }

    pub fn consensus(&self) -> &ConsensusHandler {
        &self.inner.consensus
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.inner.status_tx.send_modify(|status| status.connected = false);
    }

    fn live_handle(&self) -> Option<ConnectionHandle> {
        if !self.connection_state().is_connected() {
            return None;
        }
        lock(&self.inner.session)
            .as_ref()
            .map(|session| session.handle.clone())
    }

    /// Open a connection and start its tasks. Callers hold the lifecycle
    /// lock. The only suspension point is the handshake, so dropping this
    /// future leaves no partial session behind.
    async fn establish(&self, address: &str) -> Result<(), ChainError> {
        let connection = open_connection(address, self.inner.config.handshake_timeout)
            .await
            .map_err(|e| match e {
                NetError::Timeout(_) => ChainError::HandshakeTimeout,
                other => ChainError::Connection(other.to_string()),
            })?;
        let (handle, notifications, connection_task) = connection.into_parts();

        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *lock(&self.inner.session) = Some(Session {
            id,
            address: address.to_string(),
            handle: handle.clone(),
            cancel: cancel.clone(),
            connection: connection_task,
            tasks: Vec::new(),
        });
        self.set_state(ConnectionState::Connected);
        let address = address.to_string();
        self.inner.status_tx.send_modify(|status| {
            status.connected = true;
            status.node_address = Some(address.clone());
            status.last_sync_time = Some(Utc::now());
        });

        let tasks = vec![
            (
                "dispatch",
                tokio::spawn(self.clone().run_dispatch(id, cancel.clone(), notifications)),
            ),
            (
                "sync",
                tokio::spawn(self.clone().run_sync(cancel.clone(), handle.clone())),
            ),
            (
                "retry",
                tokio::spawn(self.clone().run_retry(cancel.clone(), handle.clone())),
            ),
        ];
        self.inner
            .pruner
            .start(Arc::new(NodePruneNotifier { handle }));

        {
            let mut slot = lock(&self.inner.session);
            if let Some(session) = slot.as_mut().filter(|s| s.id == id) {
                session.tasks = tasks;
            }
        }

        info!(address = %address, session = id, "Session established");
        Ok(())
    }

    /// Stop the current session, if any, and wait for its tasks. Callers
    /// hold the lifecycle lock.
    async fn teardown_session(&self) -> bool {
        let session = lock(&self.inner.session).take();
        let Some(session) = session else {
            return false;
        };

        session.cancel.cancel();
        self.inner.pruner.stop().await;
        session
            .handle
            .close(NORMAL_CLOSURE_CODE, "client disconnect")
            .await;

        for (name, task) in session.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Session task ended abnormally");
            }
        }
        if let Err(e) = session.connection.await {
            warn!(error = %e, "Connection task ended abnormally");
        }

        info!(address = %session.address, session = session.id, "Session closed");
        true
    }

    async fn cancel_reconnect(&self) {
        let task = lock(&self.inner.reconnect).take();
        if let Some(task) = task {
            task.stop("reconnect").await;
        }
    }

    /// Called by the dispatch task when its connection ended unexpectedly.
    pub(crate) fn spawn_reconnect(&self, lost_session: u64) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().reconnect_loop(lost_session, cancel.clone()));
        if let Some(previous) = lock(&self.inner.reconnect).replace(Supervised::new(cancel, task)) {
            previous.cancel.cancel();
        }
    }

    fn reconnect_loop(self, lost_session: u64, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let _guard = tokio::select! {
                    guard = self.inner.lifecycle.lock() => guard,
                    _ = cancel.cancelled() => return,
                };
                let session = {
                    let mut slot = lock(&self.inner.session);
                    if slot.as_ref().is_some_and(|s| s.id == lost_session) {
                        slot.take()
                    } else {
                        None
                    }
                };
                // Already replaced or torn down by the caller
                let Some(session) = session else { return };

                session.cancel.cancel();
                self.inner.pruner.stop().await;
                warn!(address = %session.address, session = session.id, "Connection lost");
                self.set_state(ConnectionState::Reconnecting);
                self.inner.status_tx.send_modify(|status| status.connected = false);
            }

            let Some(address) = self.known_node_address() else {
                self.mark_disconnected();
                return;
            };

            let policy = self.inner.config.reconnect_policy();
            for (attempt, delay) in policy.delays().enumerate() {
                info!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }

                let _guard = tokio::select! {
                    guard = self.inner.lifecycle.lock() => guard,
                    _ = cancel.cancelled() => return,
                };
                let result = tokio::select! {
                    result = self.establish(&address) => result,
                    _ = cancel.cancelled() => return,
                };
                match result {
                    Ok(()) => {
                        info!(address = %address, attempt = attempt + 1, "Reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(address = %address, attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                    }
                }
            }

            let _guard = tokio::select! {
                guard = self.inner.lifecycle.lock() => guard,
                _ = cancel.cancelled() => return,
            };
            warn!(address = %address, "Giving up reconnecting");
            self.mark_disconnected();
        })
    }

    async fn run_sync(self, cancel: CancellationToken, handle: ConnectionHandle) {
        let interval = self.inner.config.sync_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
            if !self.is_connected() {
                return;
            }

            match handle.try_send_frame(&Frame::sync_request()) {
                Ok(()) => {
                    self.inner
                        .status_tx
                        .send_modify(|status| status.last_sync_time = Some(Utc::now()));
                    debug!("Sync request sent");
                }
                Err(NetError::Closed) => return,
                Err(e) => warn!(error = %e, "Sync request failed"),
            }
        }
    }

    async fn run_retry(self, cancel: CancellationToken, handle: ConnectionHandle) {
        let interval = self.inner.config.retry_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
            if !self.is_connected() {
                return;
            }
            self.retry_pending(&handle).await;
        }
    }
}

/// Tells the node about records removed by the pruner sweep.
struct NodePruneNotifier {
    handle: ConnectionHandle,
}

impl PruneNotifier for NodePruneNotifier {
    fn notify_pruned(&self, record: &DeliveredMessage) -> Result<(), ChainError> {
        let frame = Frame::prune_messages(record.prune_at.timestamp_millis());
        self.handle.try_send_frame(&frame).map_err(|e| match e {
            NetError::Closed => ChainError::NotConnected,
            other => ChainError::Connection(other.to_string()),
        })
    }
}
