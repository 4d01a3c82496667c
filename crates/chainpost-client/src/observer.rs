/// Hook for the durable local store that sits behind the client.
///
/// Called from the dispatch and retry tasks, so implementations must not
/// block. Every method defaults to doing nothing.
pub trait DeliveryObserver: Send + Sync {
    /// A pending transaction was included in a block.
    fn on_confirmed(&self, _transaction_id: &str, _block_height: u64) {}

    /// A transaction hash is now tracked for pruning.
    fn on_delivered(&self, _transaction_hash: &str) {}

    /// A pending transaction reached FAILED.
    fn on_failed(&self, _transaction_id: &str, _reason: &str) {}
}

pub(crate) struct NoopObserver;

impl DeliveryObserver for NoopObserver {}
