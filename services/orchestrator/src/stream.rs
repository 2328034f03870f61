//! Event stream subscriptions and the registry that owns them.
//!
//! Every server-pushed stream is consumed by exactly one spawned task that
//! handles events strictly in arrival order. The [`StreamRegistry`] keeps the
//! handle of each consumer:
//!
//! - at most one install stream (the single-flight job)
//! - at most one activation stream per node
//! - at most one download-progress stream
//!
//! Closing a subscription flips its `watch` flag; the consumer checks that
//! flag with priority before taking the next event and exits without applying
//! anything further. Closing is idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

// =============================================================================
// Event Stream
// =============================================================================

/// Receiving end of one backend event stream.
///
/// When the stream is fed by a transport task (an SSE reader), dropping the
/// stream aborts that task so no connection outlives its consumer.
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    pump: Option<JoinHandle<()>>,
}

impl<T> EventStream<T> {
    /// Wrap a receiver that is fed directly (mocks, platform callbacks).
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx, pump: None }
    }

    /// Wrap a receiver fed by a transport task owned by this stream.
    pub fn with_pump(rx: mpsc::Receiver<T>, pump: JoinHandle<()>) -> Self {
        Self {
            rx,
            pump: Some(pump),
        }
    }

    /// Create a channel-backed stream and the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    /// Next event, or `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle to a running stream consumer.
pub struct Subscription {
    id: u64,
    label: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    fn spawn<F, Fut>(label: String, consumer: F) -> Self
    where
        F: FnOnce(SubscriptionToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let token = SubscriptionToken {
            id,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(consumer(token));

        debug!(subscription_id = id, label = %label, "Opened subscription");

        Self {
            id,
            label,
            shutdown_tx,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signal the consumer to stop. Safe to call any number of times.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// True while the consumer task runs and no close was requested.
    pub fn is_live(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.task.is_finished()
    }
}

/// Consumer-side view of a subscription.
pub struct SubscriptionToken {
    id: u64,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the subscription is closed or its handle is dropped.
    pub async fn closed(&mut self) {
        loop {
            if *self.shutdown.borrow_and_update() {
                return;
            }
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

// =============================================================================
// Stream Registry
// =============================================================================

/// Owner of every live subscription.
#[derive(Default)]
pub struct StreamRegistry {
    install: Mutex<Option<Subscription>>,
    nodes: Mutex<HashMap<String, Subscription>>,
    download: Mutex<Option<Subscription>>,
    shut_down: AtomicBool,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once set, no new subscription is accepted and late responses are discarded.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Open the install-job subscription, closing any previous one.
    ///
    /// Returns the subscription ID, or `None` after shutdown.
    pub async fn open_install<F, Fut>(&self, label: String, consumer: F) -> Option<u64>
    where
        F: FnOnce(SubscriptionToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.install.lock().await;
        if self.is_shut_down() {
            return None;
        }
        if let Some(previous) = slot.take() {
            previous.close();
        }
        let subscription = Subscription::spawn(label, consumer);
        let id = subscription.id();
        *slot = Some(subscription);
        Some(id)
    }

    /// Drop the install subscription if it is still the one with `id`.
    pub async fn release_install(&self, id: u64) -> bool {
        let mut slot = self.install.lock().await;
        if slot.as_ref().is_some_and(|s| s.id() == id) {
            slot.take();
            return true;
        }
        false
    }

    pub async fn close_install(&self) -> bool {
        match self.install.lock().await.take() {
            Some(subscription) => {
                subscription.close();
                true
            }
            None => false,
        }
    }

    pub async fn has_install(&self) -> bool {
        self.install.lock().await.is_some()
    }

    /// Open a node's activation subscription, closing the prior one first.
    ///
    /// Returns the subscription ID, or `None` after shutdown.
    pub async fn open_node<F, Fut>(&self, node: &str, consumer: F) -> Option<u64>
    where
        F: FnOnce(SubscriptionToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut nodes = self.nodes.lock().await;
        if self.is_shut_down() {
            return None;
        }
        if let Some(previous) = nodes.remove(node) {
            debug!(node = %node, subscription_id = previous.id(), "Replacing activation subscription");
            previous.close();
        }
        let subscription = Subscription::spawn(format!("activation:{node}"), consumer);
        let id = subscription.id();
        nodes.insert(node.to_string(), subscription);
        Some(id)
    }

    /// Drop a node's subscription if it is still the one with `id`.
    pub async fn release_node(&self, node: &str, id: u64) -> bool {
        let mut nodes = self.nodes.lock().await;
        if nodes.get(node).is_some_and(|s| s.id() == id) {
            nodes.remove(node);
            return true;
        }
        false
    }

    pub async fn close_node(&self, node: &str) -> bool {
        match self.nodes.lock().await.remove(node) {
            Some(subscription) => {
                subscription.close();
                true
            }
            None => false,
        }
    }

    pub async fn has_node(&self, node: &str) -> bool {
        self.nodes.lock().await.contains_key(node)
    }

    /// Number of node subscriptions whose consumer is still running.
    pub async fn live_node_count(&self, node: &str) -> usize {
        self.nodes
            .lock()
            .await
            .get(node)
            .map_or(0, |s| usize::from(s.is_live()))
    }

    /// Open the download-progress subscription. Only the first call wins.
    pub async fn open_download<F, Fut>(&self, consumer: F) -> Option<u64>
    where
        F: FnOnce(SubscriptionToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.download.lock().await;
        if self.is_shut_down() || slot.is_some() {
            return None;
        }
        let subscription = Subscription::spawn("download".to_string(), consumer);
        let id = subscription.id();
        *slot = Some(subscription);
        Some(id)
    }

    pub async fn has_download(&self) -> bool {
        self.download.lock().await.is_some()
    }

    /// Close every subscription exactly once and refuse new ones.
    ///
    /// Returns how many subscriptions were closed.
    pub async fn close_all(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);

        let mut closing: Vec<Subscription> = Vec::new();
        closing.extend(self.install.lock().await.take());
        closing.extend(self.nodes.lock().await.drain().map(|(_, s)| s));
        closing.extend(self.download.lock().await.take());

        for subscription in &closing {
            debug!(
                subscription_id = subscription.id(),
                label = %subscription.label(),
                "Closing subscription"
            );
            subscription.close();
        }

        info!(count = closing.len(), "Closed all subscriptions");
        closing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_closed(mut token: SubscriptionToken, flag: Arc<AtomicBool>) {
        token.closed().await;
        flag.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_open_node_replaces_previous() {
        let registry = StreamRegistry::new();
        let first_closed = Arc::new(AtomicBool::new(false));

        let flag = first_closed.clone();
        let first = registry
            .open_node("yolo", move |token| wait_closed(token, flag))
            .await
            .unwrap();
        let second = registry
            .open_node("yolo", |mut token| async move { token.closed().await })
            .await
            .unwrap();

        assert_ne!(first, second);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(registry.live_node_count("yolo").await, 1);
    }

    #[tokio::test]
    async fn test_release_ignores_stale_id() {
        let registry = StreamRegistry::new();
        let first = registry
            .open_node("sam", |mut token| async move { token.closed().await })
            .await
            .unwrap();
        registry
            .open_node("sam", |mut token| async move { token.closed().await })
            .await
            .unwrap();

        assert!(!registry.release_node("sam", first).await);
        assert!(registry.has_node("sam").await);
    }

    #[tokio::test]
    async fn test_close_all_counts_each_subscription_once() {
        let registry = StreamRegistry::new();
        registry
            .open_install("install".to_string(), |mut t| async move { t.closed().await })
            .await
            .unwrap();
        registry
            .open_node("a", |mut t| async move { t.closed().await })
            .await
            .unwrap();
        registry
            .open_node("b", |mut t| async move { t.closed().await })
            .await
            .unwrap();
        registry
            .open_download(|mut t| async move { t.closed().await })
            .await
            .unwrap();

        assert_eq!(registry.close_all().await, 4);
        assert_eq!(registry.close_all().await, 0);
        assert!(registry.is_shut_down());
        assert!(registry
            .open_node("c", |mut t| async move { t.closed().await })
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_download_subscribes_once() {
        let registry = StreamRegistry::new();
        assert!(registry
            .open_download(|mut t| async move { t.closed().await })
            .await
            .is_some());
        assert!(registry
            .open_download(|mut t| async move { t.closed().await })
            .await
            .is_none());
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_aborts_pump() {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(aborted.clone());
        let (tx, rx) = mpsc::channel::<u32>(1);
        let pump = tokio::spawn(async move {
            let _tx = tx;
            let _flag = flag;
            std::future::pending::<()>().await;
        });
        let stream = EventStream::with_pump(rx, pump);
        drop(stream);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(aborted.load(Ordering::SeqCst));
    }
}
