//! Per-cluster manager: work queues and the controller task set.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::error::{ControlError, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting in `queue` or re-added while processing.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    delayed: BTreeMap<(Instant, u64), String>,
    delayed_index: HashMap<String, (Instant, u64)>,
    next_seq: u64,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Key queue with single-writer semantics per key.
///
/// A key is handed to at most one worker at a time. Adding a key that is
/// being processed marks it dirty; it is queued again when the worker calls
/// [`WorkQueue::done`].
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    delayed_changed: Notify,
    stopped: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        Self::add_locked(&mut state, key);
        drop(state);
        self.ready.notify_one();
    }

    fn add_locked(state: &mut QueueState, key: &str) {
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
    }

    /// Queue `key` once `delay` has passed. An earlier pending deadline wins.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let at = Instant::now() + delay;
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if let Some(existing) = state.delayed_index.get(key).copied() {
            if existing.0 <= at {
                return;
            }
            state.delayed.remove(&existing);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.insert((at, seq), key.to_string());
        state.delayed_index.insert(key.to_string(), (at, seq));
        drop(state);
        self.delayed_changed.notify_one();
    }

    /// Queue `key` after its per-key exponential backoff.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. `None` once the queue is shut down, even if keys
    /// are still queued.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed; requeue it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.ready.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.ready.notify_waiters();
        self.delayed_changed.notify_one();
        self.stopped.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Resolves once [`WorkQueue::shutdown`] was called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Moves delayed keys into the queue as their deadlines pass. Returns on shutdown.
    pub async fn pump_delayed(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.shutting_down {
                    return;
                }
                let now = Instant::now();
                let mut due = Vec::new();
                while let Some((&(at, seq), _)) = state.delayed.first_key_value() {
                    if at > now {
                        break;
                    }
                    if let Some(key) = state.delayed.remove(&(at, seq)) {
                        state.delayed_index.remove(&key);
                        due.push(key);
                    }
                }
                let woke = !due.is_empty();
                for key in &due {
                    Self::add_locked(&mut state, key);
                }
                if woke {
                    self.ready.notify_one();
                }
                state.delayed.first_key_value().map(|(&(at, _), _)| at)
            };

            match next {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.delayed_changed.notified() => {}
                    }
                }
                None => self.delayed_changed.notified().await,
            }
        }
    }
}

fn backoff(failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures.min(31)).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Runs the controllers of one remote cluster.
pub struct Manager {
    cluster_id: String,
    controllers: Vec<Controller>,
}

impl Manager {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            controllers: Vec::new(),
        }
    }

    pub fn add(&mut self, controller: Controller) {
        self.controllers.push(controller);
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Run every controller until `timeout` passes or all controller tasks exit.
    ///
    /// On timeout the queues are shut down and in-flight passes get `grace` to
    /// finish. Tasks still running after that are aborted.
    pub async fn run(self, timeout: Duration, grace: Duration) -> Result<()> {
        if self.controllers.is_empty() {
            return Err(ControlError::Internal(format!(
                "no controllers registered for cluster {}",
                self.cluster_id
            )));
        }

        info!(
            "Starting manager for cluster {} with {} controllers",
            self.cluster_id,
            self.controllers.len()
        );

        let mut tasks = JoinSet::new();
        let mut queues = Vec::with_capacity(self.controllers.len());
        for controller in self.controllers {
            queues.push(controller.queue());
            controller.start(&mut tasks);
        }

        let cluster_id = self.cluster_id;
        if tokio::time::timeout(timeout, join_all(&mut tasks, &cluster_id))
            .await
            .is_err()
        {
            debug!("Manager for cluster {} reached its run timeout", cluster_id);
        }

        for queue in &queues {
            queue.shutdown();
        }
        if tokio::time::timeout(grace, join_all(&mut tasks, &cluster_id))
            .await
            .is_err()
        {
            warn!(
                "Manager for cluster {} did not drain within {:?}, aborting {} tasks",
                cluster_id,
                grace,
                tasks.len()
            );
        }
        tasks.shutdown().await;
        info!("Manager for cluster {} stopped", cluster_id);
        Ok(())
    }
}

async fn join_all(tasks: &mut JoinSet<()>, cluster_id: &str) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result
            && e.is_panic()
        {
            error!("Controller task panicked in cluster {}: {}", cluster_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use stratus_api::{IpRange, IpRangeSpec, MemoryStore, RecordStore};

    use super::*;
    use crate::composed::Flow;
    use crate::controller::{Reconciler, RecordWatch};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(5));
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(3), Duration::from_millis(40));
        assert_eq!(backoff(20), BACKOFF_MAX);
        assert_eq!(backoff(u32::MAX), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_is_not_handed_out_twice_while_processing() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("late");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let queue = Arc::new(WorkQueue::new());
        let pump = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pump_delayed().await })
        };

        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(20));
        assert_eq!(queue.delayed_len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delayed_len(), 0);

        queue.shutdown();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_counts_and_forget_resets() {
        let queue = WorkQueue::new();
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.failures("a"), 2);
        queue.forget("a");
        assert_eq!(queue.failures("a"), 0);
    }

    #[tokio::test]
    async fn test_empty_manager_fails_to_start() {
        let manager = Manager::new("c1");
        let err = manager
            .run(Duration::from_millis(10), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
    }

    struct SlowReconciler {
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for SlowReconciler {
        async fn reconcile(&self, _key: &str) -> Result<Flow> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::RequeueAfter(Duration::from_millis(1)))
        }
    }

    async fn make_manager(delay: Duration) -> (Manager, Arc<SlowReconciler>) {
        let store = Arc::new(MemoryStore::<IpRange>::new());
        store.create(IpRange::new("a", IpRangeSpec::new("10.0.0.0/24"))).await.unwrap();

        let reconciler = Arc::new(SlowReconciler {
            delay,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let mut controller = Controller::new("IpRange", reconciler.clone(), 1);
        let source: Arc<dyn RecordStore<IpRange>> = store;
        controller.watch(Box::new(RecordWatch::new(source))).unwrap();

        let mut manager = Manager::new("c1");
        manager.add(controller);
        (manager, reconciler)
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_shutdown() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.stopped().await })
        };
        tokio::task::yield_now().await;
        assert!(!queue.is_shutting_down());

        queue.shutdown();
        waiter.await.unwrap();
        queue.stopped().await;
    }

    #[tokio::test]
    async fn test_get_stops_handing_out_keys_after_shutdown() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.shutdown();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_lets_in_flight_pass_finish() {
        let (manager, reconciler) = make_manager(Duration::from_millis(200)).await;

        let started = Instant::now();
        manager
            .run(Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reconciler.started.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.finished.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_exceeding_grace_is_aborted() {
        let (manager, reconciler) = make_manager(Duration::from_secs(60)).await;

        let started = Instant::now();
        manager
            .run(Duration::from_millis(50), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(reconciler.started.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.finished.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
