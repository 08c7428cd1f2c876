//! Per-resource work queue driving the reconciler.
//!
//! Each key is either idle (optionally with a requeue timer armed) or busy
//! with exactly one pass. Triggers for a busy key collapse into a single
//! follow-up pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::cluster::WatchEvent;
use super::reconciler::{HelmRepositoryReconciler, ReconcileOutcome};
use super::resource::NamespacedName;

/// Default number of passes allowed to run at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    /// Re-enqueue every resource at this period.
    pub resync_interval: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            resync_interval: None,
        }
    }
}

#[derive(Default)]
struct KeyState {
    busy: bool,
    pending: bool,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    reconciler: Arc<HelmRepositoryReconciler>,
    keys: Mutex<HashMap<NamespacedName, KeyState>>,
    permits: Arc<Semaphore>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    settings: SchedulerSettings,
}

/// Schedules reconciliation passes from watch events, timers and resyncs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<HelmRepositoryReconciler>, settings: SchedulerSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                reconciler,
                keys: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
                stopped: AtomicBool::new(false),
                shutdown_tx,
                settings,
            }),
        }
    }

    /// Requests a pass for `key`. Cancels any armed requeue timer.
    pub fn enqueue(&self, key: NamespacedName) {
        self.inner.enqueue(key, false);
    }

    /// Number of keys with a pass in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_keys().values().filter(|s| s.busy).count()
    }

    /// Starts the event loop: enqueues every existing resource, then follows
    /// watch events until [`Scheduler::shutdown`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        // Subscribe before listing so nothing falls between the two.
        let events = inner.reconciler.resources().subscribe();
        let shutdown_rx = inner.shutdown_tx.subscribe();

        tokio::spawn(
            async move { inner.run_events(events, shutdown_rx).await }
                .instrument(info_span!("scheduler")),
        )
    }

    /// Stops event intake and cancels timers. Passes in flight run to completion
    /// but schedule nothing further.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Scheduler shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        let mut keys = self.inner.lock_keys();
        for state in keys.values_mut() {
            state.pending = false;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }

    /// Waits until no pass is in flight, polling at `poll`.
    pub async fn wait_idle(&self, poll: Duration) {
        while self.in_flight() > 0 {
            tokio::time::sleep(poll).await;
        }
    }
}

impl Inner {
    fn lock_keys(&self) -> MutexGuard<'_, HashMap<NamespacedName, KeyState>> {
        // The map stays consistent across a panicking holder.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn enqueue(self: &Arc<Self>, key: NamespacedName, from_timer: bool) {
        if self.is_stopped() {
            return;
        }

        {
            let mut keys = self.lock_keys();
            let state = keys.entry(key.clone()).or_default();
            match state.timer.take() {
                // The timer task is the caller; it ends on its own.
                Some(_) if from_timer => {}
                Some(timer) => timer.abort(),
                None => {}
            }
            if state.busy {
                state.pending = true;
                return;
            }
            state.busy = true;
        }

        let inner = Arc::clone(self);
        let span = info_span!("worker", resource = %key);
        tokio::spawn(async move { inner.run_worker(key).await }.instrument(span));
    }

    fn arm_timer(self: &Arc<Self>, key: NamespacedName, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.enqueue(key, true);
        })
    }

    async fn run_worker(self: Arc<Self>, key: NamespacedName) {
        loop {
            let outcome = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(_permit) => self.reconciler.reconcile(&key).await,
                Err(_) => return,
            };

            let requeue = match outcome {
                Ok(ReconcileOutcome::Requeue(delay)) => Some(delay),
                Ok(ReconcileOutcome::Done) => None,
                Err(e) => {
                    error!("Failed to record reconcile result: {}", e);
                    Some(self.reconciler.retry_interval())
                }
            };

            let mut keys = self.lock_keys();
            let stopped = self.is_stopped();
            let Some(state) = keys.get_mut(&key) else {
                return;
            };

            if state.pending && !stopped {
                state.pending = false;
                debug!("Triggered while busy, running again");
                continue;
            }

            state.busy = false;
            state.pending = false;
            match requeue {
                Some(delay) if !stopped => {
                    debug!(after = ?delay, "Requeued");
                    state.timer = Some(self.arm_timer(key.clone(), delay));
                }
                _ => {
                    keys.remove(&key);
                }
            }
            return;
        }
    }

    async fn run_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WatchEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.enqueue_all().await;

        let resync = self.settings.resync_interval.filter(|d| !d.is_zero());
        let mut resync_timer = resync.map(tokio::time::interval);
        if let Some(timer) = resync_timer.as_mut() {
            timer.tick().await; // skip immediate first tick
        }

        loop {
            if self.is_stopped() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = async {
                    match resync_timer.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    debug!("Periodic resync");
                    self.enqueue_all().await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch events dropped, resyncing");
                        self.enqueue_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Watch channel closed");
                        break;
                    }
                },
            }
        }

        debug!("Event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        match event {
            WatchEvent::Applied(key) | WatchEvent::Deleted(key) => self.enqueue(key, false),
            WatchEvent::SecretChanged { namespace, name } => {
                let repositories = match self.reconciler.resources().list().await {
                    Ok(repositories) => repositories,
                    Err(e) => {
                        warn!("Failed to list resources for secret change: {}", e);
                        return;
                    }
                };
                for repository in repositories {
                    let references = repository.metadata.namespace == namespace
                        && repository
                            .spec
                            .secret_ref
                            .as_ref()
                            .is_some_and(|r| r.name == name);
                    if references {
                        debug!(secret = %name, resource = %repository.key(), "Secret changed");
                        self.enqueue(repository.key(), false);
                    }
                }
            }
        }
    }

    async fn enqueue_all(self: &Arc<Self>) {
        match self.reconciler.resources().list().await {
            Ok(repositories) => {
                for repository in repositories {
                    self.enqueue(repository.key(), false);
                }
            }
            Err(e) => warn!("Failed to list resources: {}", e),
        }
    }
}
