use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::runtime::types::{NameKind, ServeError, ServiceConfig, StageValue, WorkerId};

/// Completion handle returned by [`Router::enqueue_request`].
///
/// Resolved with the stage's result (by batch index) or with the failure
/// that took the whole batch down.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Result<StageValue, ServeError>>,
}

impl PendingResult {
    /// Wait for the routed stage to complete.
    pub async fn recv(self) -> Result<StageValue, ServeError> {
        // A dropped sender means the router was torn down under us.
        self.rx.await.unwrap_or(Err(ServeError::RouterShutdown))
    }
}

/// Opaque token identifying one dispatched batch.
///
/// Handed out by [`Router::poll_batch`] and redeemed exactly once in
/// [`Router::complete_batch`].
#[derive(Debug)]
pub struct BatchLease {
    id: u64,
    service: String,
}

impl BatchLease {
    /// Service the batch was popped from.
    pub fn service(&self) -> &str {
        &self.service
    }
}

struct PendingEntry {
    input: StageValue,
    reply: oneshot::Sender<Result<StageValue, ServeError>>,
    /// Approximate in-memory size, counted against the advisory budget.
    cost: usize,
}

struct ServiceQueue {
    config: ServiceConfig,
    backend: Option<String>,
    queue: VecDeque<PendingEntry>,
}

struct BackendPool {
    /// Services linked to this backend, in link order. Batches are taken
    /// round-robin across them so one busy service cannot starve another.
    services: Vec<String>,
    next_service: usize,
    /// Wakes idle workers when work arrives for this backend.
    notify: Arc<Notify>,
}

struct InFlightBatch {
    service: String,
    worker: WorkerId,
    replies: Vec<oneshot::Sender<Result<StageValue, ServeError>>>,
}

#[derive(Default)]
struct RouterState {
    services: HashMap<String, ServiceQueue>,
    backends: HashMap<String, BackendPool>,
    /// worker id → backend tag.
    workers: HashMap<WorkerId, String>,
    in_flight: HashMap<u64, InFlightBatch>,
    queued_bytes: usize,
    over_budget: bool,
    closed: bool,
}

/// The request router and batch dispatcher.
///
/// Owns one FIFO queue per service and matches contiguous queue prefixes
/// (capped at the service's `max_batch_size`) against idle workers of the
/// linked backend. Workers pull via [`poll_batch`]; producers never block.
///
/// Cheap to clone; all clones share the same state.
///
/// [`poll_batch`]: Router::poll_batch
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    state: Mutex<RouterState>,
    next_worker: AtomicU64,
    next_batch: AtomicU64,
    /// Advisory cap on bytes held in the per-service queues.
    memory_budget: usize,
}

impl Router {
    /// Create a router with the given advisory queue-memory budget in bytes.
    pub fn new(memory_budget: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                state: Mutex::new(RouterState::default()),
                next_worker: AtomicU64::new(0),
                next_batch: AtomicU64::new(0),
                memory_budget,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        // Recover from a poisoned lock: state mutations are small and keep
        // the maps consistent at every await-free step.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a backend pool. Workers attach to it via [`register_worker`].
    ///
    /// [`register_worker`]: Router::register_worker
    pub fn register_backend(&self, backend_tag: &str) -> Result<(), ServeError> {
        let mut st = self.state();
        if st.closed {
            return Err(ServeError::RouterShutdown);
        }
        if st.backends.contains_key(backend_tag) {
            return Err(ServeError::DuplicateName {
                kind: NameKind::Backend,
                name: backend_tag.to_owned(),
            });
        }
        st.backends.insert(
            backend_tag.to_owned(),
            BackendPool {
                services: Vec::new(),
                next_service: 0,
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    /// Attach a new worker to `backend_tag` and return its id.
    pub fn register_worker(&self, backend_tag: &str) -> Result<WorkerId, ServeError> {
        let mut st = self.state();
        if st.closed {
            return Err(ServeError::RouterShutdown);
        }
        if !st.backends.contains_key(backend_tag) {
            return Err(ServeError::UnknownName {
                kind: NameKind::Backend,
                name: backend_tag.to_owned(),
            });
        }
        let id = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        st.workers.insert(id, backend_tag.to_owned());
        Ok(id)
    }

    /// Register a service queue with its dispatch configuration.
    pub fn register_service(&self, service: &str, config: ServiceConfig) -> Result<(), ServeError> {
        if config.max_batch_size == 0 {
            return Err(ServeError::InvalidBatchSize {
                service: service.to_owned(),
            });
        }
        let mut st = self.state();
        if st.closed {
            return Err(ServeError::RouterShutdown);
        }
        if st.services.contains_key(service) {
            return Err(ServeError::DuplicateName {
                kind: NameKind::Service,
                name: service.to_owned(),
            });
        }
        st.services.insert(
            service.to_owned(),
            ServiceQueue {
                config,
                backend: None,
                queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Set the batch cap for an existing service. Must be ≥ 1.
    pub fn set_max_batch(&self, service: &str, max_batch_size: usize) -> Result<(), ServeError> {
        if max_batch_size == 0 {
            return Err(ServeError::InvalidBatchSize {
                service: service.to_owned(),
            });
        }
        let mut st = self.state();
        let sq = st.services.get_mut(service).ok_or_else(|| ServeError::UnknownName {
            kind: NameKind::Service,
            name: service.to_owned(),
        })?;
        sq.config.max_batch_size = max_batch_size;
        Ok(())
    }

    /// Set (or clear) the per-service stage timeout.
    pub fn set_stage_timeout(
        &self,
        service: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ServeError> {
        let mut st = self.state();
        let sq = st.services.get_mut(service).ok_or_else(|| ServeError::UnknownName {
            kind: NameKind::Service,
            name: service.to_owned(),
        })?;
        sq.config.stage_timeout = timeout;
        Ok(())
    }

    /// Bind subsequent dispatches for `service` to workers of `backend_tag`.
    pub fn link(&self, service: &str, backend_tag: &str) -> Result<(), ServeError> {
        let notify = {
            let mut st = self.state();
            if !st.backends.contains_key(backend_tag) {
                return Err(ServeError::UnknownName {
                    kind: NameKind::Backend,
                    name: backend_tag.to_owned(),
                });
            }
            let sq = st.services.get_mut(service).ok_or_else(|| ServeError::UnknownName {
                kind: NameKind::Service,
                name: service.to_owned(),
            })?;
            let previous = sq.backend.replace(backend_tag.to_owned());

            // Re-link: detach from the old pool's rotation first.
            if let Some(prev_tag) = previous {
                if prev_tag != backend_tag {
                    if let Some(prev_pool) = st.backends.get_mut(&prev_tag) {
                        prev_pool.services.retain(|s| s != service);
                        prev_pool.next_service = 0;
                    }
                }
            }

            // Invariant: checked above that the backend exists.
            match st.backends.get_mut(backend_tag) {
                Some(pool) => {
                    if !pool.services.iter().any(|s| s == service) {
                        pool.services.push(service.to_owned());
                    }
                    Arc::clone(&pool.notify)
                }
                None => {
                    return Err(ServeError::UnknownName {
                        kind: NameKind::Backend,
                        name: backend_tag.to_owned(),
                    })
                }
            }
        };
        // The queue may already hold entries from a previous link.
        notify.notify_one();
        info!(service, backend = backend_tag, "service linked");
        Ok(())
    }

    // ── Data plane ───────────────────────────────────────────────────────────

    /// Append a pending entry to `service`'s queue.
    ///
    /// Never blocks. Returns a [`PendingResult`] that resolves once a worker
    /// reports the batch containing this entry (or the batch fails).
    pub fn enqueue_request(
        &self,
        service: &str,
        input: StageValue,
    ) -> Result<PendingResult, ServeError> {
        let (tx, rx) = oneshot::channel();
        let notify = {
            let mut st = self.state();
            if st.closed {
                return Err(ServeError::RouterShutdown);
            }
            let backend = match st.services.get(service) {
                None => {
                    return Err(ServeError::UnknownName {
                        kind: NameKind::Service,
                        name: service.to_owned(),
                    })
                }
                Some(sq) => sq.backend.clone().ok_or_else(|| ServeError::ServiceNotLinked {
                    service: service.to_owned(),
                })?,
            };
            let notify = match st.backends.get(&backend) {
                Some(pool) => Arc::clone(&pool.notify),
                None => {
                    return Err(ServeError::UnknownName {
                        kind: NameKind::Backend,
                        name: backend,
                    })
                }
            };

            let cost = estimate_size(&input);
            if let Some(sq) = st.services.get_mut(service) {
                sq.queue.push_back(PendingEntry {
                    input,
                    reply: tx,
                    cost,
                });
            }
            st.queued_bytes += cost;
            if st.queued_bytes > self.inner.memory_budget && !st.over_budget {
                st.over_budget = true;
                warn!(
                    queued_bytes = st.queued_bytes,
                    budget = self.inner.memory_budget,
                    "queued payloads exceed the object store budget"
                );
            }
            notify
        };
        notify.notify_one();
        Ok(PendingResult { rx })
    }

    /// Called by an idle worker. Suspends until a service linked to the
    /// worker's backend has queued entries, then pops a contiguous FIFO
    /// prefix of up to `max_batch_size` and returns it with a lease.
    pub async fn poll_batch(
        &self,
        worker: WorkerId,
    ) -> Result<(Vec<StageValue>, BatchLease), ServeError> {
        loop {
            let notify = {
                let mut st = self.state();
                if st.closed {
                    return Err(ServeError::RouterShutdown);
                }
                let backend =
                    st.workers
                        .get(&worker)
                        .cloned()
                        .ok_or_else(|| ServeError::UnknownName {
                            kind: NameKind::Worker,
                            name: worker.to_string(),
                        })?;
                debug_assert!(
                    st.in_flight.values().all(|b| b.worker != worker),
                    "worker polled with a batch still in flight"
                );
                if let Some(ready) = self.try_take_batch(&mut st, &backend, worker) {
                    return Ok(ready);
                }
                match st.backends.get(&backend) {
                    Some(pool) => Arc::clone(&pool.notify),
                    None => {
                        return Err(ServeError::UnknownName {
                            kind: NameKind::Backend,
                            name: backend,
                        })
                    }
                }
            };
            notify.notified().await;
        }
    }

    /// Resolve every entry of a dispatched batch.
    ///
    /// On success, results map to entries by index (submission order). On
    /// failure (a callable error, a panic, or a length mismatch) every
    /// entry fails with the same [`ServeError::UserCodeFailure`]. A lease
    /// whose batch already timed out is discarded silently.
    pub fn complete_batch(&self, lease: BatchLease, outcome: Result<Vec<StageValue>, String>) {
        let removed = self.state().in_flight.remove(&lease.id);
        let Some(batch) = removed else {
            debug!(
                service = %lease.service,
                batch = lease.id,
                "late batch result discarded"
            );
            return;
        };

        match outcome {
            Ok(results) if results.len() == batch.replies.len() => {
                for (reply, result) in batch.replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
            }
            Ok(results) => {
                let message = format!(
                    "callable returned {} results for a batch of {}",
                    results.len(),
                    batch.replies.len()
                );
                self.fail_batch(&batch.service, lease.id, batch.replies, message);
            }
            Err(message) => {
                self.fail_batch(&batch.service, lease.id, batch.replies, message);
            }
        }
    }

    fn fail_batch(
        &self,
        service: &str,
        batch: u64,
        replies: Vec<oneshot::Sender<Result<StageValue, ServeError>>>,
        message: String,
    ) {
        warn!(service, batch, %message, "batch failed");
        for reply in replies {
            let _ = reply.send(Err(ServeError::UserCodeFailure {
                service: service.to_owned(),
                message: message.clone(),
            }));
        }
    }

    /// Greedy batcher: pop min(queue length, max_batch_size) from the first
    /// non-empty service in the backend's rotation. Never waits for a queue
    /// to fill.
    fn try_take_batch(
        &self,
        st: &mut RouterState,
        backend: &str,
        worker: WorkerId,
    ) -> Option<(Vec<StageValue>, BatchLease)> {
        let pool = st.backends.get(backend)?;
        if pool.services.is_empty() {
            return None;
        }
        let services = pool.services.clone();
        let start = pool.next_service;
        let n = services.len();

        for step in 0..n {
            let idx = (start + step) % n;
            let service = &services[idx];
            let Some(sq) = st.services.get_mut(service) else {
                continue;
            };
            if sq.queue.is_empty() {
                continue;
            }

            let take = sq.queue.len().min(sq.config.max_batch_size);
            let timeout = sq.config.stage_timeout;
            let mut inputs = Vec::with_capacity(take);
            let mut replies = Vec::with_capacity(take);
            let mut freed = 0usize;
            for _ in 0..take {
                if let Some(entry) = sq.queue.pop_front() {
                    freed += entry.cost;
                    inputs.push(entry.input);
                    replies.push(entry.reply);
                }
            }
            let more = !sq.queue.is_empty();

            st.queued_bytes = st.queued_bytes.saturating_sub(freed);
            if st.over_budget && st.queued_bytes <= self.inner.memory_budget {
                st.over_budget = false;
            }

            let id = self.inner.next_batch.fetch_add(1, Ordering::Relaxed);
            st.in_flight.insert(
                id,
                InFlightBatch {
                    service: service.clone(),
                    worker,
                    replies,
                },
            );

            if let Some(pool) = st.backends.get_mut(backend) {
                pool.next_service = (idx + 1) % n;
                if more {
                    // Leftover entries; wake the next idle worker.
                    pool.notify.notify_one();
                }
            }

            if let Some(timeout) = timeout {
                self.spawn_batch_timer(id, service.clone(), timeout);
            }

            debug!(service = %service, batch = id, size = inputs.len(), "batch dispatched");
            return Some((
                inputs,
                BatchLease {
                    id,
                    service: service.clone(),
                },
            ));
        }
        None
    }

    fn spawn_batch_timer(&self, batch: u64, service: String, timeout: Duration) {
        let router = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = router.state().in_flight.remove(&batch);
            if let Some(b) = expired {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(service = %service, batch, timeout_ms, "stage timeout; failing batch");
                for reply in b.replies {
                    let _ = reply.send(Err(ServeError::StageTimeout {
                        service: service.clone(),
                        timeout_ms,
                    }));
                }
            }
        });
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Close the router: fail all queued entries, wake every idle worker so
    /// it observes the closure and exits. Batches already dispatched may
    /// still be completed; see [`drain`].
    ///
    /// [`drain`]: Router::drain
    pub fn shutdown(&self) {
        let (drained, notifies) = {
            let mut st = self.state();
            if st.closed {
                return;
            }
            st.closed = true;
            let mut drained = Vec::new();
            for sq in st.services.values_mut() {
                drained.extend(sq.queue.drain(..));
            }
            st.queued_bytes = 0;
            st.over_budget = false;
            let notifies: Vec<_> = st
                .backends
                .values()
                .map(|p| Arc::clone(&p.notify))
                .collect();
            (drained, notifies)
        };
        info!(dropped = drained.len(), "router shut down");
        for entry in drained {
            let _ = entry.reply.send(Err(ServeError::RouterShutdown));
        }
        for notify in notifies {
            notify.notify_waiters();
        }
    }

    /// Wait for in-flight batches to report, up to `grace`.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.state().in_flight.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.state().in_flight.len();
                warn!(remaining, "shutdown grace expired with batches still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of batches currently dispatched and not yet reported.
    pub fn in_flight_batches(&self) -> usize {
        self.state().in_flight.len()
    }
}

/// Cheap structural size estimate for the advisory memory budget.
fn estimate_size(value: &StageValue) -> usize {
    match value {
        StageValue::Null => 4,
        StageValue::Bool(_) => 5,
        StageValue::Number(_) => 8,
        StageValue::String(s) => s.len() + 2,
        StageValue::Array(items) => items.iter().map(estimate_size).sum::<usize>() + 2,
        StageValue::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + 1 + estimate_size(v))
                .sum::<usize>()
                + 2
        }
    }
}
