//! Adaptive worker pool (§4.6): idle/active/exited thread lists, a priority
//! heap of pending requests, and per-worker binary semaphores.
//!
//! Grounded directly on the teacher's `pool.rs` dedicated-thread-per-slot
//! design, generalized from a fixed-size pool of identical slots to this
//! spec's adaptive idle/active/exited three-list model. The teacher's
//! `mpsc::sync_channel(1)` per-slot handoff is itself semaphore-shaped, but
//! this pool needs an explicit wake primitive instead: a worker may be
//! re-bound to a new request without ever returning to its wait point
//! (§4.6.2 step 4b, "jump back to step 3 without re-waiting"), which a
//! channel receiver cannot express as cleanly as a counting semaphore can.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::queue::{InsertOutcome, RequestQueue};
use crate::types::{ChildState, Request, Rcode};

/// The listener-supplied per-request continuation (§4.6.2 step 3,
/// `process(request, ACTION_RUN)`). Kept generic over what "process" means so
/// this module never has to know about virtual servers or the dispatcher —
/// callers close over whatever they need (typically
/// [`crate::vserver::dispatch`] plus a fixed [`crate::types::Component`]).
pub type ProcessFn = Arc<dyn Fn(&mut Request) -> Rcode + Send + Sync>;

// ── Semaphore ────────────────────────────────────────────────────────────

/// A binary-ish counting semaphore. `std` has no semaphore primitive; this
/// is the one primitive the teacher's channel-based handoff doesn't need.
struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore { count: Mutex::new(0), cv: Condvar::new() }
    }

    fn post(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        *count += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.cv.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }
}

// ── Worker ───────────────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle = 0,
    Active = 1,
    Cancelled = 2,
    Exited = 3,
}

impl From<u8> for WorkerStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Active,
            2 => WorkerStatus::Cancelled,
            _ => WorkerStatus::Exited,
        }
    }
}

struct Worker {
    id: u64,
    status: AtomicU8,
    sem: Semaphore,
    current: Mutex<Option<Request>>,
    start: Instant,
    request_count: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Worker {
            id,
            status: AtomicU8::new(WorkerStatus::Idle as u8),
            sem: Semaphore::new(),
            current: Mutex::new(None),
            start: Instant::now(),
            request_count: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::from(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

// ── Pool state ───────────────────────────────────────────────────────────

struct PoolState {
    idle: VecDeque<Arc<Worker>>,
    active: VecDeque<Arc<Worker>>,
    exited: VecDeque<Arc<Worker>>,
    next_worker_id: u64,
    spawning: bool,
    time_last_spawned: Instant,
    last_manage_time: Instant,
    stop_flag: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.exited.len()
    }
}

struct Shared {
    state: Mutex<PoolState>,
    queue: RequestQueue,
    config: PoolConfig,
    process: ProcessFn,
}

/// Telemetry snapshot (§6 `queue_stats()`).
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub exited: usize,
    pub num_queued: usize,
    pub total_blocked: u64,
}

/// The adaptive worker pool. Cloning shares the same underlying state — only
/// the `Arc<Shared>` is duplicated.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Spawns `config.start_servers` workers and blocks until all have
    /// reported themselves idle, matching the teacher's `InterpreterPool::new`
    /// pre-warming discipline.
    pub fn new(config: PoolConfig, process: ProcessFn) -> Self {
        let queue = RequestQueue::new(config.queue_priority, config.max_queue_size, config.auto_limit_acct);
        let now = Instant::now();
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: VecDeque::new(),
                exited: VecDeque::new(),
                next_worker_id: 0,
                spawning: false,
                time_last_spawned: now,
                last_manage_time: now,
                stop_flag: false,
            }),
            queue,
            config,
            process,
        });

        let pool = WorkerPool { shared };
        let start = pool.shared.config.start_servers.max(1);
        for _ in 0..start {
            pool.spawn_one();
        }
        pool
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(|poison| {
            warn!("pool mutex poisoned by a panicking worker, recovering");
            poison.into_inner()
        })
    }

    fn spawn_one(&self) {
        let mut state = self.lock_state();
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        drop(state);

        let worker = Worker::new(id);
        let pool_for_thread = self.clone();
        let worker_for_thread = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(format!("radius-worker-{id}"))
            .spawn(move || worker_loop(pool_for_thread, worker_for_thread))
            .expect("failed to spawn worker thread");
        *worker.handle.lock().expect("worker handle poisoned") = Some(handle);

        let mut state = self.lock_state();
        state.idle.push_front(worker);
        state.time_last_spawned = Instant::now();
    }

    /// `enqueue(Request) → bool` (§4.6.1 / §6).
    ///
    /// Admission control (§4.5) only ever applies to requests that actually
    /// reach the heap: a request bound directly to an idle worker below never
    /// touches [`RequestQueue::insert`], matching the original's fast path
    /// (it has nothing to drop — there is no queue pressure to relieve).
    pub fn enqueue(&self, request: Request) -> bool {
        let mut state = self.lock_state();

        // fast path: bind directly to an idle worker if one exists and
        // nothing is already waiting (§4.6.1 step 2); otherwise queue it,
        // and if an idle worker also exists, immediately pop the heap's
        // root and bind that instead — preserving ordering even when a
        // fast-path idle worker is available (§9, `num_queued || !idle_head`).
        let has_idle = !state.idle.is_empty();
        if has_idle && self.shared.queue.is_empty() {
            let worker = state.idle.pop_front().expect("checked non-empty above");
            self.bind_and_wake(&mut state, worker, request);
            return true;
        }

        let outcome = self.shared.queue.insert(request);
        match outcome {
            InsertOutcome::Rejected => return false,
            InsertOutcome::Dropped => return true,
            InsertOutcome::Queued => {}
        }

        if let Some(worker) = state.idle.front().cloned() {
            if let Some(popped) = self.shared.queue.pop(Instant::now()) {
                state.idle.pop_front();
                self.bind_and_wake(&mut state, worker, popped);
            }
        }
        true
    }

    fn bind_and_wake(&self, state: &mut PoolState, worker: Arc<Worker>, request: Request) {
        worker.set_status(WorkerStatus::Active);
        *worker.current.lock().expect("worker current poisoned") = Some(request);
        state.active.push_front(Arc::clone(&worker));
        // Posted after releasing the pool mutex in the general case, but here
        // the mutex is still held by the caller — that mirrors §4.6.1 step 4
        // ("outside the mutex"): callers of `bind_and_wake` drop `state`
        // themselves right after this returns, before any blocking occurs.
        worker.sem.post();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            total: state.total(),
            idle: state.idle.len(),
            active: state.active.len(),
            exited: state.exited.len(),
            num_queued: self.shared.queue.len(),
            total_blocked: self.shared.queue.total_blocked(),
        }
    }

    /// `pool_manage(now)` (§4.6.3): reap one exited thread, spawn up to
    /// deficit, else trim one surplus. Runs under the pool mutex except for
    /// the join, which the caller performs with the mutex released.
    fn pool_manage(&self, now: Instant) {
        let mut to_join: Option<Arc<Worker>> = None;
        {
            let mut state = self.lock_state();
            if let Some(worker) = state.exited.front() {
                if worker.status() == WorkerStatus::Exited {
                    to_join = state.exited.pop_front();
                }
            }
        }
        if let Some(worker) = to_join {
            // §5: "no worker holds the pool mutex across a pthread_join".
            if let Some(handle) = worker.handle.lock().expect("worker handle poisoned").take() {
                let _ = handle.join();
            }
        }

        let mut state = self.lock_state();
        let config = &self.shared.config;

        if !state.spawning && state.total() < config.max_servers && state.idle.len() < config.min_spare_servers {
            let want = (config.min_spare_servers - state.idle.len()).min(config.max_servers - state.total());
            state.spawning = true;
            drop(state);
            for _ in 0..want {
                self.spawn_one();
            }
            self.lock_state().spawning = false;
            debug!(spawned = want, "pool_manage: spawned workers to reach min_spare_servers");
            return;
        }

        let cleanup_delay = Duration::from_secs(config.cleanup_delay_secs);
        if now.saturating_duration_since(state.time_last_spawned) >= cleanup_delay
            && state.idle.len() > config.max_spare_servers
        {
            if let Some(worker) = state.idle.pop_back() {
                worker.set_status(WorkerStatus::Cancelled);
                state.exited.push_back(Arc::clone(&worker));
                worker.sem.post();
                debug!(worker_id = worker.id, "pool_manage: trimming surplus idle worker");
            }
        }
    }

    /// Set the stop flag and tear down every worker thread (§4.6.4).
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.stop_flag = true;
        let mut all: Vec<Arc<Worker>> = Vec::new();
        all.extend(state.exited.drain(..));
        all.extend(state.idle.drain(..));
        all.extend(state.active.drain(..));
        drop(state);

        for worker in &all {
            worker.set_status(WorkerStatus::Cancelled);
            worker.sem.post();
        }
        for worker in all {
            if let Some(handle) = worker.handle.lock().expect("worker handle poisoned").take() {
                let _ = handle.join();
            }
        }
        info!("pool shutdown complete");
    }
}

fn worker_loop(pool: WorkerPool, worker: Arc<Worker>) {
    loop {
        worker.sem.wait();

        if worker.status() == WorkerStatus::Cancelled || pool.lock_state().stop_flag {
            break;
        }

        'run: loop {
            let request = worker.current.lock().expect("worker current poisoned").take();
            let Some(mut request) = request else { break 'run };

            request.component = Some("<core>");
            request.module = None;
            request.child_state = ChildState::Running;
            let rcode = (pool.shared.process)(&mut request);
            request.finish(rcode);
            worker.request_count.fetch_add(1, Ordering::Relaxed);

            let now = Instant::now();
            let mut state = pool.lock_state();
            if now > state.last_manage_time {
                state.last_manage_time = now;
                drop(state);
                pool.pool_manage(now);
                state = pool.lock_state();
            }

            if let Some(next) = pool.shared.queue.pop(now) {
                drop(state);
                *worker.current.lock().expect("worker current poisoned") = Some(next);
                continue 'run;
            }

            // Unlink from active, reinsert at idle head (LIFO: hot threads
            // stay hot) — §4.6.2 step 6c.
            state.active.retain(|w| w.id != worker.id);
            worker.set_status(WorkerStatus::Idle);
            state.idle.push_front(Arc::clone(&worker));
            break 'run;
        }
    }

    // Cancelled: unlink from wherever it still is and land in exited.
    let mut state = pool.lock_state();
    state.idle.retain(|w| w.id != worker.id);
    state.active.retain(|w| w.id != worker.id);
    if !state.exited.iter().any(|w| w.id == worker.id) {
        state.exited.push_back(Arc::clone(&worker));
    }
    worker.set_status(WorkerStatus::Exited);
}
