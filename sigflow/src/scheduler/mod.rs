//! The thread pool driving worker actors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::actor::WorkerActor;
use crate::logging::{SchedulerEvent, SchedulerLogger, SCHEDULER_STREAM};

/// How worker threads behave when no actor is ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YieldMode {
    /// Busy-poll actors without blocking.
    Spin,
    /// Poll, then fall back to condvar waits after a miss threshold.
    Hybrid,
    /// Always wait on the condvar between visits.
    Cooperative,
}

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Worker threads in the pool.
    pub num_threads: usize,
    /// Idle policy.
    pub yield_mode: YieldMode,
    /// CPUs the worker threads are pinned to, round-robin (Linux only).
    pub affinity: Option<Vec<usize>>,
    /// Nice value applied to worker threads (Linux only).
    pub priority: Option<i32>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            yield_mode: YieldMode::Hybrid,
            affinity: None,
            priority: None,
        }
    }
}

#[cfg(feature = "getopts")]
impl Config {
    /// Constructs a configuration by parsing supplied text arguments.
    ///
    /// Most commonly this consumes `std::env::args()`.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        opts.optopt("t", "threads", "number of scheduler worker threads", "NUM");
        opts.optopt("y", "yield", "idle policy: spin, hybrid, cooperative", "MODE");

        let matches = opts.parse(args).map_err(|e| format!("{:?}", e))?;
        let mut config = Config::default();
        if let Some(threads) = matches.opt_str("t") {
            config.num_threads = threads.parse().map_err(|e| format!("bad thread count: {:?}", e))?;
        }
        if let Some(mode) = matches.opt_str("y") {
            config.yield_mode = match mode.as_str() {
                "spin" => YieldMode::Spin,
                "hybrid" => YieldMode::Hybrid,
                "cooperative" => YieldMode::Cooperative,
                other => return Err(format!("unknown yield mode: {}", other)),
            };
        }
        Ok(config)
    }
}

/// Consecutive misses before a hybrid thread starts waiting.
const HYBRID_WAIT_THRESHOLD: usize = 16;

/// Sleep applied when a thread owns no actors at all.
const EMPTY_PARK: Duration = Duration::from_millis(1);

struct PoolState {
    actors: Vec<Arc<WorkerActor>>,
}

struct PoolInner {
    config: Config,
    state: Mutex<PoolState>,
    /// Bumped whenever the actor set changes; threads refresh their local
    /// copy when it moves.
    epoch: AtomicU64,
    shutdown: AtomicBool,
    registry: Arc<sigflow_logging::Registry>,
}

/// A pool of worker threads round-robining over registered actors.
///
/// Threads are spawned up front and stop when the pool shuts down (also on
/// drop). Actors are registered by the topology at activation and removed
/// at deactivation.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns the configured worker threads.
    pub(crate) fn new(config: Config, registry: Arc<sigflow_logging::Registry>) -> ThreadPool {
        let inner = Arc::new(PoolInner {
            config: config.clone(),
            state: Mutex::new(PoolState { actors: Vec::new() }),
            epoch: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            registry,
        });

        let mut handles = Vec::with_capacity(config.num_threads);
        for index in 0..config.num_threads.max(1) {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("sigflow-worker-{}", index))
                .spawn(move || worker_loop(inner, index))
                .expect("failed to spawn scheduler worker thread");
            handles.push(handle);
        }

        ThreadPool { inner, handles: Mutex::new(handles) }
    }

    pub(crate) fn add_actor(&self, actor: Arc<WorkerActor>) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.actors.iter().any(|a| a.uid == actor.uid) {
            state.actors.push(actor);
            self.inner.epoch.fetch_add(1, Ordering::Release);
        }
    }

    pub(crate) fn remove_actor(&self, uid: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(at) = state.actors.iter().position(|a| a.uid == uid) {
            state.actors.remove(at);
            self.inner.epoch.fetch_add(1, Ordering::Release);
        }
    }

    /// Actors currently owned by the pool.
    pub(crate) fn actors(&self) -> Vec<Arc<WorkerActor>> {
        self.inner.state.lock().unwrap().actors.clone()
    }

    /// Stops all worker threads and cancels waiting external callers.
    pub(crate) fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for actor in self.actors() {
            actor.iface().cancel();
        }
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, thread_index: usize) {
    apply_thread_tuning(&inner.config, thread_index);
    let mut logger: Option<SchedulerLogger> = inner.registry.get(SCHEDULER_STREAM);
    if let Some(logger) = &logger {
        logger.log(SchedulerEvent::ThreadStart { thread: thread_index });
    }

    let mut actors: Vec<Arc<WorkerActor>> = Vec::new();
    let mut seen_epoch = 0u64;
    let mut position = 0usize;
    let mut misses = 0usize;

    while !inner.shutdown.load(Ordering::Acquire) {
        let epoch = inner.epoch.load(Ordering::Acquire);
        if epoch != seen_epoch {
            actors = inner.state.lock().unwrap().actors.clone();
            seen_epoch = epoch;
            position = thread_index; // spread threads over the set
            misses = 0;
            // Bind to a destination installed since the last refresh.
            if logger.is_none() {
                logger = inner.registry.get(SCHEDULER_STREAM);
            }
        }

        if actors.is_empty() {
            thread::park_timeout(EMPTY_PARK);
            continue;
        }

        position = (position + 1) % actors.len();
        let actor = &actors[position];
        actor.poll_yield();

        // Enable condvar waits once polling has gone stale, or whenever an
        // external caller is pending so it gets the lock promptly.
        let external_pending = actors.iter().any(|a| a.external_pending());
        let wait_enabled = match inner.config.yield_mode {
            YieldMode::Spin => false,
            YieldMode::Cooperative => true,
            YieldMode::Hybrid => misses >= HYBRID_WAIT_THRESHOLD * actors.len(),
        } || external_pending;

        if actor.step(wait_enabled) {
            misses = 0;
        } else {
            misses += 1;
            if inner.config.yield_mode != YieldMode::Spin && misses % actors.len() == 0 {
                thread::yield_now();
            }
        }
    }

    if let Some(logger) = &logger {
        logger.log(SchedulerEvent::ThreadStop { thread: thread_index });
        logger.flush();
    }
}

#[cfg(target_os = "linux")]
fn apply_thread_tuning(config: &Config, thread_index: usize) {
    if let Some(cpus) = &config.affinity {
        if !cpus.is_empty() {
            let cpu = cpus[thread_index % cpus.len()];
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_SET(cpu, &mut set);
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            }
        }
    }
    if let Some(priority) = config.priority {
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
            libc::setpriority(libc::PRIO_PROCESS as _, tid, priority);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_thread_tuning(_config: &Config, _thread_index: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = Config::default();
        assert!(config.num_threads >= 1);
        assert_eq!(config.yield_mode, YieldMode::Hybrid);
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn config_from_args() {
        let args = ["-t", "3", "-y", "cooperative"].iter().map(|s| s.to_string());
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.yield_mode, YieldMode::Cooperative);

        let bad = ["-y", "frantic"].iter().map(|s| s.to_string());
        assert!(Config::from_args(bad).is_err());
    }

    #[test]
    fn pool_starts_and_shuts_down() {
        let registry = Arc::new(sigflow_logging::Registry::default());
        let pool = ThreadPool::new(Config { num_threads: 2, ..Config::default() }, registry);
        assert!(pool.actors().is_empty());
        pool.shutdown();
        // Idempotent.
        pool.shutdown();
    }
}
