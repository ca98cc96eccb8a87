// Async tasks: fork / wait
//
// A Future is a single-assignment cell:
//
//   Pending(task) ──► Running ──► Done(Ok(value) | Err(error))
//
// Under compiled execution a Fork node hands its body to the worker pool
// and gets a pending Future back at once. `wait` blocks on a condition
// variable until the cell is Done. If the task has not been picked up by a
// worker yet, the waiting thread takes it and runs it itself, so a wait
// never depends on a free worker.
//
// Outside compiled execution `fork` runs the callable inline and returns a
// Future that is already Done. Errors raised by a task are stored in the
// cell and only surface from `wait`.
//
// There is no cancellation: a started task always runs to the end.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};

use crate::error::{Error, Result};
use crate::tracer;
use crate::value::IValue;

/// Work queued on the pool.
pub(crate) type Task = Box<dyn FnOnce() -> Result<IValue> + Send + 'static>;

enum State {
    Pending(Option<Task>),
    Running,
    Done(Result<IValue>),
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

/// Handle to the eventual result of a forked task.
#[derive(Clone)]
pub struct Future {
    shared: Arc<Shared>,
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Future(done={})", self.is_done())
    }
}

fn poisoned() -> Error {
    Error::runtime("future state lock poisoned")
}

/// Run a task body, turning a panic into an error stored in the future.
fn execute(task: Task) -> Result<IValue> {
    panic::catch_unwind(AssertUnwindSafe(task))
        .unwrap_or_else(|_| Err(Error::runtime("forked task panicked")))
}

impl Future {
    fn with_state(state: State) -> Self {
        Future {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                ready: Condvar::new(),
            }),
        }
    }

    /// A future that already holds `value`.
    pub fn completed(value: IValue) -> Self {
        Self::with_state(State::Done(Ok(value)))
    }

    /// A future that already failed with `error`.
    pub fn failed(error: Error) -> Self {
        Self::with_state(State::Done(Err(error)))
    }

    pub fn from_result(result: Result<IValue>) -> Self {
        Self::with_state(State::Done(result))
    }

    pub(crate) fn deferred(task: Task) -> Self {
        Self::with_state(State::Pending(Some(task)))
    }

    /// Identity of the cell.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.shared.state.lock().map_err(|_| poisoned())
    }

    pub fn is_done(&self) -> bool {
        self.lock().map(|s| matches!(*s, State::Done(_))).unwrap_or(false)
    }

    /// The value, if the task already succeeded.
    pub fn peek(&self) -> Option<IValue> {
        match &*self.lock().ok()? {
            State::Done(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn complete(&self, result: Result<IValue>) -> Result<IValue> {
        let mut state = self.lock()?;
        *state = State::Done(result.clone());
        self.shared.ready.notify_all();
        result
    }

    /// Worker entry point. Does nothing if a waiter already took the task.
    pub(crate) fn run(&self) {
        let task = match self.lock() {
            Ok(mut state) => {
                let task = match &mut *state {
                    State::Pending(task) => task.take(),
                    _ => None,
                };
                if task.is_some() {
                    *state = State::Running;
                }
                task
            }
            Err(_) => None,
        };
        if let Some(task) = task {
            // The waiter sees the stored result; nothing else to report here.
            let _ = self.complete(execute(task));
        }
    }

    /// Block until the task is done and return its result.
    pub fn wait(&self) -> Result<IValue> {
        let mut state = self.lock()?;
        loop {
            let task = match &mut *state {
                State::Done(result) => return result.clone(),
                State::Running => None,
                State::Pending(task) => task.take(),
            };
            match task {
                Some(task) => {
                    *state = State::Running;
                    drop(state);
                    log::trace!("wait: running a queued task on the waiting thread");
                    return self.complete(execute(task));
                }
                None => {
                    state = self.shared.ready.wait(state).map_err(|_| poisoned())?;
                }
            }
        }
    }
}

// Worker pool

/// Fixed-size pool of worker threads for forked tasks.
pub struct TaskPool {
    pool: rayon::ThreadPool,
    spawned: AtomicUsize,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("num_workers", &self.num_workers())
            .field("spawned", &self.tasks_spawned())
            .finish()
    }
}

impl TaskPool {
    pub fn new(num_workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("kestrel-worker-{i}"))
            .build()
            .map_err(|e| Error::runtime(format!("cannot start worker pool: {e}")))?;
        Ok(TaskPool {
            pool,
            spawned: AtomicUsize::new(0),
        })
    }

    /// Process-wide pool with `num_workers` threads, created on first use.
    pub fn shared(num_workers: usize) -> Result<Arc<TaskPool>> {
        static POOLS: OnceLock<Mutex<HashMap<usize, Arc<TaskPool>>>> = OnceLock::new();
        let pools = POOLS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut pools = pools
            .lock()
            .map_err(|_| Error::runtime("worker pool registry lock poisoned"))?;
        if let Some(pool) = pools.get(&num_workers) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(TaskPool::new(num_workers)?);
        log::debug!("started worker pool with {} thread(s)", pool.num_workers());
        pools.insert(num_workers, pool.clone());
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn tasks_spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Queue `task` and return its pending future.
    pub(crate) fn spawn(&self, task: Task) -> Future {
        let future = Future::deferred(task);
        let worker_side = future.clone();
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.pool.spawn(move || worker_side.run());
        future
    }
}

// Eager fork / wait

/// Something `fork` can start: a free function or a method bound to its
/// module.
pub trait Invocable: Send + Sync {
    /// Qualified name, for logs and traces.
    fn name(&self) -> String;

    fn invoke(&self, args: Vec<IValue>) -> Result<IValue>;
}

/// Start `callable` outside compiled code. The call runs inline; the
/// returned future is already done.
pub fn fork(callable: &dyn Invocable, args: Vec<IValue>) -> Future {
    log::trace!("fork '{}' inline", callable.name());
    run_inline(move || callable.invoke(args))
}

/// Result of a forked task, re-raising its error.
pub fn wait(future: &Future) -> Result<IValue> {
    let value = future.wait()?;
    tracer::record_wait(future, &value)?;
    Ok(value)
}

/// Run a fork body on the current thread. While tracing, the body is
/// recorded as a Fork node.
pub(crate) fn run_inline(body: impl FnOnce() -> Result<IValue>) -> Future {
    if tracer::is_tracing() {
        return tracer::record_fork(body);
    }
    Future::from_result(body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_completed_future() {
        let f = Future::completed(IValue::Int(3));
        assert!(f.is_done());
        assert_eq!(f.wait().unwrap().as_int(), Some(3));
        assert_eq!(f.wait().unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_error_surfaces_only_on_wait() {
        let f = Future::deferred(Box::new(|| Err(Error::runtime("boom"))));
        assert!(!f.is_done());
        let err = f.wait().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(f.is_done());
    }

    #[test]
    fn test_waiter_runs_unstarted_task() {
        let f = Future::deferred(Box::new(|| Ok(IValue::Int(7))));
        assert_eq!(f.wait().unwrap().as_int(), Some(7));
        // A late worker finds nothing to do.
        f.run();
        assert_eq!(f.peek().and_then(|v| v.as_int()), Some(7));
    }

    #[test]
    fn test_pool_runs_task_on_worker() {
        let pool = TaskPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let f = pool.spawn(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).ok();
            Ok(IValue::Int(1))
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.unwrap().starts_with("kestrel-worker-"));
        assert_eq!(f.wait().unwrap().as_int(), Some(1));
        assert_eq!(pool.tasks_spawned(), 1);
    }

    #[test]
    fn test_many_waiters() {
        let pool = Arc::new(TaskPool::new(2).unwrap());
        let f = pool.spawn(Box::new(|| {
            std::thread::sleep(Duration::from_millis(10));
            Ok(IValue::Int(5))
        }));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.wait().unwrap().as_int())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(5));
        }
    }

    #[test]
    fn test_panicking_task_becomes_error() {
        let f = Future::deferred(Box::new(|| panic!("task blew up")));
        assert!(f.wait().is_err());
    }
}
