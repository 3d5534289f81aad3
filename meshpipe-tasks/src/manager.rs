//! Task manager
//!
//! Owns the task registry and the pool of execution contexts. Requests are
//! dispatched by outstanding cost and settled through per-request channels.

use crate::context::{ExecutionContext, PendingReply};
use crate::error::TaskError;
use crate::message::RequestId;
use crate::task::{Dependencies, ErasedShared, ErasedTask, Payload, SharedDependencies, Task, TypedTask};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::TypeId;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Task manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskManagerConfig {
    /// Maximum number of execution contexts; zero runs one inline context
    pub worker_limit: usize,
    /// Pin each worker thread to a core, round robin
    pub pin_workers: bool,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            worker_limit: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            pin_workers: false,
        }
    }
}

/// Snapshot of the pool state
#[derive(Debug, Clone, PartialEq)]
pub struct TaskManagerStats {
    pub contexts: usize,
    pub in_flight: usize,
    pub requests_issued: u64,
    /// Outstanding cost per context, in pool order
    pub loads: Vec<f64>,
}

#[derive(Clone)]
struct Registration {
    task_type: String,
    handler: Arc<dyn ErasedTask>,
    dependencies: SharedDependencies,
}

struct Resolved {
    task_type: String,
    handler: Arc<dyn ErasedTask>,
    dependencies: ErasedShared,
}

struct Inner {
    config: Mutex<TaskManagerConfig>,
    registry: Mutex<Vec<Registration>>,
    initialized: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    pool: Mutex<Vec<ExecutionContext>>,
    next_request_id: AtomicU64,
    next_context_id: AtomicUsize,
}

/// Runs registered tasks on a bounded pool of execution contexts
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(TaskManagerConfig::default())
    }
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                registry: Mutex::new(Vec::new()),
                initialized: Mutex::new(None),
                pool: Mutex::new(Vec::new()),
                next_request_id: AtomicU64::new(1),
                next_context_id: AtomicUsize::new(1),
            }),
        }
    }

    pub fn with_worker_limit(worker_limit: usize) -> Self {
        Self::new(TaskManagerConfig {
            worker_limit,
            ..Default::default()
        })
    }

    /// Change the worker limit; existing contexts are kept
    pub fn set_worker_limit(&self, worker_limit: usize) -> &Self {
        self.inner.config.lock().worker_limit = worker_limit;
        self
    }

    pub fn worker_limit(&self) -> usize {
        self.inner.config.lock().worker_limit
    }

    /// Register `task` under `task_type` with default dependencies
    pub fn register<T>(&self, task_type: &str, task: T) -> &Self
    where
        T: Task,
        T::Dependencies: Default,
    {
        self.register_with(task_type, task, Dependencies::default())
    }

    /// Register `task` under `task_type`, replacing any earlier registration
    ///
    /// Contexts that already exist are not initialized for the new type.
    pub fn register_with<T: Task>(
        &self,
        task_type: &str,
        task: T,
        dependencies: Dependencies<T::Dependencies>,
    ) -> &Self {
        let registration = Registration {
            task_type: task_type.to_owned(),
            handler: Arc::new(TypedTask::new(task_type, task)),
            dependencies: dependencies.into_shared(),
        };

        {
            let mut registry = self.inner.registry.lock();
            match registry.iter_mut().find(|r| r.task_type == task_type) {
                Some(existing) => *existing = registration,
                None => registry.push(registration),
            }
        }

        if !self.inner.pool.lock().is_empty() {
            log::warn!(
                "Task type \"{}\" registered after execution contexts were created; only new contexts will run it",
                task_type
            );
        }

        self
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.inner.registry.lock().iter().any(|r| r.task_type == task_type)
    }

    /// Run `task_type` with `config` on the least loaded execution context
    ///
    /// The request id is allocated when this is called. `cost` only feeds load
    /// balancing. Dropping the returned future releases the request's
    /// bookkeeping but does not stop the task.
    pub fn run<T: Task>(
        &self,
        task_type: &str,
        config: T::Config,
        cost: f64,
    ) -> impl Future<Output = Result<T::Output, TaskError>> + Send + 'static {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let task_type = task_type.to_owned();
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };

        async move {
            let handler = inner.lookup(&task_type)?;
            if handler.config_type() != TypeId::of::<T::Config>()
                || handler.output_type() != TypeId::of::<T::Output>()
            {
                return Err(TaskError::PayloadMismatch(task_type));
            }

            let resolved = inner.resolve().await;
            let (context, pending) = inner.dispatch(&task_type, id, Box::new(config), cost, &resolved)?;
            let _release = Release {
                inner: Arc::clone(&inner),
                context,
                id,
            };

            let payload = pending.settle().await?;
            payload
                .downcast::<T::Output>()
                .map(|output| *output)
                .map_err(|_| TaskError::PayloadMismatch(task_type))
        }
    }

    /// Terminate every execution context and clear the pool
    ///
    /// Returns without waiting for running tasks. Requests still waiting on a
    /// terminated context resolve with [`TaskError::Terminated`].
    pub fn dispose(&self) {
        let contexts = std::mem::take(&mut *self.inner.pool.lock());
        let count = contexts.len();
        drop(contexts);

        log::info!("Disposed {} execution contexts", count);
    }

    pub fn stats(&self) -> TaskManagerStats {
        let pool = self.inner.pool.lock();
        let stats = TaskManagerStats {
            contexts: pool.len(),
            in_flight: pool.iter().map(ExecutionContext::in_flight).sum(),
            requests_issued: self.inner.next_request_id.load(Ordering::SeqCst) - 1,
            loads: pool.iter().map(ExecutionContext::load).collect(),
        };
        drop(pool);

        log::debug!("Task manager stats: {:?}", stats);
        stats
    }
}

impl Inner {
    fn lookup(&self, task_type: &str) -> Result<Arc<dyn ErasedTask>, TaskError> {
        let registry = self.registry.lock();
        match registry.iter().find(|r| r.task_type == task_type) {
            Some(registration) => Ok(Arc::clone(&registration.handler)),
            None => {
                log::error!("Run requested for unregistered task type \"{}\"", task_type);
                Err(TaskError::UnknownTaskType(task_type.to_owned()))
            }
        }
    }

    /// Shared one-time resolution of every registered task's dependencies
    fn global_init(&self) -> Shared<BoxFuture<'static, ()>> {
        let mut slot = self.initialized.lock();
        slot.get_or_insert_with(|| {
            let pending: Vec<SharedDependencies> = self
                .registry
                .lock()
                .iter()
                .map(|r| r.dependencies.clone())
                .collect();

            async move {
                let count = join_all(pending).await.len();
                log::info!("Resolved dependencies for {} task types", count);
            }
            .boxed()
            .shared()
        })
        .clone()
    }

    async fn resolve(&self) -> Vec<Resolved> {
        self.global_init().await;

        // Registrations made after global init resolve here, each only once
        let registry: Vec<Registration> = self.registry.lock().clone();
        let dependencies = join_all(registry.iter().map(|r| r.dependencies.clone())).await;

        registry
            .into_iter()
            .zip(dependencies)
            .map(|(registration, dependencies)| Resolved {
                task_type: registration.task_type,
                handler: registration.handler,
                dependencies,
            })
            .collect()
    }

    fn dispatch(
        &self,
        task_type: &str,
        id: RequestId,
        config: Payload,
        cost: f64,
        resolved: &[Resolved],
    ) -> Result<(usize, PendingReply), TaskError> {
        let config_snapshot = self.config.lock().clone();
        let mut pool = self.pool.lock();

        let index = self.select_context(&mut pool, &config_snapshot, resolved)?;
        let context = &mut pool[index];
        let pending = context.run(task_type, id, config, cost)?;

        log::debug!(
            "Dispatched request {} ({}) to execution context {}, load {:.2}",
            id,
            task_type,
            context.id(),
            context.load()
        );

        Ok((context.id(), pending))
    }

    fn select_context(
        &self,
        pool: &mut Vec<ExecutionContext>,
        config: &TaskManagerConfig,
        resolved: &[Resolved],
    ) -> Result<usize, TaskError> {
        if config.worker_limit == 0 {
            // Earliest context, threaded ones included when the limit was lowered
            if !pool.is_empty() {
                return Ok(0);
            }
            let context = ExecutionContext::inline(self.next_context_id.fetch_add(1, Ordering::SeqCst));
            return self.push_initialized(pool, context, resolved);
        }

        let threaded = pool.iter().filter(|c| c.is_threaded()).count();
        if threaded < config.worker_limit {
            let id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
            let core = if config.pin_workers {
                core_affinity::get_core_ids()
                    .filter(|cores| !cores.is_empty())
                    .map(|cores| cores[threaded % cores.len()])
            } else {
                None
            };
            let context = ExecutionContext::spawn_thread(id, core)?;
            return self.push_initialized(pool, context, resolved);
        }

        // Lowest load wins, earliest context on ties
        let mut best: Option<usize> = None;
        for (index, context) in pool.iter().enumerate() {
            if !context.is_threaded() {
                continue;
            }
            match best {
                Some(current) if pool[current].load() <= context.load() => {}
                _ => best = Some(index),
            }
        }

        best.ok_or(TaskError::Terminated)
    }

    fn push_initialized(
        &self,
        pool: &mut Vec<ExecutionContext>,
        mut context: ExecutionContext,
        resolved: &[Resolved],
    ) -> Result<usize, TaskError> {
        for entry in resolved {
            context.init(
                &entry.task_type,
                Arc::clone(&entry.handler),
                Arc::clone(&entry.dependencies),
            )?;
        }

        pool.push(context);
        Ok(pool.len() - 1)
    }
}

/// Releases a request's cost and callback on every exit path
struct Release {
    inner: Arc<Inner>,
    context: usize,
    id: RequestId,
}

impl Drop for Release {
    fn drop(&mut self) {
        let mut pool = self.inner.pool.lock();
        if let Some(context) = pool.iter_mut().find(|c| c.id() == self.context) {
            context.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskFuture;
    use futures::channel::oneshot;
    use futures::executor::{block_on, LocalPool};
    use futures::future::{self, FutureExt};
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Copy)]
    struct Operands {
        a: i32,
        b: i32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Sum {
        sum: i32,
    }

    struct Echo;

    impl Task for Echo {
        type Dependencies = ();
        type Scope = ();
        type Config = Operands;
        type Output = Sum;

        fn init(&self, _: &()) {}

        fn run(&self, _: Arc<()>, config: Operands) -> TaskFuture<Sum> {
            future::ready(Ok(Sum {
                sum: config.a + config.b,
            }))
            .boxed()
        }
    }

    /// Scope built from dependencies, reports the thread it ran on
    struct Scoped;

    impl Task for Scoped {
        type Dependencies = Vec<u32>;
        type Scope = (u32, Vec<u32>);
        type Config = ();
        type Output = (u32, Vec<u32>, Option<String>);

        fn init(&self, dependencies: &Vec<u32>) -> (u32, Vec<u32>) {
            (123, dependencies.clone())
        }

        fn run(&self, scope: Arc<(u32, Vec<u32>)>, _: ()) -> TaskFuture<Self::Output> {
            let thread = thread::current().name().map(str::to_owned);
            future::ready(Ok((scope.0, scope.1.clone(), thread))).boxed()
        }
    }

    /// Waits on a caller-held gate before answering
    struct Gate;

    impl Task for Gate {
        type Dependencies = ();
        type Scope = ();
        type Config = oneshot::Receiver<u32>;
        type Output = u32;

        fn init(&self, _: &()) {}

        fn run(&self, _: Arc<()>, gate: oneshot::Receiver<u32>) -> TaskFuture<u32> {
            async move { gate.await.map_err(|_| TaskError::failed("gate dropped")) }.boxed()
        }
    }

    /// Signals once started, then blocks its context for a while
    struct Stall;

    impl Task for Stall {
        type Dependencies = ();
        type Scope = ();
        type Config = (crossbeam::channel::Sender<()>, Duration);
        type Output = ();

        fn init(&self, _: &()) {}

        fn run(&self, _: Arc<()>, (started, duration): Self::Config) -> TaskFuture<()> {
            async move {
                let _ = started.send(());
                thread::sleep(duration);
                Ok(())
            }
            .boxed()
        }
    }

    /// Reads the manager's stats from inside init and run
    struct Inspector(TaskManager);

    impl Task for Inspector {
        type Dependencies = ();
        type Scope = usize;
        type Config = ();
        type Output = (usize, usize);

        fn init(&self, _: &()) -> usize {
            self.0.stats().contexts
        }

        fn run(&self, scope: Arc<usize>, _: ()) -> TaskFuture<(usize, usize)> {
            let in_flight = self.0.stats().in_flight;
            future::ready(Ok((*scope, in_flight))).boxed()
        }
    }

    struct Faulty;

    impl Task for Faulty {
        type Dependencies = ();
        type Scope = ();
        type Config = bool;
        type Output = ();

        fn init(&self, _: &()) {}

        fn run(&self, _: Arc<()>, panics: bool) -> TaskFuture<()> {
            async move {
                if panics {
                    panic!("decoder exploded");
                }
                Err(TaskError::failed("bad input"))
            }
            .boxed()
        }
    }

    fn collect<T: 'static>(
        pool: &LocalPool,
        results: &Rc<RefCell<Vec<T>>>,
        future: impl Future<Output = T> + 'static,
    ) {
        let results = Rc::clone(results);
        pool.spawner()
            .spawn_local(async move {
                let value = future.await;
                results.borrow_mut().push(value)
            })
            .unwrap();
    }

    #[test]
    fn test_echo_for_inline_and_threaded_limits() {
        for limit in [0, 2] {
            let manager = TaskManager::with_worker_limit(limit);
            manager.register("echo", Echo);

            let result = block_on(manager.run::<Echo>("echo", Operands { a: 3, b: 5 }, 0.0));
            assert_eq!(result, Ok(Sum { sum: 8 }), "limit {}", limit);
        }
    }

    #[test]
    fn test_init_scope_visible_in_run() {
        for limit in [0, 2] {
            let manager = TaskManager::with_worker_limit(limit);
            manager.register_with("scoped", Scoped, Dependencies::ready(vec![4, 2]));

            let (marker, dependencies, _) = block_on(manager.run::<Scoped>("scoped", (), 1.0)).unwrap();
            assert_eq!(marker, 123);
            assert_eq!(dependencies, vec![4, 2]);
        }
    }

    #[test]
    fn test_inline_runs_on_caller_thread() {
        let manager = TaskManager::with_worker_limit(0);
        manager.register("scoped", Scoped);

        let caller = thread::current().name().map(str::to_owned);
        let (_, _, thread) = block_on(manager.run::<Scoped>("scoped", (), 0.0)).unwrap();
        assert_eq!(thread, caller);
    }

    #[test]
    fn test_threaded_runs_on_worker() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("scoped", Scoped);

        let (_, _, thread) = block_on(manager.run::<Scoped>("scoped", (), 0.0)).unwrap();
        assert!(thread.unwrap().starts_with("meshpipe-worker-"));
    }

    #[test]
    fn test_context_count_bounded_by_limit() {
        for (limit, expected) in [(0usize, 1usize), (3, 3)] {
            let manager = TaskManager::with_worker_limit(limit);
            manager.register("gate", Gate);

            let mut local = LocalPool::new();
            let results = Rc::new(RefCell::new(Vec::new()));
            let mut gates = Vec::new();
            for _ in 0..8 {
                let (tx, rx) = oneshot::channel();
                gates.push(tx);
                collect(&local, &results, manager.run::<Gate>("gate", rx, 1.0));
            }

            local.run_until_stalled();
            let stats = manager.stats();
            assert_eq!(stats.contexts, expected, "limit {}", limit);
            assert_eq!(stats.in_flight, 8);
            assert_eq!(stats.requests_issued, 8);

            for (value, gate) in gates.into_iter().enumerate() {
                gate.send(value as u32).unwrap();
            }
            local.run();

            let mut values: Vec<u32> = results.borrow_mut().drain(..).map(Result::unwrap).collect();
            values.sort();
            assert_eq!(values, (0..8).collect::<Vec<_>>());
            assert_eq!(manager.stats().contexts, expected);
        }
    }

    #[test]
    fn test_lowest_load_receives_next_request() {
        let manager = TaskManager::with_worker_limit(2);
        manager.register("gate", Gate);

        let mut local = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut gates = Vec::new();
        for cost in [5.0, 1.0, 2.0] {
            let (tx, rx) = oneshot::channel();
            gates.push(tx);
            collect(&local, &results, manager.run::<Gate>("gate", rx, cost));
            local.run_until_stalled();
        }

        assert_eq!(manager.stats().loads, vec![5.0, 3.0]);

        for gate in gates {
            gate.send(1).unwrap();
        }
        local.run();

        assert_eq!(results.borrow().len(), 3);
        let stats = manager.stats();
        assert_eq!(stats.loads, vec![0.0, 0.0]);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_load_ties_go_to_earliest_context() {
        let manager = TaskManager::with_worker_limit(2);
        manager.register("gate", Gate);

        let mut local = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut gates = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            gates.push(tx);
            collect(&local, &results, manager.run::<Gate>("gate", rx, 1.0));
            local.run_until_stalled();
        }

        assert_eq!(manager.stats().loads, vec![2.0, 1.0]);

        for gate in gates {
            gate.send(1).unwrap();
        }
        local.run();
        assert_eq!(manager.stats().loads, vec![0.0, 0.0]);
    }

    #[test]
    fn test_zero_limit_reuses_existing_context() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("scoped", Scoped);
        block_on(manager.run::<Scoped>("scoped", (), 0.0)).unwrap();

        manager.set_worker_limit(0);
        let (_, _, thread) = block_on(manager.run::<Scoped>("scoped", (), 0.0)).unwrap();

        assert!(thread.unwrap().starts_with("meshpipe-worker-"));
        assert_eq!(manager.stats().contexts, 1);
    }

    #[test]
    fn test_inline_task_may_query_manager() {
        let manager = TaskManager::with_worker_limit(0);
        manager.register("inspector", Inspector(manager.clone()));

        let result = block_on(manager.run::<Inspector>("inspector", (), 1.0));
        assert_eq!(result, Ok((1, 1)));
        assert_eq!(manager.stats().in_flight, 0);
    }

    #[test]
    fn test_failures_release_bookkeeping() {
        for limit in [0, 1] {
            let manager = TaskManager::with_worker_limit(limit);
            manager.register("faulty", Faulty).register("echo", Echo);

            let failed = block_on(manager.run::<Faulty>("faulty", false, 4.0));
            assert_eq!(failed, Err(TaskError::Failed("bad input".to_string())));

            let panicked = block_on(manager.run::<Faulty>("faulty", true, 4.0));
            match panicked {
                Err(TaskError::Failed(message)) => assert!(message.contains("decoder exploded")),
                other => panic!("unexpected outcome: {:?}", other),
            }

            // Same context still serves requests
            let ok = block_on(manager.run::<Echo>("echo", Operands { a: 1, b: 1 }, 0.0));
            assert_eq!(ok, Ok(Sum { sum: 2 }));

            let stats = manager.stats();
            assert_eq!(stats.contexts, 1);
            assert_eq!(stats.in_flight, 0);
            assert_eq!(stats.loads, vec![0.0]);
        }
    }

    #[test]
    fn test_dropped_request_releases_cost() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("gate", Gate);

        let (_tx, rx) = oneshot::channel::<u32>();
        let mut local = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        collect(&local, &results, manager.run::<Gate>("gate", rx, 7.0));
        local.run_until_stalled();
        assert_eq!(manager.stats().loads, vec![7.0]);

        drop(local);
        assert_eq!(manager.stats().loads, vec![0.0]);
        assert_eq!(manager.stats().in_flight, 0);
    }

    #[test]
    fn test_unknown_task_type() {
        let manager = TaskManager::with_worker_limit(1);
        let result = block_on(manager.run::<Echo>("missing", Operands { a: 0, b: 0 }, 0.0));

        assert_eq!(result, Err(TaskError::UnknownTaskType("missing".to_string())));
        assert_eq!(manager.stats().contexts, 0);
    }

    #[test]
    fn test_payload_mismatch() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("echo", Echo);

        let result = block_on(manager.run::<Faulty>("echo", true, 0.0));
        assert_eq!(result, Err(TaskError::PayloadMismatch("echo".to_string())));
    }

    #[test]
    fn test_global_init_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let manager = TaskManager::with_worker_limit(2);
        manager.register_with(
            "scoped",
            Scoped,
            Dependencies::pending(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![9]
            }),
        );

        let runs = (0..6).map(|_| manager.run::<Scoped>("scoped", (), 1.0));
        let results = block_on(join_all(runs));

        assert!(results.iter().all(|r| matches!(r, Ok((123, deps, _)) if deps == &vec![9])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_then_recreate() {
        let manager = TaskManager::with_worker_limit(2);
        manager.register("echo", Echo);

        let runs = (0..2).map(|i| manager.run::<Echo>("echo", Operands { a: i, b: i }, 1.0));
        block_on(join_all(runs));
        assert_eq!(manager.stats().contexts, 2);

        manager.dispose();
        assert_eq!(manager.stats().contexts, 0);

        let result = block_on(manager.run::<Echo>("echo", Operands { a: 3, b: 5 }, 0.0));
        assert_eq!(result, Ok(Sum { sum: 8 }));
        assert_eq!(manager.stats().contexts, 1);
    }

    #[test]
    fn test_dispose_terminates_in_flight() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("gate", Gate);

        let (_tx, rx) = oneshot::channel::<u32>();
        let mut local = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        collect(&local, &results, manager.run::<Gate>("gate", rx, 1.0));
        local.run_until_stalled();

        manager.dispose();
        local.run();

        assert_eq!(*results.borrow(), vec![Err::<u32, _>(TaskError::Terminated)]);
    }

    #[test]
    fn test_dispose_does_not_wait_for_running_tasks() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("stall", Stall);

        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        let mut local = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        let stall = (started_tx, Duration::from_secs(2));
        collect(&local, &results, manager.run::<Stall>("stall", stall, 1.0));
        local.run_until_stalled();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        manager.dispose();
        assert!(started.elapsed() < Duration::from_secs(1), "dispose blocked for {:?}", started.elapsed());

        local.run();
        assert_eq!(*results.borrow(), vec![Err::<(), _>(TaskError::Terminated)]);
    }

    #[test]
    fn test_late_registration_not_seen_by_existing_context() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("echo", Echo);
        block_on(manager.run::<Echo>("echo", Operands { a: 1, b: 2 }, 0.0)).unwrap();

        manager.register("scoped", Scoped);
        assert!(manager.is_registered("scoped"));

        let result = block_on(manager.run::<Scoped>("scoped", (), 0.0));
        assert!(matches!(result, Err(TaskError::NotInitialized { ref task, .. }) if task == "scoped"));

        // A fresh pool picks the registration up
        manager.dispose();
        assert!(block_on(manager.run::<Scoped>("scoped", (), 0.0)).is_ok());
    }

    #[test]
    fn test_request_ids_are_allocated_at_call_time() {
        let manager = TaskManager::with_worker_limit(1);
        manager.register("echo", Echo);

        let first = manager.run::<Echo>("echo", Operands { a: 0, b: 0 }, 0.0);
        let second = manager.run::<Echo>("echo", Operands { a: 0, b: 0 }, 0.0);
        assert_eq!(manager.stats().requests_issued, 2);

        block_on(second).unwrap();
        block_on(first).unwrap();
    }
}
