//! Execution contexts
//!
//! A context is either a dedicated worker thread that drives its in-flight
//! requests on a local executor, or (worker limit zero) an inline context whose
//! requests are driven by the caller's own executor.

use crate::error::TaskError;
use crate::message::{RequestId, WorkerMessage, WorkerReply};
use crate::task::{ErasedShared, ErasedTask, Payload};
use crossbeam::channel;
use futures::channel::{mpsc, oneshot};
use futures::executor::LocalPool;
use futures::future::{self, BoxFuture, FutureExt};
use futures::task::LocalSpawnExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

type Callbacks = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Payload, String>>>>>;

/// Task scopes private to one execution context
#[derive(Default)]
pub(crate) struct ContextCore {
    tasks: HashMap<String, (Arc<dyn ErasedTask>, ErasedShared)>,
}

impl ContextCore {
    /// Handle one message
    ///
    /// `Init` completes immediately. `Run` returns the future producing its
    /// reply; task errors and panics become `WorkerReply::Error`.
    pub(crate) fn handle(&mut self, message: WorkerMessage) -> Option<BoxFuture<'static, WorkerReply>> {
        match message {
            WorkerMessage::Init {
                task,
                handler,
                dependencies,
            } => {
                if self.tasks.contains_key(&task) {
                    log::warn!("Task type \"{}\" already initialized, ignoring init", task);
                    return None;
                }

                match panic::catch_unwind(AssertUnwindSafe(|| handler.init(&dependencies))) {
                    Ok(Ok(scope)) => {
                        self.tasks.insert(task, (handler, scope));
                    }
                    Ok(Err(e)) => log::error!("Init of task type \"{}\" failed: {}", task, e),
                    Err(panic) => log::error!(
                        "Init of task type \"{}\" panicked: {}",
                        task,
                        panic_message(panic.as_ref())
                    ),
                }
                None
            }

            WorkerMessage::Run { task, id, config } => {
                let Some((handler, scope)) = self.tasks.get(&task) else {
                    let error = format!("Task type \"{}\" is not initialized", task);
                    return Some(future::ready(WorkerReply::Error { id, error }).boxed());
                };

                let scope = Arc::clone(scope);
                let started = panic::catch_unwind(AssertUnwindSafe(|| handler.run(scope, config)));

                Some(
                    async move {
                        let outcome = match started {
                            Ok(running) => AssertUnwindSafe(running).catch_unwind().await,
                            Err(panic) => Err(panic),
                        };

                        match outcome {
                            Ok(Ok(result)) => WorkerReply::Complete { id, result },
                            Ok(Err(e)) => WorkerReply::Error {
                                id,
                                error: e.to_string(),
                            },
                            Err(panic) => WorkerReply::Error {
                                id,
                                error: format!("Task panicked: {}", panic_message(panic.as_ref())),
                            },
                        }
                    }
                    .boxed(),
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Reply a caller is waiting on
pub(crate) enum PendingReply {
    Channel(oneshot::Receiver<Result<Payload, String>>),
    Inline(BoxFuture<'static, WorkerReply>),
}

impl PendingReply {
    pub(crate) async fn settle(self) -> Result<Payload, TaskError> {
        let outcome = match self {
            PendingReply::Channel(rx) => rx.await.map_err(|_| TaskError::Terminated)?,
            PendingReply::Inline(running) => running.await.into_outcome(),
        };

        outcome.map_err(TaskError::Failed)
    }
}

/// Worker thread plus the listener that routes its replies
///
/// Both threads are detached. They exit once the inbox is closed and the
/// work already running on the worker returns.
struct WorkerThread {
    index: usize,
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    callbacks: Callbacks,
}

impl WorkerThread {
    fn spawn(index: usize, core: Option<core_affinity::CoreId>) -> Result<Self, TaskError> {
        let (inbox, mut messages) = mpsc::unbounded::<WorkerMessage>();
        let (reply_tx, reply_rx) = channel::unbounded::<WorkerReply>();
        let callbacks: Callbacks = Arc::new(Mutex::new(HashMap::new()));

        thread::Builder::new()
            .name(format!("meshpipe-worker-{}", index))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        log::warn!("Could not pin execution context {} to core {}", index, core.id);
                    }
                }

                let mut pool = LocalPool::new();
                let spawner = pool.spawner();
                let mut state = ContextCore::default();

                pool.run_until(async move {
                    while let Some(message) = messages.next().await {
                        let Some(running) = state.handle(message) else {
                            continue;
                        };

                        let reply_tx = reply_tx.clone();
                        let spawned = spawner.spawn_local(async move {
                            // Listener gone means the context is being torn down
                            let _ = reply_tx.send(running.await);
                        });
                        if spawned.is_err() {
                            break;
                        }
                    }
                });

                log::info!("Execution context {} exiting", index);
            })
            .map_err(|e| TaskError::Spawn(e.to_string()))?;

        let routes = Arc::clone(&callbacks);
        thread::Builder::new()
            .name(format!("meshpipe-listener-{}", index))
            .spawn(move || {
                for reply in reply_rx.iter() {
                    let id = reply.id();
                    match routes.lock().remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(reply.into_outcome());
                        }
                        None => log::debug!("Dropping reply for released request {}", id),
                    }
                }
            })
            .map_err(|e| TaskError::Spawn(e.to_string()))?;

        log::info!("Spawned execution context {}", index);

        Ok(Self {
            index,
            inbox,
            callbacks,
        })
    }

    fn post(&self, message: WorkerMessage) -> Result<(), TaskError> {
        self.inbox.unbounded_send(message).map_err(|_| TaskError::Terminated)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.inbox.close_channel();

        // Dropping the senders settles every waiting caller with `Terminated`
        let pending = {
            let mut callbacks = self.callbacks.lock();
            let pending = callbacks.len();
            callbacks.clear();
            pending
        };

        log::debug!(
            "Terminated execution context {} with {} pending requests",
            self.index,
            pending
        );
    }
}

/// Inline context state, driven by whoever polls the reply
///
/// Messages are handled when the reply future first runs, never while the
/// pool is locked. `init` messages queue up until the next `run`.
#[derive(Default)]
struct InlineCore {
    core: Mutex<ContextCore>,
    queued: Mutex<VecDeque<WorkerMessage>>,
}

impl InlineCore {
    fn post(&self, message: WorkerMessage) {
        self.queued.lock().push_back(message);
    }

    fn next_queued(&self) -> Option<WorkerMessage> {
        self.queued.lock().pop_front()
    }

    fn run(self: Arc<Self>, id: RequestId, message: WorkerMessage) -> BoxFuture<'static, WorkerReply> {
        async move {
            let running = {
                let mut core = self.core.lock();
                while let Some(queued) = self.next_queued() {
                    core.handle(queued);
                }
                core.handle(message)
            };

            match running {
                Some(running) => running.await,
                None => WorkerReply::Error {
                    id,
                    error: "Inline execution context produced no reply".to_string(),
                },
            }
        }
        .boxed()
    }
}

enum Transport {
    Thread(WorkerThread),
    Inline(Arc<InlineCore>),
}

/// One execution context with its load bookkeeping
pub(crate) struct ExecutionContext {
    id: usize,
    load: f64,
    costs: HashMap<RequestId, f64>,
    initialized: HashSet<String>,
    transport: Transport,
}

impl ExecutionContext {
    pub(crate) fn spawn_thread(id: usize, core: Option<core_affinity::CoreId>) -> Result<Self, TaskError> {
        Ok(Self::with_transport(id, Transport::Thread(WorkerThread::spawn(id, core)?)))
    }

    pub(crate) fn inline(id: usize) -> Self {
        log::info!("Created inline execution context {}", id);
        Self::with_transport(id, Transport::Inline(Arc::default()))
    }

    fn with_transport(id: usize, transport: Transport) -> Self {
        Self {
            id,
            load: 0.0,
            costs: HashMap::new(),
            initialized: HashSet::new(),
            transport,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn load(&self) -> f64 {
        self.load
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.costs.len()
    }

    pub(crate) fn is_threaded(&self) -> bool {
        matches!(self.transport, Transport::Thread(_))
    }

    /// Send `init` for a task type this context has not seen yet
    pub(crate) fn init(
        &mut self,
        task: &str,
        handler: Arc<dyn ErasedTask>,
        dependencies: ErasedShared,
    ) -> Result<(), TaskError> {
        if !self.initialized.insert(task.to_owned()) {
            return Ok(());
        }

        let message = WorkerMessage::Init {
            task: task.to_owned(),
            handler,
            dependencies,
        };

        match &mut self.transport {
            Transport::Thread(worker) => worker.post(message),
            Transport::Inline(core) => {
                core.post(message);
                Ok(())
            }
        }
    }

    /// Reserve `cost` for request `id` and send the `run` message
    pub(crate) fn run(
        &mut self,
        task: &str,
        id: RequestId,
        config: Payload,
        cost: f64,
    ) -> Result<PendingReply, TaskError> {
        if !self.initialized.contains(task) {
            return Err(TaskError::NotInitialized {
                task: task.to_owned(),
                context: self.id,
            });
        }

        let message = WorkerMessage::Run {
            task: task.to_owned(),
            id,
            config,
        };

        let pending = match &mut self.transport {
            Transport::Thread(worker) => {
                let (tx, rx) = oneshot::channel();
                worker.callbacks.lock().insert(id, tx);
                if let Err(e) = worker.post(message) {
                    worker.callbacks.lock().remove(&id);
                    return Err(e);
                }
                PendingReply::Channel(rx)
            }
            Transport::Inline(core) => PendingReply::Inline(Arc::clone(core).run(id, message)),
        };

        self.costs.insert(id, cost);
        self.load += cost;
        Ok(pending)
    }

    /// Drop the bookkeeping for a settled request
    pub(crate) fn release(&mut self, id: RequestId) {
        if let Some(cost) = self.costs.remove(&id) {
            self.load -= cost;
        }
        if let Transport::Thread(worker) = &self.transport {
            worker.callbacks.lock().remove(&id);
        }
    }
}
