//! Task definitions and the type-erased registry entries

use crate::error::TaskError;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::Arc;

/// Future returned by [`Task::run`]
pub type TaskFuture<T> = BoxFuture<'static, Result<T, TaskError>>;

/// A unit of work that execution contexts can host
///
/// `init` runs once per execution context and produces the private scope that
/// every later `run` in that context receives.
pub trait Task: Send + Sync + 'static {
    type Dependencies: Send + Sync + 'static;
    type Scope: Send + Sync + 'static;
    type Config: Send + 'static;
    type Output: Send + 'static;

    fn init(&self, dependencies: &Self::Dependencies) -> Self::Scope;

    fn run(&self, scope: Arc<Self::Scope>, config: Self::Config) -> TaskFuture<Self::Output>;
}

/// Dependency list handed to `init`, either known or still being computed
pub enum Dependencies<D> {
    Ready(D),
    Pending(BoxFuture<'static, D>),
}

impl<D: Send + Sync + 'static> Dependencies<D> {
    pub fn ready(value: D) -> Self {
        Dependencies::Ready(value)
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = D> + Send + 'static,
    {
        Dependencies::Pending(future.boxed())
    }

    pub(crate) fn into_shared(self) -> SharedDependencies {
        let future = match self {
            Dependencies::Ready(value) => future::ready(value).boxed(),
            Dependencies::Pending(future) => future,
        };

        future
            .map(|value| Arc::new(value) as ErasedShared)
            .boxed()
            .shared()
    }
}

impl<D: Default> Default for Dependencies<D> {
    fn default() -> Self {
        Dependencies::Ready(D::default())
    }
}

pub(crate) type Payload = Box<dyn Any + Send>;
pub(crate) type ErasedShared = Arc<dyn Any + Send + Sync>;
pub(crate) type SharedDependencies = Shared<BoxFuture<'static, ErasedShared>>;

/// Registry entry with the task's associated types erased
pub(crate) trait ErasedTask: Send + Sync {
    fn config_type(&self) -> TypeId;
    fn output_type(&self) -> TypeId;
    fn init(&self, dependencies: &ErasedShared) -> Result<ErasedShared, TaskError>;
    fn run(&self, scope: ErasedShared, config: Payload) -> BoxFuture<'static, Result<Payload, TaskError>>;
}

pub(crate) struct TypedTask<T> {
    task_type: String,
    task: T,
}

impl<T: Task> TypedTask<T> {
    pub(crate) fn new(task_type: &str, task: T) -> Self {
        Self {
            task_type: task_type.to_owned(),
            task,
        }
    }

    fn mismatch(&self) -> TaskError {
        TaskError::PayloadMismatch(self.task_type.clone())
    }
}

impl<T: Task> ErasedTask for TypedTask<T> {
    fn config_type(&self) -> TypeId {
        TypeId::of::<T::Config>()
    }

    fn output_type(&self) -> TypeId {
        TypeId::of::<T::Output>()
    }

    fn init(&self, dependencies: &ErasedShared) -> Result<ErasedShared, TaskError> {
        let dependencies = dependencies
            .downcast_ref::<T::Dependencies>()
            .ok_or_else(|| self.mismatch())?;

        Ok(Arc::new(self.task.init(dependencies)))
    }

    fn run(&self, scope: ErasedShared, config: Payload) -> BoxFuture<'static, Result<Payload, TaskError>> {
        let scope = match scope.downcast::<T::Scope>() {
            Ok(scope) => scope,
            Err(_) => return future::ready(Err(self.mismatch())).boxed(),
        };
        let config = match config.downcast::<T::Config>() {
            Ok(config) => *config,
            Err(_) => return future::ready(Err(self.mismatch())).boxed(),
        };

        self.task
            .run(scope, config)
            .map(|result| result.map(|output| Box::new(output) as Payload))
            .boxed()
    }
}
