//! A uniform completion protocol over every awaitable shape.
//!
//! [`AwaitAdapter`] wraps a recognised awaitable (see [`crate::shape`]) and
//! exposes `is_completed`, `on_completed` and `get_result` regardless of
//! whether the value is the built-in [`Task`] or a registered structural
//! awaitable.
//!
//! A [`Task`] is driven by the pump that was current when its adapter was
//! created: it is polled once right away (tokio-style, the future starts
//! running immediately) and every wake-up posts a re-poll to that pump, so
//! all of its polls happen on the pump's owning thread.

use std::any::Any;
use std::cell::Cell;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};

use futures::future::{BoxFuture, FutureExt};
use log::trace;
use smallvec::SmallVec;

use crate::cancel;
use crate::dispose::DisposeOnce;
use crate::error::Error;
use crate::failure::Failure;
use crate::pump::PumpContext;
use crate::shape::{Continuation, ErasedAwaiter, ShapeCache, ShapeKind};
use crate::value::{value, AnyValue, Value};

type TaskFuture = BoxFuture<'static, Result<Value, Failure>>;

/// The runtime's built-in awaitable: a boxed future with an erased output.
pub struct Task {
    fut: TaskFuture,
}

impl Task {
    pub fn new<F, T>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Any + Send + Sync,
    {
        Task {
            fut: fut.map(|out| Ok(value(out))).boxed(),
        }
    }

    /// A task whose future reports failure through its output.
    pub fn fallible<F, T, E>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Task {
            fut: fut
                .map(|out| out.map(value).map_err(Failure::from_error))
                .boxed(),
        }
    }

    pub fn ready<T: Any + Send + Sync>(val: T) -> Self {
        Task {
            fut: futures::future::ready(Ok(value(val))).boxed(),
        }
    }

    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let failure = Failure::from_error(err);
        Task {
            fut: futures::future::ready(Err(failure)).boxed(),
        }
    }

    /// Wraps a future that already yields an erased [`Value`], without
    /// boxing the value a second time.
    pub(crate) fn from_value_future<F>(fut: F) -> Self
    where
        F: Future<Output = Value> + Send + 'static,
    {
        Task {
            fut: fut.map(Ok).boxed(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

enum Scheduler {
    Pump(PumpContext),
    /// No pump was installed; wake-ups poll on the waking thread.
    Inline,
}

struct TaskState {
    fut: Option<TaskFuture>,
    outcome: Option<Result<Value, Failure>>,
    continuations: SmallVec<[Continuation; 1]>,
    polling: bool,
    /// An inline wake-up arrived while a poll was in progress.
    repoll: bool,
}

struct TaskCore {
    state: Mutex<TaskState>,
    scheduler: Scheduler,
}

impl TaskCore {
    fn start(task: Task) -> Arc<Self> {
        let scheduler = match PumpContext::current() {
            Some(ctx) => Scheduler::Pump(ctx),
            None => Scheduler::Inline,
        };
        let core = Arc::new(TaskCore {
            state: Mutex::new(TaskState {
                fut: Some(task.fut),
                outcome: None,
                continuations: SmallVec::new(),
                polling: false,
                repoll: false,
            }),
            scheduler,
        });
        // Poll once in advance.
        core.poll();
        core
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn poll(self: &Arc<Self>) {
        let mut fut = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return;
            }
            if state.polling {
                state.repoll = true;
                return;
            }
            match state.fut.take() {
                Some(fut) => {
                    state.polling = true;
                    fut
                }
                None => return,
            }
        };

        let waker = Waker::from(self.clone());
        loop {
            let polled = panic::catch_unwind(AssertUnwindSafe(|| {
                fut.as_mut().poll(&mut Context::from_waker(&waker))
            }));
            match polled {
                Ok(Poll::Pending) => {
                    let mut state = self.lock();
                    if state.repoll {
                        state.repoll = false;
                        continue;
                    }
                    state.fut = Some(fut);
                    state.polling = false;
                    return;
                }
                Ok(Poll::Ready(outcome)) => {
                    drop(fut);
                    self.complete(outcome);
                    return;
                }
                Err(payload) if cancel::is_abort_payload(payload.as_ref()) => {
                    self.lock().polling = false;
                    drop(fut);
                    panic::resume_unwind(payload);
                }
                Err(payload) => {
                    drop(fut);
                    self.complete(Err(Failure::from_panic(payload)));
                    return;
                }
            }
        }
    }

    fn complete(&self, outcome: Result<Value, Failure>) {
        let continuations = {
            let mut state = self.lock();
            state.outcome = Some(outcome);
            state.polling = false;
            std::mem::take(&mut state.continuations)
        };
        trace!("task completed, running {} continuation(s)", continuations.len());
        for continuation in continuations {
            continuation();
        }
    }

    fn is_completed(&self) -> bool {
        self.lock().outcome.is_some()
    }

    fn outcome(&self) -> Option<Result<Value, Failure>> {
        self.lock().outcome.clone()
    }

    fn on_completed(&self, continuation: Continuation) {
        let mut state = self.lock();
        if state.outcome.is_none() {
            state.continuations.push(continuation);
            return;
        }
        drop(state);
        continuation();
    }
}

impl Wake for TaskCore {
    fn wake(self: Arc<Self>) {
        match &self.scheduler {
            Scheduler::Pump(ctx) => {
                let core = self.clone();
                if ctx.post(|core: Arc<TaskCore>| core.poll(), core).is_err() {
                    trace!("pump closed, dropping wake-up");
                }
            }
            Scheduler::Inline => self.poll(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdapterKind {
    BuiltIn,
    Structural,
    /// Created from an already known outcome.
    Completed,
}

enum Source {
    BuiltIn(Arc<TaskCore>),
    Structural(Box<dyn ErasedAwaiter>),
    Completed(Result<Value, Failure>),
}

/// Normalises any recognised awaitable to one completion protocol.
///
/// Once `is_completed` has returned `true` it keeps doing so, and
/// `get_result` returns the same outcome every time without re-running the
/// computation.
pub struct AwaitAdapter {
    source: Source,
    completed: Cell<bool>,
    result: Option<Result<Value, Failure>>,
}

impl AwaitAdapter {
    /// Adapts `val` if it is awaitable. `None` and non-awaitable values
    /// yield `None`.
    pub fn try_create(val: Option<AnyValue>) -> Option<Self> {
        Self::from_value(val?).ok()
    }

    /// Adapts `val`, handing it back if it is not awaitable.
    pub fn from_value(val: AnyValue) -> Result<Self, AnyValue> {
        Self::from_value_in(ShapeCache::global(), val)
    }

    pub fn from_value_in(cache: &ShapeCache, val: AnyValue) -> Result<Self, AnyValue> {
        let shape = match cache.probe(val.type_key()) {
            Some(shape) => shape,
            None => return Err(val),
        };
        let source = match shape.kind() {
            ShapeKind::BuiltIn => Source::BuiltIn(TaskCore::start(val.downcast::<Task>()?)),
            ShapeKind::Structural => Source::Structural(shape.awaiter_of(val)?),
        };
        Ok(AwaitAdapter {
            source,
            completed: Cell::new(false),
            result: None,
        })
    }

    pub fn completed(outcome: Result<Value, Failure>) -> Self {
        AwaitAdapter {
            source: Source::Completed(outcome),
            completed: Cell::new(true),
            result: None,
        }
    }

    pub fn kind(&self) -> AdapterKind {
        match self.source {
            Source::BuiltIn(_) => AdapterKind::BuiltIn,
            Source::Structural(_) => AdapterKind::Structural,
            Source::Completed(_) => AdapterKind::Completed,
        }
    }

    pub fn is_completed(&self) -> bool {
        if self.completed.get() {
            return true;
        }
        let done = match &self.source {
            Source::BuiltIn(core) => core.is_completed(),
            Source::Structural(awaiter) => awaiter.is_completed(),
            Source::Completed(_) => true,
        };
        self.completed.set(done);
        done
    }

    /// Registers `continuation` to run once on completion. It runs inline
    /// if the computation has already completed.
    pub fn on_completed<F>(&mut self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let once = DisposeOnce::wrap(continuation);
        if self.is_completed() {
            once.release();
            return;
        }
        let continuation: Continuation = Box::new(move || {
            once.release();
        });
        match &mut self.source {
            Source::BuiltIn(core) => core.on_completed(continuation),
            Source::Structural(awaiter) => awaiter.on_completed(continuation),
            Source::Completed(_) => continuation(),
        }
    }

    /// The outcome of the computation. Before completion this is a failure
    /// wrapping [`Error::NotCompleted`].
    pub fn get_result(&mut self) -> Result<Value, Failure> {
        if let Some(result) = &self.result {
            return result.clone();
        }
        if !self.is_completed() {
            return Err(Failure::from_error(Error::NotCompleted));
        }
        let result = match &mut self.source {
            Source::BuiltIn(core) => match core.outcome() {
                Some(outcome) => outcome,
                None => return Err(Failure::from_error(Error::NotCompleted)),
            },
            Source::Structural(awaiter) => awaiter.get_result(),
            Source::Completed(outcome) => outcome.clone(),
        };
        self.result = Some(result.clone());
        result
    }
}

impl fmt::Debug for AwaitAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitAdapter")
            .field("kind", &self.kind())
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cancel::StatusCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn non_awaitables_are_rejected() {
        assert!(AwaitAdapter::try_create(None).is_none());
        assert!(AwaitAdapter::try_create(Some(AnyValue::new(5i32))).is_none());
        let back = AwaitAdapter::from_value(AnyValue::new("text")).unwrap_err();
        assert_eq!(back.downcast::<&str>().unwrap(), "text");
    }

    #[test]
    fn ready_task_completes_on_creation() {
        let mut adapter = AwaitAdapter::try_create(Some(AnyValue::new(Task::ready(42u64)))).unwrap();
        assert_eq!(adapter.kind(), AdapterKind::BuiltIn);
        assert!(adapter.is_completed());

        let first = adapter.get_result().unwrap();
        let second = adapter.get_result().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.downcast_ref::<u64>(), Some(&42));
    }

    #[test]
    fn failed_task_returns_the_same_failure() {
        let mut adapter = AwaitAdapter::from_value(AnyValue::new(Task::failed("bad input"))).unwrap();
        let a = adapter.get_result().unwrap_err();
        let b = adapter.get_result().unwrap_err();
        assert!(Failure::ptr_eq(&a, &b));
        assert_eq!(a.message(), "bad input");
    }

    #[test]
    fn get_result_before_completion_is_refused() {
        let (_tx, rx) = futures::channel::oneshot::channel::<u8>();
        let mut adapter = AwaitAdapter::from_value(AnyValue::new(Task::new(rx))).unwrap();
        assert!(!adapter.is_completed());
        let failure = adapter.get_result().unwrap_err();
        assert!(matches!(failure.downcast_ref::<Error>(), Some(Error::NotCompleted)));
    }

    #[test]
    fn panicking_task_becomes_failure() {
        let mut adapter = AwaitAdapter::from_value(AnyValue::new(Task::new(async {
            panic!("inside the future");
        })))
        .unwrap();
        assert!(adapter.is_completed());
        let failure = adapter.get_result().unwrap_err();
        assert!(failure.is_panic());
        assert_eq!(failure.message(), "inside the future");
    }

    #[test]
    fn wakeups_are_polled_on_the_pump() {
        let ctx = PumpContext::new(StatusCell::new(), Duration::from_millis(5));
        let _installed = ctx.install();

        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let owner = std::thread::current().id();
        let task = Task::new(async move {
            let v = rx.await.unwrap_or(0);
            (v, std::thread::current().id())
        });
        let mut adapter = AwaitAdapter::from_value(AnyValue::new(task)).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        adapter.on_completed(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::spawn(move || tx.send(7).unwrap()).join().unwrap();
        ctx.run_until(|| adapter.is_completed()).unwrap();

        let result = adapter.get_result().unwrap();
        let (v, polled_on) = result.downcast_ref::<(u32, std::thread::ThreadId)>().unwrap();
        assert_eq!(*v, 7);
        assert_eq!(*polled_on, owner);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late registrations run inline.
        let f = fired.clone();
        adapter.on_completed(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completed_adapter_short_circuits() {
        let mut adapter = AwaitAdapter::completed(Ok(value("done")));
        assert_eq!(adapter.kind(), AdapterKind::Completed);
        assert!(adapter.is_completed());
        assert_eq!(adapter.get_result().unwrap().downcast_ref::<&str>(), Some(&"done"));
    }
}
