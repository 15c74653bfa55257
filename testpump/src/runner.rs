//! Blocking entry points: awaiting a value on the calling thread, and
//! running a whole test body on its own thread under a timeout.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::awaiter::{AwaitAdapter, Task};
use crate::cancel::{self, AbortReport, Canceller, StatusCell, ThreadSlot};
use crate::error::{Error, Result};
use crate::failure::{self, Failure};
use crate::pump::{DriveOutcome, PumpContext, PumpStats};
use crate::sequence::{self, SyncSequence};
use crate::shape;
use crate::value::{value, AnyValue, Value};
use crate::Config;

/// How a drive of one awaitable ended.
#[derive(Clone, Debug)]
pub enum Completion {
    /// The computation ran to completion, successfully or not.
    Finished(std::result::Result<Value, Failure>),
    Stopped,
    Aborted,
}

/// Drives awaitables to completion on the calling thread.
///
/// Every drive gets a fresh [`PumpContext`] owned by the calling thread.
/// Its status is a child of the executor's status, or of the enclosing
/// drive's status when drives are nested, so a stop or abort requested on
/// either side is seen by both.
#[derive(Clone, Debug)]
pub struct Executor {
    config: Config,
    status: StatusCell,
    stats: Arc<Mutex<PumpStats>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self::with_status(config, StatusCell::new())
    }

    pub fn with_status(config: Config, status: StatusCell) -> Self {
        Executor {
            config,
            status,
            stats: Arc::new(Mutex::new(PumpStats::default())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    /// Pump counters accumulated over every drive of this executor.
    pub fn stats(&self) -> PumpStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Awaits `val`, which must be awaitable.
    pub fn await_value(&self, val: AnyValue) -> Result<Completion> {
        let type_name = val.type_name();
        self.try_await(Some(val))?
            .ok_or(Error::NotAwaitable { type_name })
    }

    /// Awaits `val` if it is awaitable; returns `Ok(None)` otherwise.
    pub fn try_await(&self, val: Option<AnyValue>) -> Result<Option<Completion>> {
        let val = match val {
            Some(val) if shape::is_awaitable(val.type_key()) => val,
            _ => return Ok(None),
        };

        let ctx = PumpContext::new(self.drive_status(), self.config.idle_poll());
        let _closed = ctx.close_on_drop();
        let _installed = ctx.install();

        // Created after installing so the task's wake-ups reach this pump.
        let adapter = match AwaitAdapter::from_value(val) {
            Ok(adapter) => adapter,
            Err(_) => return Ok(None),
        };
        let completion = Self::drive(&ctx, adapter);
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .add(&ctx.stats());
        completion.map(Some)
    }

    /// Runs `fut` to completion on the calling thread and returns its
    /// output.
    pub fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Any + Send + Sync + Clone,
    {
        match self.await_value(AnyValue::new(Task::new(fut)))? {
            Completion::Finished(Ok(val)) => val
                .downcast::<T>()
                .map(|val| Arc::try_unwrap(val).unwrap_or_else(|shared| (*shared).clone()))
                .map_err(|_| Error::Failed(Failure::from_error("task produced an unexpected type"))),
            Completion::Finished(Err(failure)) => Err(Error::Failed(failure)),
            Completion::Stopped => Err(Error::Stopped),
            Completion::Aborted => Err(Error::Aborted),
        }
    }

    /// See [`sequence::adapt_to_sync`]. Elements are driven by this
    /// executor.
    pub fn adapt_to_sync(&self, source: Option<AnyValue>, role: &str) -> Result<Option<SyncSequence>> {
        sequence::adapt_with(self.clone(), source, role)
    }

    pub(crate) fn drive_status(&self) -> StatusCell {
        match PumpContext::current() {
            Some(outer) => outer.status().child(),
            None => self.status.child(),
        }
    }

    fn drive(ctx: &PumpContext, mut adapter: AwaitAdapter) -> Result<Completion> {
        let waker = ctx.clone();
        adapter.on_completed(move || waker.wake());

        let completion = match ctx.run_until(|| adapter.is_completed())? {
            DriveOutcome::Completed => Completion::Finished(adapter.get_result()),
            DriveOutcome::Stopped => Completion::Stopped,
            DriveOutcome::Aborted => Completion::Aborted,
        };
        Ok(completion)
    }
}

/// Runs `fut` on the calling thread with a default executor.
pub fn block_on<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Any + Send + Sync + Clone,
{
    Executor::default().block_on(fut)
}

/// The verdict on one test run.
#[derive(Clone, Debug)]
pub enum TestOutcome {
    Passed(Value),
    Failed(Failure),
    /// Stopped or aborted on request.
    Cancelled,
    TimedOut { timeout: Duration },
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestOutcome::Passed(_))
    }

    /// The result message, for every outcome but a pass.
    pub fn message(&self) -> Option<String> {
        match self {
            TestOutcome::Passed(_) => None,
            TestOutcome::Failed(failure) => Some(failure.to_string()),
            TestOutcome::Cancelled => Some("Cancelled by user".to_string()),
            TestOutcome::TimedOut { timeout } => Some(format!(
                "Test exceeded Timeout value of {}ms",
                timeout.as_millis()
            )),
        }
    }

    /// Returns the test's value, panicking with the result message if the
    /// test did not pass.
    pub fn assert_passed(self) -> Value {
        match self {
            TestOutcome::Passed(val) => val,
            other => panic!("{}", other),
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            None => write!(f, "Passed"),
            Some(message) => f.write_str(&message),
        }
    }
}

/// Cancels a running test from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    canceller: Canceller,
}

impl CancelHandle {
    /// Requests a graceful stop, or a forced abort when `force` is set.
    pub fn cancel(&self, force: bool) {
        if force {
            let report = self.canceller.request_abort();
            if report != AbortReport::Terminated {
                debug!("forced cancel: {:?}", report);
            }
        } else {
            self.canceller.request_stop();
        }
    }
}

/// A test running on its own thread.
pub struct TestHandle {
    name: String,
    results: Receiver<Completion>,
    thread: Option<JoinHandle<()>>,
    cancel: CancelHandle,
    timeout: Option<Duration>,
    abort_grace: Duration,
}

impl TestHandle {
    pub fn cancel(&self, force: bool) {
        info!("cancelling {} (force = {})", self.name, force);
        self.cancel.cancel(force);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the test to finish, aborting it once the configured
    /// timeout elapses.
    pub fn wait(mut self) -> TestOutcome {
        let received = match self.timeout {
            Some(timeout) => self.results.recv_timeout(timeout),
            None => self
                .results
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(completion) => {
                self.join();
                match completion {
                    Completion::Finished(Ok(val)) => TestOutcome::Passed(val),
                    Completion::Finished(Err(failure)) => TestOutcome::Failed(failure),
                    Completion::Stopped | Completion::Aborted => TestOutcome::Cancelled,
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout = self.timeout.unwrap_or_default();
                warn!("{} exceeded its timeout of {}ms", self.name, timeout.as_millis());
                let report = self.cancel.canceller.request_abort();
                debug!("abort of {}: {:?}", self.name, report);

                match self.results.recv_timeout(self.abort_grace) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => self.join(),
                    Err(RecvTimeoutError::Timeout) => warn!(
                        "{} did not unwind within {}ms, detaching it",
                        self.name,
                        self.abort_grace.as_millis()
                    ),
                }
                TestOutcome::TimedOut { timeout }
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                TestOutcome::Failed(Failure::from_error(
                    "test thread exited without reporting an outcome",
                ))
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for TestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHandle")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Starts `body` on a dedicated thread. If it returns an awaitable value
/// the thread drives it to completion.
pub fn spawn_test<F>(config: Config, body: F) -> Result<TestHandle>
where
    F: FnOnce() -> Option<AnyValue> + Send + 'static,
{
    let status = StatusCell::new();
    let slot = ThreadSlot::unstarted();
    slot.set_status(status.clone());
    let canceller = Canceller::new(status.clone(), slot.clone());
    let (tx, results) = mpsc::channel();

    let name = config.thread_name().to_string();
    let timeout = config.timeout();
    let abort_grace = config.abort_grace();

    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(size) = config.stack_size() {
        builder = builder.stack_size(size);
    }
    let worker = builder.spawn(move || {
        let _attached = slot.attach();
        let _hook = failure::init_panic_hook();
        let executor = Executor::with_status(config, status);

        let completion = match panic::catch_unwind(AssertUnwindSafe(|| executor.try_await(body()))) {
            Ok(Ok(Some(completion))) => completion,
            // A synchronous body that returned after noticing a stop.
            Ok(Ok(None)) if !executor.status().is_running() => Completion::Stopped,
            Ok(Ok(None)) => Completion::Finished(Ok(value(()))),
            Ok(Err(err)) => Completion::Finished(Err(Failure::from_error(err))),
            Err(payload) if cancel::is_abort_payload(payload.as_ref()) => Completion::Aborted,
            Err(payload) => Completion::Finished(Err(Failure::from_panic(payload))),
        };
        debug!("{:?} finished: {:?}", thread::current().name(), completion);
        let _ = tx.send(completion);
    })?;

    Ok(TestHandle {
        name,
        results,
        thread: Some(worker),
        cancel: CancelHandle { canceller },
        timeout,
        abort_grace,
    })
}

/// Runs `body` to an outcome; see [`spawn_test`].
pub fn run_test<F>(config: Config, body: F) -> TestOutcome
where
    F: FnOnce() -> Option<AnyValue> + Send + 'static,
{
    match spawn_test(config, body) {
        Ok(handle) => handle.wait(),
        Err(err) => TestOutcome::Failed(Failure::from_error(err)),
    }
}
