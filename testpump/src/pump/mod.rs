//! A thread-affine work queue that keeps asynchronous test code on one
//! thread.
//!
//! A [`PumpContext`] belongs to the thread that created it. Any thread may
//! [`post`](PumpContext::post) or [`send`](PumpContext::send) work to it,
//! but only the owning thread runs that work, in the order it was enqueued,
//! while it sits in [`run_until`](PumpContext::run_until). Futures driven
//! through the pump register wakers that post their re-polls here, so every
//! continuation of a test's asynchronous call graph runs on the thread the
//! test started on.
//!
//! The queue is a `Mutex<VecDeque>` paired with a `Condvar`: many writers,
//! one reader. The owning thread waits on the condvar only while the queue
//! is empty, and never longer than the configured idle poll so that it
//! re-checks its completion predicate and the cancellation status.

mod signal;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use log::{debug, error, trace};

use crate::cancel::{self, ExecutionStatus, Interruptible, StatusCell, ThreadSlot};
use crate::dispose::{DisposeOnce, ReleaseHandle, ScopedRelease};
use crate::error::{Error, Result};
use crate::failure::{self, Failure};
use signal::{CompletionSignal, SignalOutcome};

/// Pump activity counters.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct PumpStats {
    /// Items enqueued through `post`.
    pub posted: u64,
    /// `send` calls made on the owning thread and run inline.
    pub sent_inline: u64,
    /// `send` calls made from other threads.
    pub sent_queued: u64,
    /// Items run by the drive loop.
    pub executed: u64,
    /// Posted items that panicked with nobody waiting on them.
    pub callback_panics: u64,
}

impl PumpStats {
    pub(crate) fn add(&mut self, rhs: &PumpStats) {
        self.posted += rhs.posted;
        self.sent_inline += rhs.sent_inline;
        self.sent_queued += rhs.sent_queued;
        self.executed += rhs.executed;
        self.callback_panics += rhs.callback_panics;
    }
}

#[derive(Default)]
struct Counters {
    posted: AtomicU64,
    sent_inline: AtomicU64,
    sent_queued: AtomicU64,
    executed: AtomicU64,
    callback_panics: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PumpStats {
        PumpStats {
            posted: self.posted.load(Ordering::Relaxed),
            sent_inline: self.sent_inline.load(Ordering::Relaxed),
            sent_queued: self.sent_queued.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
        }
    }
}

/// Why [`PumpContext::run_until`] returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriveOutcome {
    /// The predicate became true.
    Completed,
    /// A graceful stop was requested.
    Stopped,
    /// An abort was requested but the thread was not torn down.
    Aborted,
}

struct WorkItem {
    run: Box<dyn FnOnce() + Send>,
    signal: Option<Arc<CompletionSignal>>,
}

struct Queue {
    items: VecDeque<WorkItem>,
    /// Set by `wake` so a wake-up that races with the owner going to sleep
    /// is not lost.
    woken: bool,
}

struct Shared {
    owner: ThreadId,
    owner_name: Option<String>,
    queue: Mutex<Queue>,
    ready: Condvar,
    closed: AtomicBool,
    status: StatusCell,
    idle_poll: Duration,
    stats: Counters,
    teardown: ReleaseHandle,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        // Items run outside the lock, so a poisoned queue is still intact.
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wake(&self) {
        self.lock_queue().woken = true;
        self.ready.notify_all();
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<WorkItem> = self.lock_queue().items.drain(..).collect();
        debug!(
            "closing pump of {:?}, discarding {} queued item(s)",
            self.owner_name.as_deref().unwrap_or("<unnamed>"),
            drained.len()
        );
        for item in drained {
            if let Some(signal) = item.signal {
                signal.set(SignalOutcome::Dropped);
            }
        }
        self.ready.notify_all();
    }
}

impl Interruptible for Shared {
    fn interrupt(&self) {
        self.wake();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<PumpContext>> = const { RefCell::new(None) };
}

/// A queue of work bound to the thread that created it.
#[derive(Clone)]
pub struct PumpContext {
    shared: Arc<Shared>,
}

impl PumpContext {
    /// Creates a context owned by the calling thread.
    pub fn new(status: StatusCell, idle_poll: Duration) -> Self {
        let thread = std::thread::current();
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            Shared {
                owner: thread.id(),
                owner_name: thread.name().map(str::to_string),
                queue: Mutex::new(Queue {
                    items: VecDeque::new(),
                    woken: false,
                }),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
                status,
                idle_poll,
                stats: Counters::default(),
                teardown: DisposeOnce::wrap(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.shutdown();
                    }
                }),
            }
        });
        trace!("created pump for {:?}", thread.id());
        PumpContext { shared }
    }

    /// The context installed on the calling thread, if any.
    pub fn current() -> Option<PumpContext> {
        CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
    }

    /// Makes this the calling thread's current context until the guard is
    /// dropped, at which point the previous one is restored.
    pub fn install(&self) -> InstallGuard {
        debug_assert!(self.is_owner(), "a pump can only be installed on its owner");
        let previous = CURRENT.with(|c| c.borrow_mut().replace(self.clone()));
        InstallGuard { previous }
    }

    pub fn owner(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_owner(&self) -> bool {
        std::thread::current().id() == self.shared.owner
    }

    pub fn status(&self) -> &StatusCell {
        &self.shared.status
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of items waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().items.len()
    }

    pub fn stats(&self) -> PumpStats {
        self.shared.stats.snapshot()
    }

    /// Queues `callback(state)` to run on the owning thread and returns
    /// immediately.
    pub fn post<S, F>(&self, callback: F, state: S) -> Result<()>
    where
        F: FnOnce(S) + Send + 'static,
        S: Send + 'static,
    {
        self.enqueue(Box::new(move || callback(state)), None)?;
        Counters::bump(&self.shared.stats.posted);
        Ok(())
    }

    /// Runs `callback(state)` on the owning thread and waits for it.
    ///
    /// On the owning thread the callback runs inline, so a callback may send
    /// to its own pump without deadlocking. From any other thread the call
    /// blocks until the drive loop has run the item.
    pub fn send<S, F>(&self, callback: F, state: S) -> Result<()>
    where
        F: FnOnce(S) + Send + 'static,
        S: Send + 'static,
    {
        if self.is_owner() {
            Counters::bump(&self.shared.stats.sent_inline);
            callback(state);
            return Ok(());
        }

        let signal = CompletionSignal::new();
        self.enqueue(Box::new(move || callback(state)), Some(signal.clone()))?;
        Counters::bump(&self.shared.stats.sent_queued);

        let slot = ThreadSlot::current();
        slot.set_blocked_on(Some(signal.clone()));
        let outcome = signal.wait();
        slot.set_blocked_on(None);

        match outcome {
            SignalOutcome::Ran => Ok(()),
            SignalOutcome::Panicked(failure) => Err(Error::Callback(failure)),
            SignalOutcome::Dropped => Err(Error::Closed),
            SignalOutcome::Interrupted => Err(Error::Aborted),
        }
    }

    /// Wakes the owning thread so it re-checks its predicate.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Tears the context down. Queued `send` callers are released with
    /// [`Error::Closed`]; later `post`/`send` calls fail. Idempotent.
    pub fn close(&self) {
        self.shared.teardown.release();
    }

    /// Returns a guard that closes the context when dropped, including when
    /// the drive unwinds.
    pub fn close_on_drop(&self) -> ScopedRelease {
        self.shared.teardown.scoped()
    }

    /// Runs queued items on the owning thread until `done` returns true or
    /// the run is cancelled.
    ///
    /// The status is checked before every item, so a stop requested while an
    /// item runs takes effect once that item returns. If the thread has been
    /// aborted this unwinds with [`ThreadAborted`](crate::cancel::ThreadAborted).
    pub fn run_until<P>(&self, mut done: P) -> Result<DriveOutcome>
    where
        P: FnMut() -> bool,
    {
        if !self.is_owner() {
            return Err(Error::WrongThread);
        }

        let slot = ThreadSlot::current();
        let _registration = PumpRegistration::new(slot.clone(), &self.shared);
        let _hook = failure::init_panic_hook();

        loop {
            if done() {
                return Ok(DriveOutcome::Completed);
            }
            if slot.is_aborted() {
                debug!("pump of {:?} unwinding after abort", self.shared.owner);
                cancel::unwind_aborted();
            }
            match self.shared.status.get() {
                ExecutionStatus::Running => {}
                ExecutionStatus::StopRequested => {
                    debug!("pump of {:?} stopping", self.shared.owner);
                    return Ok(DriveOutcome::Stopped);
                }
                ExecutionStatus::AbortRequested => return Ok(DriveOutcome::Aborted),
            }
            if let Some(item) = self.next_item() {
                self.execute(item);
            }
        }
    }

    fn enqueue(&self, run: Box<dyn FnOnce() + Send>, signal: Option<Arc<CompletionSignal>>) -> Result<()> {
        let mut queue = self.shared.lock_queue();
        if self.is_closed() {
            return Err(Error::Closed);
        }
        queue.items.push_back(WorkItem { run, signal });
        trace!("queued item, depth now {}", queue.items.len());
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    fn next_item(&self) -> Option<WorkItem> {
        let mut queue = self.shared.lock_queue();
        if let Some(item) = queue.items.pop_front() {
            return Some(item);
        }
        if queue.woken {
            queue.woken = false;
            return None;
        }
        let (mut queue, _timed_out) = self
            .shared
            .ready
            .wait_timeout(queue, self.shared.idle_poll)
            .unwrap_or_else(|p| p.into_inner());
        queue.woken = false;
        queue.items.pop_front()
    }

    fn execute(&self, item: WorkItem) {
        let WorkItem { run, signal } = item;
        let result = panic::catch_unwind(AssertUnwindSafe(run));
        Counters::bump(&self.shared.stats.executed);

        match result {
            Ok(()) => {
                if let Some(signal) = signal {
                    signal.set(SignalOutcome::Ran);
                }
            }
            Err(payload) if cancel::is_abort_payload(payload.as_ref()) => {
                if let Some(signal) = signal {
                    signal.set(SignalOutcome::Interrupted);
                }
                panic::resume_unwind(payload);
            }
            Err(payload) => {
                let failure = Failure::from_panic(payload);
                match signal {
                    Some(signal) => {
                        signal.set(SignalOutcome::Panicked(failure));
                    }
                    None => {
                        Counters::bump(&self.shared.stats.callback_panics);
                        error!("posted callback panicked: {}", failure);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for PumpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpContext")
            .field("owner", &self.shared.owner)
            .field("status", &self.shared.status)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Restores the previously installed context when dropped.
#[must_use = "the context is uninstalled as soon as the guard is dropped"]
pub struct InstallGuard {
    previous: Option<PumpContext>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT.try_with(|c| *c.borrow_mut() = previous);
    }
}

/// Points the thread's slot at the pump being driven, so aborts and stops
/// can wake it.
struct PumpRegistration {
    slot: Arc<ThreadSlot>,
    previous: Option<Weak<dyn Interruptible>>,
}

impl PumpRegistration {
    fn new(slot: Arc<ThreadSlot>, shared: &Arc<Shared>) -> Self {
        let shared: Arc<dyn Interruptible> = shared.clone();
        let previous = slot.set_pump(Some(Arc::downgrade(&shared)));
        PumpRegistration { slot, previous }
    }
}

impl Drop for PumpRegistration {
    fn drop(&mut self) {
        self.slot.set_pump(self.previous.take());
    }
}
