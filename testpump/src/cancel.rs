//! Graceful and forced cancellation of running test code.
//!
//! Cancellation has two levels. A *stop* request is advisory: the pump and
//! cooperative user code notice it at their next checkpoint, finish what
//! they are doing and report [`Completion::Stopped`]. An *abort* request
//! additionally asks a [`ThreadTerminator`] to tear the thread that drives
//! the test down. Both are recorded in a [`StatusCell`] whose state only
//! ever moves forward: `Running → StopRequested → AbortRequested`.
//!
//! Rust offers no way to kill a thread from the outside. The default
//! terminator, [`UnwindTerminator`], marks the target's [`ThreadSlot`] as
//! aborted and wakes its pump; the target then unwinds with a
//! [`ThreadAborted`] payload the next time it reaches a suspension point or
//! calls [`checkpoint`]. Destructors run on the way out, which is all the
//! cleanup the pump relies on.
//!
//! [`Completion::Stopped`]: crate::runner::Completion::Stopped

use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{Thread, ThreadId};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pump::PumpContext;

/// Where a test run stands with respect to cancellation.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running = 0,
    /// Finish the current unit of work, then schedule nothing further.
    StopRequested = 1,
    /// Terminate the thread driving the test.
    AbortRequested = 2,
}

impl ExecutionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ExecutionStatus::Running,
            1 => ExecutionStatus::StopRequested,
            _ => ExecutionStatus::AbortRequested,
        }
    }
}

/// Shared, monotonic [`ExecutionStatus`] of one run.
///
/// Cells can be nested with [`StatusCell::child`]: a child reports the most
/// advanced status of itself and its ancestors, and a request made on a
/// child is pushed up to every ancestor.
#[derive(Clone, Default)]
pub struct StatusCell {
    inner: Arc<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    state: AtomicU8,
    parent: Option<StatusCell>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        StatusCell {
            inner: Arc::new(StatusInner {
                state: AtomicU8::new(ExecutionStatus::Running as u8),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn get(&self) -> ExecutionStatus {
        let own = ExecutionStatus::from_u8(self.inner.state.load(Ordering::Acquire));
        if own == ExecutionStatus::AbortRequested {
            return own;
        }
        match &self.inner.parent {
            Some(parent) => {
                let inherited = parent.get();
                if inherited > own {
                    self.inner
                        .state
                        .fetch_max(inherited as u8, Ordering::AcqRel);
                    inherited
                } else {
                    own
                }
            }
            None => own,
        }
    }

    pub fn is_running(&self) -> bool {
        self.get() == ExecutionStatus::Running
    }

    /// Moves to `StopRequested` unless already further along. Returns
    /// whether this call changed the state.
    pub fn request_stop(&self) -> bool {
        self.advance(ExecutionStatus::StopRequested)
    }

    /// Records the intent to abort. This alone terminates nothing; see
    /// [`Canceller::request_abort`].
    pub fn request_abort(&self) -> bool {
        self.advance(ExecutionStatus::AbortRequested)
    }

    fn advance(&self, to: ExecutionStatus) -> bool {
        let prev = self.inner.state.fetch_max(to as u8, Ordering::AcqRel);
        if let Some(parent) = &self.inner.parent {
            parent.advance(to);
        }
        prev < to as u8
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusCell").field(&self.get()).finish()
    }
}

/// Unwind payload used to tear down an aborted thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAborted;

pub(crate) fn is_abort_payload(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<ThreadAborted>()
}

pub(crate) fn unwind_aborted() -> ! {
    panic::resume_unwind(Box::new(ThreadAborted))
}

/// Something that can be woken so it re-examines the cancellation state.
pub(crate) trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

/// A blocking wait that abort compensation may cut short.
pub(crate) trait Resumable: Send + Sync {
    fn resume_aborted(&self);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadPhase {
    /// The slot exists but no thread has attached to it yet.
    Unstarted,
    Running,
    Exited,
}

impl ThreadPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadPhase::Unstarted,
            1 => ThreadPhase::Running,
            _ => ThreadPhase::Exited,
        }
    }
}

/// The cancellation-relevant state of one thread: whether it runs, whether
/// it has been aborted, which pump it drives and what it is blocked on.
pub struct ThreadSlot {
    thread: OnceLock<Thread>,
    phase: AtomicU8,
    aborted: AtomicBool,
    pump: Mutex<Option<Weak<dyn Interruptible>>>,
    blocked_on: Mutex<Option<Arc<dyn Resumable>>>,
    status: Mutex<Option<StatusCell>>,
}

struct CurrentSlot {
    slot: RefCell<Option<Arc<ThreadSlot>>>,
}

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            slot.set_phase(ThreadPhase::Exited);
        }
    }
}

thread_local! {
    static CURRENT_SLOT: CurrentSlot = const {
        CurrentSlot {
            slot: RefCell::new(None),
        }
    };
}

impl ThreadSlot {
    /// A slot for a thread that has not been started yet. The thread binds
    /// itself with [`ThreadSlot::attach`].
    pub fn unstarted() -> Arc<Self> {
        Arc::new(ThreadSlot {
            thread: OnceLock::new(),
            phase: AtomicU8::new(ThreadPhase::Unstarted as u8),
            aborted: AtomicBool::new(false),
            pump: Mutex::new(None),
            blocked_on: Mutex::new(None),
            status: Mutex::new(None),
        })
    }

    /// The slot of the calling thread, created on first use.
    pub fn current() -> Arc<Self> {
        CURRENT_SLOT.with(|current| {
            let mut current = current.slot.borrow_mut();
            if let Some(slot) = current.as_ref() {
                return slot.clone();
            }
            let slot = ThreadSlot::unstarted();
            let _ = slot.thread.set(std::thread::current());
            slot.set_phase(ThreadPhase::Running);
            *current = Some(slot.clone());
            slot
        })
    }

    /// Binds this slot to the calling thread until the guard is dropped,
    /// after which the slot reports [`ThreadPhase::Exited`].
    pub fn attach(self: &Arc<Self>) -> AttachGuard {
        let thread = std::thread::current();
        if self.thread.set(thread.clone()).is_err() {
            debug_assert_eq!(self.thread_id(), Some(thread.id()));
        }
        self.set_phase(ThreadPhase::Running);
        let previous = CURRENT_SLOT.with(|c| c.slot.borrow_mut().replace(self.clone()));
        debug!("attached {:?} to {:?}", thread.name(), thread.id());
        AttachGuard {
            slot: self.clone(),
            previous,
        }
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.get().map(Thread::id)
    }

    pub fn phase(&self) -> ThreadPhase {
        ThreadPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Whether the thread is blocked waiting for another thread's pump.
    pub fn is_suspended(&self) -> bool {
        lock(&self.blocked_on).is_some()
    }

    /// Cuts a blocked wait short. Returns `false` if the thread was not
    /// blocked.
    pub fn resume(&self) -> bool {
        let blocked = lock(&self.blocked_on).take();
        match blocked {
            Some(wait) => {
                wait.resume_aborted();
                true
            }
            None => false,
        }
    }

    fn set_phase(&self, phase: ThreadPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Wakes whatever the thread is waiting in so it notices a new state.
    pub(crate) fn interrupt(&self) {
        let pump = lock(&self.pump).as_ref().and_then(Weak::upgrade);
        if let Some(pump) = pump {
            pump.interrupt();
        }
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    pub(crate) fn set_pump(&self, pump: Option<Weak<dyn Interruptible>>) -> Option<Weak<dyn Interruptible>> {
        std::mem::replace(&mut *lock(&self.pump), pump)
    }

    pub(crate) fn set_blocked_on(&self, wait: Option<Arc<dyn Resumable>>) {
        *lock(&self.blocked_on) = wait;
    }

    /// The status of the run this thread executes, if one was bound.
    pub fn status(&self) -> Option<StatusCell> {
        lock(&self.status).clone()
    }

    /// Binds the run whose stop requests [`checkpoint`] reports while no
    /// pump is driving on this thread.
    pub fn set_status(&self, status: StatusCell) {
        *lock(&self.status) = Some(status);
    }
}

impl fmt::Debug for ThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSlot")
            .field("thread", &self.thread_id())
            .field("phase", &self.phase())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

// Nothing is ever left half-updated under these locks.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[must_use = "the slot is detached as soon as the guard is dropped"]
pub struct AttachGuard {
    slot: Arc<ThreadSlot>,
    previous: Option<Arc<ThreadSlot>>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.slot.set_phase(ThreadPhase::Exited);
        let previous = self.previous.take();
        // The thread-local may already be gone if we are dropped during
        // thread teardown.
        let _ = CURRENT_SLOT.try_with(|c| *c.slot.borrow_mut() = previous);
        trace!("detached {:?}", self.slot.thread_id());
    }
}

/// Failure modes of a forced termination.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminateError {
    #[error("target thread has not started")]
    NotStarted,
    #[error("target thread has already exited")]
    AlreadyExited,
    /// The target is blocked in a wait the terminator cannot reach.
    #[error("target thread is suspended")]
    Suspended,
    #[error("termination failed: {0}")]
    Other(String),
}

impl TerminateError {
    /// Only a suspended target is compensated (by resuming it and trying
    /// again); every other failure abandons the termination.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TerminateError::Suspended)
    }
}

/// The platform primitive that forcibly terminates a specific thread.
pub trait ThreadTerminator: Send + Sync {
    fn terminate(&self, target: &ThreadSlot) -> Result<(), TerminateError>;
}

/// Terminates a thread by making it unwind at its next suspension point.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindTerminator;

impl ThreadTerminator for UnwindTerminator {
    fn terminate(&self, target: &ThreadSlot) -> Result<(), TerminateError> {
        match target.phase() {
            ThreadPhase::Unstarted => Err(TerminateError::NotStarted),
            ThreadPhase::Exited => Err(TerminateError::AlreadyExited),
            ThreadPhase::Running => {
                if target.is_suspended() {
                    return Err(TerminateError::Suspended);
                }
                target.mark_aborted();
                target.interrupt();
                Ok(())
            }
        }
    }
}

/// How a forced abort went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReport {
    Terminated,
    /// The first attempt failed recoverably; the target was resumed and the
    /// second attempt succeeded.
    Compensated,
    /// The termination was given up. The status still reads
    /// `AbortRequested`.
    Abandoned(TerminateError),
}

/// Issues stop and abort requests against one run and the thread driving
/// it.
#[derive(Clone)]
pub struct Canceller {
    status: StatusCell,
    target: Arc<ThreadSlot>,
    terminator: Arc<dyn ThreadTerminator>,
}

impl Canceller {
    pub fn new(status: StatusCell, target: Arc<ThreadSlot>) -> Self {
        Canceller {
            status,
            target,
            terminator: Arc::new(UnwindTerminator),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn ThreadTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    pub fn target(&self) -> &Arc<ThreadSlot> {
        &self.target
    }

    /// Requests a graceful stop and wakes the target so it notices.
    pub fn request_stop(&self) -> bool {
        let changed = self.status.request_stop();
        self.target.interrupt();
        changed
    }

    /// Requests a forced abort. Termination failures are handled here and
    /// reported, never raised.
    pub fn request_abort(&self) -> AbortReport {
        self.status.request_abort();
        debug!("aborting {:?}", self.target);

        let err = match self.terminator.terminate(&self.target) {
            Ok(()) => return AbortReport::Terminated,
            Err(err) => err,
        };
        if !err.is_recoverable() {
            warn!("abandoning abort of {:?}: {}", self.target, err);
            return AbortReport::Abandoned(err);
        }

        debug!("target {:?} is {}; resuming it", self.target, err);
        self.target.resume();
        match self.terminator.terminate(&self.target) {
            Ok(()) => AbortReport::Compensated,
            Err(err) => {
                warn!("abandoning abort of {:?} after resume: {}", self.target, err);
                AbortReport::Abandoned(err)
            }
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("status", &self.status)
            .field("target", &self.target)
            .finish()
    }
}

/// Returned by [`checkpoint`] when a stop has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution was stopped")
    }
}

impl std::error::Error for Stopped {}

/// A cooperative cancellation point for long-running test code.
///
/// Unwinds if the calling thread has been aborted; returns `Err(Stopped)` if
/// the run driving this thread has been asked to stop (or abort). Outside a
/// pump drive the run bound to the thread's [`ThreadSlot`] is consulted.
pub fn checkpoint() -> Result<(), Stopped> {
    let slot = ThreadSlot::current();
    if slot.is_aborted() {
        unwind_aborted();
    }
    let status = match PumpContext::current() {
        Some(pump) => Some(pump.status().clone()),
        None => slot.status(),
    };
    match status {
        Some(status) if !status.is_running() => Err(Stopped),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_never_moves_backwards() {
        let status = StatusCell::new();
        assert!(status.request_abort());
        assert!(!status.request_stop());
        assert_eq!(status.get(), ExecutionStatus::AbortRequested);
    }

    #[test]
    fn child_inherits_and_propagates() {
        let root = StatusCell::new();
        let child = root.child();
        let grandchild = child.child();

        root.request_stop();
        assert_eq!(grandchild.get(), ExecutionStatus::StopRequested);

        grandchild.request_abort();
        assert_eq!(root.get(), ExecutionStatus::AbortRequested);
        assert_eq!(child.get(), ExecutionStatus::AbortRequested);
    }

    #[test]
    fn unstarted_and_exited_targets_are_abandoned() {
        let status = StatusCell::new();
        let slot = ThreadSlot::unstarted();
        let canceller = Canceller::new(status.clone(), slot.clone());
        assert_eq!(
            canceller.request_abort(),
            AbortReport::Abandoned(TerminateError::NotStarted)
        );
        assert_eq!(status.get(), ExecutionStatus::AbortRequested);

        let s = slot.clone();
        std::thread::spawn(move || {
            let _attached = s.attach();
        })
        .join()
        .unwrap();
        assert_eq!(slot.phase(), ThreadPhase::Exited);
        assert_eq!(
            canceller.request_abort(),
            AbortReport::Abandoned(TerminateError::AlreadyExited)
        );
        assert!(!slot.is_aborted());
    }

    struct FlagWait(AtomicBool);

    impl Resumable for FlagWait {
        fn resume_aborted(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn suspended_target_is_resumed_then_terminated() {
        // Runs on its own thread: the slot stays aborted afterwards.
        std::thread::spawn(|| {
            let slot = ThreadSlot::current();
            let wait = Arc::new(FlagWait(AtomicBool::new(false)));
            slot.set_blocked_on(Some(wait.clone()));

            let canceller = Canceller::new(StatusCell::new(), slot.clone());
            assert_eq!(canceller.request_abort(), AbortReport::Compensated);
            assert!(wait.0.load(Ordering::SeqCst));
            assert!(slot.is_aborted());
            assert!(!slot.is_suspended());

            let result = panic::catch_unwind(checkpoint);
            assert!(is_abort_payload(result.unwrap_err().as_ref()));
        })
        .join()
        .unwrap();
    }

    struct AlwaysSuspended;

    impl ThreadTerminator for AlwaysSuspended {
        fn terminate(&self, _target: &ThreadSlot) -> Result<(), TerminateError> {
            Err(TerminateError::Suspended)
        }
    }

    #[test]
    fn checkpoint_sees_the_bound_run_without_a_pump() {
        std::thread::spawn(|| {
            assert_eq!(checkpoint(), Ok(()));
            let status = StatusCell::new();
            ThreadSlot::current().set_status(status.clone());
            assert_eq!(checkpoint(), Ok(()));
            status.request_stop();
            assert_eq!(checkpoint(), Err(Stopped));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn failed_retry_is_abandoned() {
        let slot = ThreadSlot::unstarted();
        let canceller =
            Canceller::new(StatusCell::new(), slot).with_terminator(Arc::new(AlwaysSuspended));
        assert_eq!(
            canceller.request_abort(),
            AbortReport::Abandoned(TerminateError::Suspended)
        );
    }
}
