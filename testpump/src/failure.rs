//! Captured failures of asynchronous computations.
//!
//! A computation can fail in two ways: its future resolves to an error, or
//! it panics while being polled. Both are turned into a [`Failure`], which
//! is cheap to clone so that an adapter can hand out the same failure every
//! time its result is requested.
//!
//! Panic payloads only carry a message. To keep the original diagnostic
//! context we install a panic hook (`init_panic_hook`) which, while armed on
//! the current thread, records where the panic happened. The pump arms the
//! hook for the duration of a drive and `Failure::from_panic` picks the
//! recorded location up. Unwinds started with `resume_unwind` (thread aborts,
//! re-raised failures) do not run the hook and are never recorded.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::error::Error as StdError;
use std::fmt;
use std::panic;
use std::sync::{Arc, Once};

type BoxError = Box<dyn StdError + Send + Sync>;

/// The failure of a computation, preserved so it can be re-raised.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureKind>,
}

enum FailureKind {
    Error(BoxError),
    Panic {
        message: String,
        location: Option<String>,
    },
}

impl Failure {
    pub fn from_error<E: Into<BoxError>>(err: E) -> Self {
        Failure {
            inner: Arc::new(FailureKind::Error(err.into())),
        }
    }

    /// Converts a payload obtained from `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        // A failure re-raised through `resume` comes back as itself.
        let payload = match payload.downcast::<Failure>() {
            Ok(failure) => return *failure,
            Err(payload) => payload,
        };
        let location = LAST_PANIC_LOCATION.with(|l| l.borrow_mut().take());
        Failure {
            inner: Arc::new(FailureKind::Panic {
                message: panic_message(payload.as_ref()),
                location,
            }),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(*self.inner, FailureKind::Panic { .. })
    }

    /// The panic location, when the failure is a panic raised while the
    /// hook was armed.
    pub fn location(&self) -> Option<&str> {
        match &*self.inner {
            FailureKind::Panic { location, .. } => location.as_deref(),
            FailureKind::Error(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match &*self.inner {
            FailureKind::Error(err) => err.to_string(),
            FailureKind::Panic { message, .. } => message.clone(),
        }
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match &*self.inner {
            FailureKind::Error(err) => err.downcast_ref::<E>(),
            FailureKind::Panic { .. } => None,
        }
    }

    /// Whether both handles refer to the same captured failure.
    pub fn ptr_eq(a: &Failure, b: &Failure) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Re-raises the failure as a panic on the current thread.
    pub fn resume(&self) -> ! {
        panic::resume_unwind(Box::new(self.clone()))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Error(err) => write!(f, "{}", err),
            FailureKind::Panic {
                message,
                location: Some(location),
            } => write!(f, "{} (panicked at {})", message, location),
            FailureKind::Panic { message, .. } => f.write_str(message),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Error(err) => f.debug_tuple("Failure::Error").field(err).finish(),
            FailureKind::Panic { message, location } => f
                .debug_struct("Failure::Panic")
                .field("message", message)
                .field("location", location)
                .finish(),
        }
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &*self.inner {
            FailureKind::Error(err) => Some(err.as_ref()),
            FailureKind::Panic { .. } => None,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(f) = payload.downcast_ref::<Failure>() {
        f.to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}

thread_local! {
    static HOOK_ARMED: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Restores the previous arming state of the hook when dropped.
#[derive(Debug)]
pub(crate) struct PanicHookGuard {
    was_armed: bool,
}

impl Drop for PanicHookGuard {
    fn drop(&mut self) {
        HOOK_ARMED.with(|armed| armed.set(self.was_armed));
        if !self.was_armed {
            LAST_PANIC_LOCATION.with(|l| l.borrow_mut().take());
        }
    }
}

/// Installs the location-recording hook (once per process) and arms it on
/// the current thread.
#[must_use = "the panic hook is disarmed when the returned guard is dropped"]
pub(crate) fn init_panic_hook() -> PanicHookGuard {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let original_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            if HOOK_ARMED.with(Cell::get) {
                let location = panic_info.location().map(|l| l.to_string());
                LAST_PANIC_LOCATION.with(|l| *l.borrow_mut() = location);
            }
            original_hook(panic_info);
        }));
    });

    let was_armed = HOOK_ARMED.with(|armed| armed.replace(true));
    PanicHookGuard { was_armed }
}
