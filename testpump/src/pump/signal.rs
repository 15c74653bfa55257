use std::sync::{Arc, Condvar, Mutex};

use crate::cancel::Resumable;
use crate::failure::Failure;

/// How a queued `send` item ended, as seen by the blocked sender.
#[derive(Clone, Debug)]
pub(crate) enum SignalOutcome {
    Ran,
    Panicked(Failure),
    /// The pump closed before running the item.
    Dropped,
    /// The sender was resumed by abort compensation.
    Interrupted,
}

/// One-shot completion signal a cross-thread sender blocks on.
#[derive(Debug)]
pub(crate) struct CompletionSignal {
    state: Mutex<Option<SignalOutcome>>,
    cond: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(CompletionSignal {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// First outcome wins; later ones are ignored.
    pub(crate) fn set(&self, outcome: SignalOutcome) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_some() {
            return false;
        }
        *state = Some(outcome);
        self.cond.notify_all();
        true
    }

    pub(crate) fn wait(&self) -> SignalOutcome {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            state = self.cond.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }
}

impl Resumable for CompletionSignal {
    fn resume_aborted(&self) {
        self.set(SignalOutcome::Interrupted);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_outcome_wins() {
        let signal = CompletionSignal::new();
        assert!(signal.set(SignalOutcome::Ran));
        signal.resume_aborted();
        assert!(matches!(signal.wait(), SignalOutcome::Ran));
    }

    #[test]
    fn waiter_is_released_from_another_thread() {
        let signal = CompletionSignal::new();
        let s = signal.clone();
        let waiter = std::thread::spawn(move || s.wait());
        signal.set(SignalOutcome::Dropped);
        assert!(matches!(waiter.join().unwrap(), SignalOutcome::Dropped));
    }
}
