//! Consuming asynchronous sequences from synchronous code.
//!
//! Parameterised tests may take their cases from an asynchronous stream.
//! [`adapt_to_sync`] turns such a stream into a plain [`Iterator`] that,
//! on every `next`, drives the stream on the calling thread until it yields
//! its next element. Synchronous sources pass through untouched.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::lock::Mutex;
use futures::stream::{BoxStream, Stream, StreamExt};
use log::trace;

use crate::awaiter::Task;
use crate::cancel::ExecutionStatus;
use crate::error::{Error, Result};
use crate::runner::{Completion, Executor};
use crate::value::{value, AnyValue, Value};

/// A synchronous source of values.
pub struct Iterable {
    iter: Box<dyn Iterator<Item = Value> + Send>,
}

impl Iterable {
    pub fn new<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Any + Send + Sync,
    {
        Iterable {
            iter: Box::new(items.into_iter().map(value)),
        }
    }
}

/// An asynchronous source of values.
pub struct AsyncSequence {
    stream: BoxStream<'static, Value>,
}

impl AsyncSequence {
    pub fn new<S, T>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
        T: Any + Send + Sync,
    {
        AsyncSequence {
            stream: stream.map(value).boxed(),
        }
    }
}

/// Adapts `source` for synchronous iteration.
///
/// `None` yields `Ok(None)`. An [`Iterable`] is passed through and an
/// [`AsyncSequence`] is driven element by element on the calling thread.
/// Anything else is an [`Error::InvalidArgument`] naming `role`.
pub fn adapt_to_sync(source: Option<AnyValue>, role: &str) -> Result<Option<SyncSequence>> {
    adapt_with(Executor::default(), source, role)
}

pub(crate) fn adapt_with(
    executor: Executor,
    source: Option<AnyValue>,
    role: &str,
) -> Result<Option<SyncSequence>> {
    let source = match source {
        Some(source) => source,
        None => return Ok(None),
    };
    let source = match source.downcast::<Iterable>() {
        Ok(iterable) => {
            return Ok(Some(SyncSequence {
                source: Source::Sync(iterable.iter),
                done: false,
            }))
        }
        Err(source) => source,
    };
    match source.downcast::<AsyncSequence>() {
        Ok(seq) => Ok(Some(SyncSequence {
            source: Source::Async {
                stream: Arc::new(Mutex::new(seq.stream)),
                executor,
            },
            done: false,
        })),
        Err(other) => Err(Error::InvalidArgument {
            role: role.to_string(),
            reason: format!(
                "expected an iterable or an async sequence, got {}",
                other.type_name()
            ),
        }),
    }
}

enum Source {
    Sync(Box<dyn Iterator<Item = Value> + Send>),
    Async {
        // Locked only by the element task currently being driven.
        stream: Arc<Mutex<BoxStream<'static, Value>>>,
        executor: Executor,
    },
}

/// A blocking, single-pass view of a sequence.
///
/// After a stop, an abort or a failed element it yields that error once and
/// then ends.
pub struct SyncSequence {
    source: Source,
    done: bool,
}

impl SyncSequence {
    fn next_async(
        stream: &Arc<Mutex<BoxStream<'static, Value>>>,
        executor: &Executor,
    ) -> Option<Result<Value>> {
        match executor.drive_status().get() {
            ExecutionStatus::Running => {}
            ExecutionStatus::StopRequested => return Some(Err(Error::Stopped)),
            ExecutionStatus::AbortRequested => return Some(Err(Error::Aborted)),
        }

        let stream = stream.clone();
        let task = Task::from_value_future(async move {
            let next = stream.lock().await.next().await;
            value(next)
        });
        let completion = match executor.await_value(AnyValue::new(task)) {
            Ok(completion) => completion,
            Err(err) => return Some(Err(err)),
        };
        match completion {
            Completion::Finished(Ok(next)) => match next.downcast_ref::<Option<Value>>() {
                Some(next) => next.clone().map(Ok),
                None => Some(Err(Error::InvalidArgument {
                    role: "sequence element".to_string(),
                    reason: "element task produced an unexpected type".to_string(),
                })),
            },
            Completion::Finished(Err(failure)) => Some(Err(Error::Failed(failure))),
            Completion::Stopped => Some(Err(Error::Stopped)),
            Completion::Aborted => Some(Err(Error::Aborted)),
        }
    }
}

impl Iterator for SyncSequence {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match &mut self.source {
            Source::Sync(iter) => iter.next().map(Ok),
            Source::Async { stream, executor } => Self::next_async(stream, executor),
        };
        match &item {
            None => {
                trace!("sequence exhausted");
                self.done = true;
            }
            Some(Err(err)) => {
                trace!("sequence ended early: {}", err);
                self.done = true;
            }
            Some(Ok(_)) => {}
        }
        item
    }
}

impl fmt::Debug for SyncSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Sync(_) => "sync",
            Source::Async { .. } => "async",
        };
        f.debug_struct("SyncSequence")
            .field("source", &kind)
            .field("done", &self.done)
            .finish()
    }
}
