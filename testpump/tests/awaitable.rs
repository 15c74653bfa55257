use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;
use testpump::{
    is_awaitable, result_type, AdapterKind, AnyValue, AwaitAdapter, Awaitable, Awaiter, Completion,
    Continuation, Executor, Failure, ShapeCache, Task, TypeKey, Value,
};

mod utils;
use utils::init_log;

/// A one-shot cell completed from another thread, with its own awaiter.
#[derive(Clone, Default)]
struct Latch {
    state: Arc<Mutex<LatchState>>,
}

#[derive(Default)]
struct LatchState {
    value: Option<Result<String, String>>,
    waiters: Vec<Continuation>,
}

impl Latch {
    fn complete(&self, value: Result<String, String>) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.value = Some(value);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }
}

struct LatchAwaiter(Latch);

impl Awaiter for LatchAwaiter {
    type Output = String;

    fn is_completed(&self) -> bool {
        self.0.state.lock().unwrap().value.is_some()
    }

    fn on_completed(&mut self, continuation: Continuation) {
        let mut state = self.0.state.lock().unwrap();
        if state.value.is_some() {
            drop(state);
            continuation();
        } else {
            state.waiters.push(continuation);
        }
    }

    fn get_result(&mut self) -> Result<String, Failure> {
        match self.0.state.lock().unwrap().value.clone() {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(Failure::from_error(e)),
            None => Err(Failure::from_error("latch not completed")),
        }
    }
}

impl Awaitable for Latch {
    type Awaiter = LatchAwaiter;

    fn get_awaiter(self) -> LatchAwaiter {
        LatchAwaiter(self)
    }
}

#[test]
#[serial]
fn structural_awaitable_completed_from_another_thread() {
    init_log();
    ShapeCache::global().register::<Latch>();
    assert!(is_awaitable(TypeKey::of::<Latch>()));
    assert_eq!(result_type(TypeKey::of::<Latch>()), Some(TypeKey::of::<String>()));

    let latch = Latch::default();
    let remote = latch.clone();
    let completer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        remote.complete(Ok("hello".to_string()));
    });

    let completion = Executor::default().await_value(AnyValue::new(latch)).unwrap();
    completer.join().unwrap();
    match completion {
        Completion::Finished(Ok(v)) => assert_eq!(v.downcast_ref::<String>().unwrap(), "hello"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
#[serial]
fn structural_failure_is_memoised() {
    init_log();
    ShapeCache::global().register::<Latch>();
    let latch = Latch::default();
    latch.complete(Err("no such row".to_string()));

    let mut adapter = AwaitAdapter::try_create(Some(AnyValue::new(latch.clone()))).unwrap();
    assert_eq!(adapter.kind(), AdapterKind::Structural);
    assert!(adapter.is_completed());
    let first = adapter.get_result().unwrap_err();

    // Completing the latch again must not change what the adapter reports.
    latch.complete(Ok("late".to_string()));
    let second = adapter.get_result().unwrap_err();
    assert!(Failure::ptr_eq(&first, &second));
    assert_eq!(first.message(), "no such row");
}

#[test]
fn task_result_is_the_same_allocation() {
    init_log();
    let mut adapter = AwaitAdapter::from_value(AnyValue::new(Task::ready(vec![1, 2, 3]))).unwrap();
    let a: Value = adapter.get_result().unwrap();
    let b: Value = adapter.get_result().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn continuation_runs_once_even_if_completion_races() {
    init_log();
    let executor = Executor::default();
    let out = executor
        .block_on(async {
            let (tx, rx) = futures::channel::oneshot::channel();
            std::thread::spawn(move || tx.send(5u8).unwrap());
            rx.await.unwrap()
        })
        .unwrap();
    assert_eq!(out, 5);
    assert_eq!(executor.stats().callback_panics, 0);
}

#[test]
fn fallible_task_reports_its_error() {
    init_log();
    let task = Task::fallible(async { Err::<u8, _>("disk full") });
    match Executor::default().await_value(AnyValue::new(task)).unwrap() {
        Completion::Finished(Err(failure)) => {
            assert!(!failure.is_panic());
            assert_eq!(failure.to_string(), "disk full");
        }
        other => panic!("unexpected {:?}", other),
    }
}
