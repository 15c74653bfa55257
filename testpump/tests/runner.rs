use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use testpump::{
    block_on, run_test, AnyValue, Config, Error, Executor, PumpContext, Task, TestOutcome,
};

mod utils;
use utils::{assert_panic_contains, init_log};

#[test]
fn synchronous_body_passes() {
    init_log();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    let outcome = run_test(Config::default(), move || {
        r.fetch_add(1, Ordering::SeqCst);
        None
    });
    assert!(outcome.is_passed());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_body_reports_panic_location() {
    init_log();
    let outcome = run_test(Config::default(), || {
        Some(AnyValue::new(Task::new(async {
            let v: Vec<u8> = Vec::new();
            assert!(!v.is_empty(), "expected some bytes");
        })))
    });
    match outcome {
        TestOutcome::Failed(failure) => {
            assert!(failure.is_panic());
            assert_eq!(failure.message(), "expected some bytes");
            assert!(failure.location().unwrap().contains("runner.rs"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn assert_passed_panics_with_the_result_message() {
    init_log();
    let result = std::panic::catch_unwind(|| {
        run_test(Config::default(), || {
            Some(AnyValue::new(Task::failed("connection refused")))
        })
        .assert_passed();
    });
    assert_panic_contains(result, "connection refused");
}

#[test]
fn stop_inside_nested_drive_propagates_outwards() {
    init_log();
    let executor = Executor::default();
    let inner = executor.clone();
    let result = executor.block_on(async move {
        let nested = inner.block_on(async {
            if let Some(ctx) = PumpContext::current() {
                ctx.status().request_stop();
            }
            1u8
        });
        (nested.ok(), PumpContext::current().map(|ctx| ctx.status().is_running()))
    });
    // The nested drive completed, but the stop reached the outer run.
    assert_eq!(result.unwrap(), (Some(1), Some(false)));
    assert!(!executor.status().is_running());
}

#[test]
fn await_value_of_plain_value_is_an_error() {
    init_log();
    assert!(matches!(
        Executor::default().await_value(AnyValue::new(0.5f64)),
        Err(Error::NotAwaitable { .. })
    ));
    assert_eq!(block_on(async { "plain" }).unwrap(), "plain");
}
