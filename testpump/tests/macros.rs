use std::time::Duration;

use testpump::pump_test;

#[pump_test]
async fn runs_on_a_named_thread() {
    let name = std::thread::current().name().map(str::to_string);
    futures::future::ready(()).await;
    assert_eq!(name.as_deref(), Some("runs_on_a_named_thread"));
}

#[pump_test(timeout_ms = 5_000, thread_name = "cross-thread")]
async fn awaits_work_from_other_threads() {
    let (tx, rx) = futures::channel::oneshot::channel();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        tx.send(42u32).unwrap();
    });
    let before = std::thread::current().id();
    let got = rx.await.unwrap();
    assert_eq!(got, 42);
    assert_eq!(std::thread::current().id(), before);
}

#[pump_test]
async fn result_returning_tests_pass_on_ok() -> Result<(), std::io::Error> {
    futures::future::ready(Ok(())).await
}

#[pump_test]
#[should_panic(expected = "wrong answer")]
async fn assertion_failures_fail_the_test() {
    futures::future::ready(()).await;
    panic!("wrong answer");
}

#[pump_test(timeout_ms = 30, abort_grace_ms = 2_000)]
#[should_panic(expected = "Test exceeded Timeout value of 30ms")]
async fn hanging_tests_time_out() {
    futures::future::pending::<()>().await;
}
