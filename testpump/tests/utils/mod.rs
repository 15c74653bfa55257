use log::LevelFilter;
use simplelog::{CombinedLogger, SimpleLogger};
use std::any::Any;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT_LOG: Once = Once::new();

#[allow(dead_code)] // Only used in tests
pub fn init_log() {
    INIT_LOG.call_once(|| {
        CombinedLogger::init(vec![SimpleLogger::new(
            LevelFilter::Debug,
            simplelog::Config::default(),
        )])
        .unwrap()
    });
}

#[allow(dead_code)] // Only used in tests
pub fn assert_panic_contains(result: Result<(), Box<dyn Any + Send>>, expected_msg: &str) {
    match result {
        Ok(_) => {
            panic!("The function was expected to panic, but it did not.");
        }
        Err(msg) => {
            let s = if let Some(s) = msg.downcast_ref::<String>() {
                s.clone()
            } else if let Some(&s) = msg.downcast_ref::<&str>() {
                s.to_string()
            } else {
                panic!("The panic did not return a string; can't display it.");
            };
            assert!(
                s.contains(expected_msg),
                "Expected `{}` in `{}`",
                expected_msg,
                s
            );
        }
    }
}

/// Spins until `cond` holds, failing the test after a generous deadline.
#[allow(dead_code)] // Only used in tests
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}
