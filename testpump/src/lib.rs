//! testpump: a runtime core for executing asynchronous tests.
//!
//! A test body may return an awaitable value: the built-in [`Task`] or any
//! registered [`Awaitable`]. The runtime drives it to completion on the
//! thread that started it, through a thread-affine [`PumpContext`], while
//! letting another thread stop it gracefully or abort it when it times out.
//!
//! ```no_run
//! use testpump::{run_test, AnyValue, Config, Task};
//!
//! let config = Config::builder().with_timeout_ms(1_000).build();
//! let outcome = run_test(config, || {
//!     Some(AnyValue::new(Task::new(async { 2 + 2 })))
//! });
//! assert!(outcome.is_passed());
//! ```
//!
//! The `#[pump_test]` attribute wraps an `async fn` into such a test.

pub mod awaiter;
pub mod cancel;
pub mod dispose;
mod error;
mod failure;
pub mod pump;
pub mod runner;
pub mod sequence;
pub mod shape;
mod value;

pub use awaiter::{AdapterKind, AwaitAdapter, Task};
pub use cancel::{
    checkpoint, AbortReport, Canceller, ExecutionStatus, StatusCell, Stopped, TerminateError,
    ThreadAborted, ThreadPhase, ThreadSlot, ThreadTerminator, UnwindTerminator,
};
pub use dispose::{DisposeOnce, ReleaseHandle, ScopedRelease};
pub use error::{Error, Result};
pub use failure::Failure;
pub use pump::{DriveOutcome, InstallGuard, PumpContext, PumpStats};
pub use runner::{
    block_on, run_test, spawn_test, CancelHandle, Completion, Executor, TestHandle, TestOutcome,
};
pub use sequence::{adapt_to_sync, AsyncSequence, Iterable, SyncSequence};
pub use shape::{
    is_awaitable, result_type, Awaitable, AwaitableShape, Awaiter, BuiltInProbe, Continuation,
    ShapeCache, ShapeKind, ShapeProbe,
};
pub use value::{value, AnyValue, TypeKey, Value};

pub use testpump_macros::pump_test;

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Overrides the timeout of every test, in milliseconds. `0` disables it.
pub const TIMEOUT_ENV: &str = "TESTPUMP_TIMEOUT_MS";
/// Overrides how long an idle pump sleeps between status checks.
pub const IDLE_POLL_ENV: &str = "TESTPUMP_IDLE_POLL_MS";

/// testpump configuration options.
///
/// Use the [`ConfigBuilder`] class to construct a `Config` struct, or load
/// one from JSON with [`Config::from_json`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) abort_grace_ms: u64,
    pub(crate) idle_poll_ms: u64,
    pub(crate) thread_name: String,
    pub(crate) stack_size: Option<usize>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Parses a configuration. Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The default configuration with the environment overrides applied.
    pub fn from_env() -> Config {
        ConfigBuilder::new().with_env_overrides().build()
    }

    pub fn to_json(&self) -> String {
        // A struct of plain fields always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    fn validate(&self) -> Result<()> {
        if self.idle_poll_ms == 0 {
            return Err(Error::Config("idle_poll_ms must be positive".to_string()));
        }
        if self.thread_name.contains('\0') {
            return Err(Error::Config(
                "thread_name must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Builds a [`Config`] struct.
pub struct ConfigBuilder(Config);

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder(Config {
            timeout_ms: None,
            abort_grace_ms: 1_000,
            idle_poll_ms: 50,
            thread_name: "testpump-worker".to_string(),
            stack_size: None,
        })
    }

    /// Checks whether the current config is valid and
    /// returns it if it is. Panics otherwise
    fn check_valid(self) -> Self {
        if let Err(e) = self.0.validate() {
            panic!("{}", e)
        }
        self
    }

    /// Aborts a test that runs for longer than `ms` milliseconds.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.0.timeout_ms = Some(ms);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.0.timeout_ms = None;
        self
    }

    /// How long a timed-out test thread is given to unwind before it is
    /// detached.
    pub fn with_abort_grace_ms(mut self, ms: u64) -> Self {
        self.0.abort_grace_ms = ms;
        self
    }

    /// The longest an idle pump sleeps before re-checking its run's status.
    pub fn with_idle_poll_ms(mut self, ms: u64) -> Self {
        self.0.idle_poll_ms = ms;
        self
    }

    pub fn with_thread_name(mut self, name: &str) -> Self {
        self.0.thread_name = name.to_string();
        self
    }

    /// Specifies the stack size of test threads
    pub fn with_stack_size(mut self, s: usize) -> Self {
        self.0.stack_size = Some(s);
        self
    }

    /// Applies `TESTPUMP_TIMEOUT_MS` and `TESTPUMP_IDLE_POLL_MS`, if set.
    /// Unparseable values, and a zero idle poll, are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_millis(TIMEOUT_ENV) {
            self.0.timeout_ms = (ms > 0).then_some(ms);
        }
        match env_millis(IDLE_POLL_ENV) {
            Some(0) => warn!("ignoring {}=0: the idle poll must be positive", IDLE_POLL_ENV),
            Some(ms) => self.0.idle_poll_ms = ms,
            None => {}
        }
        self
    }

    /// Consumes the builder and produces the [`Config`]
    pub fn build(self) -> Config {
        self.check_valid().0
    }
}

fn env_millis(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(ms) => Some(ms),
        Err(e) => {
            warn!("ignoring {}={:?}: {}", var, raw, e);
            None
        }
    }
}
