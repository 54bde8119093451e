//! Scripted job handler and helpers shared by integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobFailure};
use crate::registry::JobTypeHandler;

/// Input parameter selecting what [`ScriptedHandler`] does with a job.
pub const MODE_PARAM: &str = "mode";

/// One-shot latch.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    /// Release every waiter.
    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.changed.notify_all();
    }

    /// Wait up to `timeout`; `true` once open.
    pub fn wait(&self, timeout: Duration) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        *self
            .changed
            .wait_timeout_while(open, timeout, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }
}

/// Handler driven by the job's `mode` input parameter:
///
/// - absent: report 50 %, then complete with result 0
/// - `"block"`: wait for [`ScriptedHandler::gate`] (or cancellation), then complete
/// - `"sleep"`: sleep 20 ms, then complete
/// - `"fail"`: finish with an exception
/// - `"forget"`: return without finishing
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    /// Released by tests to let blocked jobs finish.
    pub gate: Gate,
    started: Mutex<Vec<u64>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedHandler {
    /// Shared handler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Job numbers in the order `process` was entered.
    pub fn started(&self) -> Vec<u64> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Highest number of jobs inside `process` at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl JobTypeHandler for ScriptedHandler {
    fn process(&self, job: &Arc<Job>, cancel: &CancellationToken) {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job.number());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let mode = job
            .in_params()
            .get(MODE_PARAM)
            .and_then(Value::as_str)
            .map(str::to_string);
        let outcome = match mode.as_deref() {
            Some("block") => loop {
                if cancel.is_cancelled() {
                    break Outcome::Terminated;
                }
                if self.gate.wait(Duration::from_millis(10)) {
                    break Outcome::Completed;
                }
            },
            Some("sleep") => {
                std::thread::sleep(Duration::from_millis(20));
                Outcome::Completed
            }
            Some("fail") => Outcome::Failed,
            Some("forget") => Outcome::Forgotten,
            _ => {
                job.set_percent_complete(50);
                Outcome::Completed
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        let result = match outcome {
            Outcome::Completed => job.finish_ok(Some(Value::from(0))),
            Outcome::Terminated => job.finish_terminated(),
            Outcome::Failed => job.finish_exception(JobFailure::failed("scripted failure")),
            Outcome::Forgotten => Ok(()),
        };
        if let Err(error) = result {
            tracing::warn!(job_number = job.number(), %error, "scripted job did not finish");
        }
    }
}

enum Outcome {
    Completed,
    Terminated,
    Failed,
    Forgotten,
}

/// Poll `condition` every 10 ms for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
