use std::future::Future;
use std::time::Instant;

/// Runs a closure exactly once, when dropped.
///
/// Useful for bookkeeping that must happen even if the owning future is cancelled.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}

/// State of the [`MeasureGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    Pending,
    Done(&'static str),
}

/// Emits the `futures.done` timer once the measured future completes or gets dropped.
struct MeasureGuard<'a> {
    state: MeasureState,
    task_name: &'a str,
    creation_time: Instant,
}

impl<'a> MeasureGuard<'a> {
    fn new(task_name: &'a str) -> Self {
        Self {
            state: MeasureState::Pending,
            task_name,
            creation_time: Instant::now(),
        }
    }

    fn start(&mut self) {
        metric!(
            timer("futures.wait_time") = self.creation_time.elapsed(),
            "task_name" => self.task_name,
        );
    }

    fn done(mut self, status: &'static str) {
        self.state = MeasureState::Done(status);
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer("futures.done") = self.creation_time.elapsed(),
            "task_name" => self.task_name,
            "status" => status,
        );
    }
}

/// Measures the timing of a future and reports metrics.
///
/// This function reports two metrics:
///
///  - `futures.wait_time`: Time between creation of the future and the first poll.
///  - `futures.done`: Time between creation of the future and completion.
///
/// The metric is tagged with a status derived with the `get_status` function. See the [`m`] module
/// for status helpers.
pub fn measure<'a, S, F>(
    task_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let mut guard = MeasureGuard::new(task_name);

    async move {
        guard.start();
        let output = f.await;
        guard.done(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    /// `"ok"` for `Ok(_)`, `"err"` for `Err(_)`.
    pub fn result<T, E>(result: &Result<T, E>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(_) => "err",
        }
    }
}
