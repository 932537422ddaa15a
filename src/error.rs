#![forbid(unsafe_code)]
//! The error-reporting collaborator the scheduler and graph call out to.
//!
//! The source spec leaves this abstract: "an error-reporting function
//! `callWithErrorHandling(fn, instance?, code)` that invokes `fn` inside a
//! try/catch and routes failures to an error handler". Rust has no checked
//! exceptions, so the isolation boundary is `std::panic::catch_unwind`
//! (grounded on the same guard-on-drop + `catch_unwind` pattern used at the
//! batch boundary in `spark-signals`' `reactivity/batching.rs`) and the
//! "error handler" is a pluggable trait object installed process-wide via
//! [`set_error_handler`].

use std::{cell::RefCell, fmt};

use thiserror::Error;

/// Identifies which collaborator produced a [`ReactiveError`], mirroring the
/// source spec's error-code taxonomy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Raised while running a main-queue job during a drain.
    Scheduler,
    /// Raised while draining a pre-flush callback.
    PreFlush,
    /// Raised while draining a post-flush callback.
    PostFlush,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduler => write!(f, "SCHEDULER"),
            Self::PreFlush => write!(f, "PRE_FLUSH"),
            Self::PostFlush => write!(f, "POST_FLUSH"),
        }
    }
}

/// An error isolated at a scheduler boundary.
///
/// This is never returned from the public scheduling APIs: it only ever
/// reaches an installed [`ErrorHandler`]. Main/pre/post phases never abort a
/// drain because of one of these.
#[derive(Debug, Error)]
#[error("[{code}] job {job_id:?} panicked: {message}")]
pub struct ReactiveError {
    pub code: ErrorCode,
    pub job_id: Option<u64>,
    pub message: String,
}

/// Collaborator invoked with every isolated error. The default implementation
/// logs via `tracing::error!` and does not re-raise, matching "the host opts
/// in" from the source's design notes.
pub trait ErrorHandler {
    fn handle(&self, err: ReactiveError);
}

/// The default [`ErrorHandler`]: logs and swallows.
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle(&self, err: ReactiveError) {
        tracing::error!(code = %err.code, job_id = ?err.job_id, "{}", err.message);
    }
}

thread_local! {
    pub(crate) static ERROR_HANDLER: RefCell<Box<dyn ErrorHandler>> =
        RefCell::new(Box::new(TracingErrorHandler));
}

/// Installs a process-wide [`ErrorHandler`], replacing the default
/// tracing-based one.
pub fn set_error_handler(handler: impl ErrorHandler + 'static) {
    ERROR_HANDLER.with(|cell| *cell.borrow_mut() = Box::new(handler));
}

/// Invokes `f` inside a panic-isolation boundary, routing any panic to the
/// installed [`ErrorHandler`] tagged with `code` and `job_id`. This is the
/// Rust encoding of `callWithErrorHandling`.
pub(crate) fn call_with_error_handling(code: ErrorCode, job_id: Option<u64>, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let message = panic_message(&payload);
        ERROR_HANDLER.with(|cell| {
            cell.borrow().handle(ReactiveError {
                code,
                job_id,
                message,
            });
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    struct CountingHandler(Rc<Cell<usize>>);
    impl ErrorHandler for CountingHandler {
        fn handle(&self, _err: ReactiveError) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn catches_panic_and_routes_to_handler() {
        let count = Rc::new(Cell::new(0));
        set_error_handler(CountingHandler(count.clone()));

        call_with_error_handling(ErrorCode::Scheduler, Some(7), || {
            panic!("boom");
        });

        assert_eq!(count.get(), 1);

        // restore the default handler so other tests in this process aren't affected
        set_error_handler(TracingErrorHandler);
    }

    #[test]
    fn does_not_invoke_handler_on_success() {
        let count = Rc::new(Cell::new(0));
        set_error_handler(CountingHandler(count.clone()));

        call_with_error_handling(ErrorCode::Scheduler, None, || {});

        assert_eq!(count.get(), 0);
        set_error_handler(TracingErrorHandler);
    }
}
