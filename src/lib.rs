//! A dependency-tracking reactivity graph and batched flush scheduler for
//! fine-grained incremental recomputation.
//!
//! Three collaborating pieces make up the engine:
//!
//! - [`effect`]: registers reactive effects, runs them, and manages the
//!   tracking context a read is attributed to.
//! - [`graph`] and [`target`]: a weak-keyed dependency graph (`track`/
//!   `trigger`) plus the concrete container types (cell, vec, map) that
//!   read and write through it.
//! - [`scheduler`]: batches triggered effects behind one microtask, with
//!   separate pre-flush, main, and post-flush phases and a `next_tick`
//!   future that resolves once a drain completes.
//!
//! ```
//! use reactive_core::{effect::{make_scheduled_effect, EffectOptions}, scheduler::next_tick, target::ReactiveCell};
//!
//! # tokio_test::block_on(async {
//! let count = ReactiveCell::new(0);
//! let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
//!
//! let seen2 = seen.clone();
//! let count2 = count.clone();
//! make_scheduled_effect(move || seen2.borrow_mut().push(count2.get()), EffectOptions::default());
//!
//! count.set(1);
//! count.set(2);
//! next_tick(None).await;
//!
//! assert_eq!(*seen.borrow(), vec![0, 2]);
//! # });
//! ```

pub mod effect;
pub mod error;
pub mod graph;
mod runtime;
pub mod scheduler;
pub mod target;

pub use effect::{
    active_effect, enable_tracking, make_effect, make_scheduled_effect, pause_tracking,
    reset_tracking, stop, EffectId, EffectOptions,
};
pub use error::{set_error_handler, ErrorCode, ErrorHandler, ReactiveError};
pub use graph::{gc, trigger_clear, trigger_key, trigger_length_set, Key, TargetId, TrackOp, TriggerOp};
pub use scheduler::{drain_microtasks, next_tick, Job, NextTick, PostFlushCb, RECURSION_LIMIT};
pub use target::{ReactiveCell, ReactiveMap, ReactiveTarget, ReactiveVec};

/// Hands `job` to the main queue directly, without going through an effect.
/// Most callers register a [`make_scheduled_effect`] instead; this exists
/// for host code implementing its own [`Job`].
pub fn queue_job(job: std::rc::Rc<dyn Job>) {
    runtime::with_runtime(|rt| rt.queue_job(job));
}

/// Removes `job` from the main queue if the current drain has not yet
/// reached it.
pub fn invalidate_job(job: &std::rc::Rc<dyn Job>) {
    runtime::with_runtime(|rt| rt.invalidate_job(job));
}

/// Queues `cb` to run during the pre-flush phase of the next drain.
pub fn queue_pre_flush_cb(cb: impl Fn() + 'static) {
    runtime::with_runtime(|rt| rt.queue_pre_flush_cb(std::rc::Rc::new(cb)));
}

/// Queues a batch of pre-flush callbacks at once. See
/// [`scheduler`](crate::scheduler)'s module docs on why this path skips the
/// dedup check the single-callback [`queue_pre_flush_cb`] performs.
pub fn queue_pre_flush_cbs_batch(cbs: Vec<std::rc::Rc<dyn Fn()>>) {
    runtime::with_runtime(|rt| rt.queue_pre_flush_cbs_batch(cbs));
}

/// Queues `cb` to run during the post-flush phase of the next drain,
/// optionally ordered by `id` against other post-flush callbacks.
pub fn queue_post_flush_cb(cb: impl Fn() + 'static, id: Option<u64>) {
    runtime::with_runtime(|rt| {
        rt.queue_post_flush_cb(PostFlushCb {
            id,
            f: std::rc::Rc::new(cb),
        })
    });
}

/// Drains the pre-flush callback backlog to a fixed point. `parent_job`, when
/// given, identifies the main-queue job whose own update is driving this
/// call, so a callback it runs can't immediately re-queue that same job.
pub fn flush_pre_flush_cbs(parent_job: Option<u64>) {
    runtime::with_runtime(|rt| rt.flush_pre_flush_cbs(parent_job));
}

/// Drains the post-flush callback backlog to a fixed point.
pub fn flush_post_flush_cbs() {
    runtime::with_runtime(|rt| rt.flush_post_flush_cbs());
}
