#![forbid(unsafe_code)]
//! The Effect Runtime: creation, invocation, tracking pause/resume,
//! and teardown of reactive effects.
//!
//! Grounded on the teacher's `leptos_reactive::effect` module for the shape
//! of effect creation (a free function returning a stable id, rather than a
//! method on some owning object) and on its `runtime.rs` observer-stack
//! handling for the push/pop-on-drop discipline around re-entrant reads.
//! The invoke algorithm (cleanup-then-track-then-run, re-entrancy guard,
//! nested tracking-stack save/restore) is new: it implements the source
//! spec's `ReactiveEffect.run()` contract, which the teacher's pull-based
//! `update_if_necessary` model does not need.

use std::{cell::Cell, cell::RefCell, fmt, rc::Rc};

use slotmap::new_key_type;

use crate::{
    graph::{Dep, TrackEvent, TriggerEvent},
    runtime::with_runtime,
};

new_key_type! {
    /// Stable handle to a registered effect. The slotmap slot can be reused
    /// after [`stop`], so this is *not* the ordering key the scheduler sorts
    /// jobs by — see [`EffectState::numeric_id`].
    pub struct EffectId;
}

/// Configuration accepted by [`make_effect`].
#[derive(Default)]
pub struct EffectOptions {
    /// If `true`, the effect may re-trigger itself while it is already
    /// running. Defaults to `false`.
    pub allow_recurse: bool,
    /// Called with every dependency this effect collects on a run. Intended
    /// for diagnostics/devtools; mirrors the source's `onTrack` hook.
    #[cfg(feature = "diagnostics")]
    pub on_track: Option<Rc<dyn Fn(&TrackEvent)>>,
    /// Called whenever a dependency of this effect fires. Mirrors the
    /// source's `onTrigger`.
    #[cfg(feature = "diagnostics")]
    pub on_trigger: Option<Rc<dyn Fn(&TriggerEvent)>>,
    /// Called once, when [`stop`] deactivates this effect. Mirrors the
    /// source's `onStop`.
    #[cfg(feature = "diagnostics")]
    pub on_stop: Option<Rc<dyn Fn()>>,
}

impl fmt::Debug for EffectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectOptions")
            .field("allow_recurse", &self.allow_recurse)
            .finish_non_exhaustive()
    }
}

/// Internal bookkeeping for a registered effect.
pub(crate) struct EffectState {
    /// The effect body. Re-run in place on a direct (unscheduled) trigger.
    pub(crate) raw: Rc<dyn Fn()>,
    /// If present, triggering this effect calls the scheduler instead of
    /// running `raw` in place.
    pub(crate) scheduler: Option<Rc<dyn Fn(EffectId)>>,
    /// Cleared by [`stop`]; a stopped effect is inert on every subsequent
    /// trigger and track.
    pub(crate) active: Cell<bool>,
    pub(crate) allow_recurse: Cell<bool>,
    /// Guards re-entrant direct invocation of an effect that does not allow
    /// recursion: set for the duration of [`invoke`], checked at entry.
    pub(crate) running: Cell<bool>,
    /// Back-references into every `Dep` set this effect is currently a
    /// member of, so a re-run can clear stale membership before retracking.
    pub(crate) deps: RefCell<Vec<Dep>>,
    /// Monotonic, never reused, unlike the slotmap key whose index and
    /// generation can be recycled after [`stop`]. The scheduler orders jobs
    /// by this value.
    pub(crate) numeric_id: u64,
    /// Cached `Job` handed to `queue_job` on every scheduled dispatch of this
    /// effect. The scheduler dedups by `Rc` pointer identity, so this
    /// must be the same allocation every time rather than a fresh `Rc`
    /// per trigger — otherwise two triggers of the same effect within one
    /// flush would never compare equal and recursion gating would be a
    /// no-op.
    pub(crate) scheduled_job: RefCell<Option<Rc<dyn crate::scheduler::Job>>>,
    #[cfg(feature = "diagnostics")]
    pub(crate) on_track: Option<Rc<dyn Fn(&TrackEvent)>>,
    #[cfg(feature = "diagnostics")]
    pub(crate) on_trigger: Option<Rc<dyn Fn(&TriggerEvent)>>,
    #[cfg(feature = "diagnostics")]
    pub(crate) on_stop: Option<Rc<dyn Fn()>>,
}

/// Registers a new effect and runs it once immediately to collect its
/// initial dependency set.
///
/// `scheduler`, if given, is the effect's job-queueing collaborator: when a
/// dependency this effect tracked fires, the graph hands the effect's id to
/// `scheduler` instead of calling the effect body directly.
pub fn make_effect(
    f: impl Fn() + 'static,
    scheduler: Option<Rc<dyn Fn(EffectId)>>,
    options: EffectOptions,
) -> EffectId {
    let id = with_runtime(|rt| {
        let numeric_id = rt.allocate_effect_numeric_id();
        let state = EffectState {
            raw: Rc::new(f),
            scheduler,
            active: Cell::new(true),
            allow_recurse: Cell::new(options.allow_recurse),
            running: Cell::new(false),
            deps: RefCell::new(Vec::new()),
            numeric_id,
            scheduled_job: RefCell::new(None),
            #[cfg(feature = "diagnostics")]
            on_track: options.on_track,
            #[cfg(feature = "diagnostics")]
            on_trigger: options.on_trigger,
            #[cfg(feature = "diagnostics")]
            on_stop: options.on_stop,
        };
        rt.effects.borrow_mut().insert(state)
    });
    invoke(id);
    id
}

/// Registers an effect whose triggers are routed through the flush
/// scheduler instead of being re-run in place. The effect still runs once synchronously at creation, the
/// same as [`make_effect`].
pub fn make_scheduled_effect(f: impl Fn() + 'static, options: EffectOptions) -> EffectId {
    let scheduler: Rc<dyn Fn(EffectId)> = Rc::new(|id: EffectId| {
        with_runtime(|rt| {
            rt.queue_job(scheduled_job_for(id));
        });
    });
    make_effect(f, Some(scheduler), options)
}

/// Returns the stable `Job` handle for `id`'s scheduled dispatches,
/// allocating it on first use and reusing it on every subsequent trigger.
fn scheduled_job_for(id: EffectId) -> Rc<dyn crate::scheduler::Job> {
    with_runtime(|rt| {
        let effects = rt.effects.borrow();
        let state = effects.get(id).expect("scheduled_job_for: unknown EffectId");
        let mut cell = state.scheduled_job.borrow_mut();
        if let Some(job) = cell.as_ref() {
            return job.clone();
        }
        let job: Rc<dyn crate::scheduler::Job> = Rc::new(crate::scheduler::EffectJob(id));
        *cell = Some(job.clone());
        job
    })
}

/// Whether `id` is still active, i.e. has not been [`stop`]ped.
pub(crate) fn is_active(id: EffectId) -> bool {
    with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .map(|s| s.active.get())
            .unwrap_or(false)
    })
}

/// Whether `id` is allowed to re-queue itself while it is already running.
pub(crate) fn allows_recurse(id: EffectId) -> bool {
    with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .map(|s| s.allow_recurse.get())
            .unwrap_or(false)
    })
}

/// Numeric ordering key for `id`, used by the scheduler. Panics if `id` was
/// never registered (callers only ever see ids from [`make_effect`]).
pub(crate) fn numeric_id(id: EffectId) -> u64 {
    with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .expect("numeric_id: unknown EffectId")
            .numeric_id
    })
}

/// Runs `id`'s body, implementing the six-step invoke contract from §4.A:
///
/// 1. If the effect was [`stop`]ped, do nothing.
/// 2. If the effect is already running, do nothing (re-entrancy guard —
///    unconditional: `allow_recurse` governs whether a *scheduler* may
///    re-queue an effect while it runs, not whether a direct, unscheduled
///    invocation may recurse into itself synchronously).
/// 3. Clear the effect's membership from every dep set it is currently in
///    (cleanup), so a branch no longer taken stops being tracked.
/// 4. Push tracking-enabled onto the pause/resume stack.
/// 5. Push `id` as the active effect.
/// 6. Run the body, then pop both stacks regardless of whether the body
///    panicked.
///
/// This function is panic-transparent: a panic in `raw` propagates out of
/// `invoke` to whatever called it (a direct `trigger`, or `make_effect`'s
/// initial run). Per §7, only job execution reached through the scheduler's
/// drain is panic-isolated — that isolation lives one level up, around
/// `EffectJob::run` in `flush_jobs_inner`, not here.
pub(crate) fn invoke(id: EffectId) {
    let (raw, should_run) = with_runtime(|rt| {
        let effects = rt.effects.borrow();
        let Some(state) = effects.get(id) else {
            return (None, false);
        };
        if !state.active.get() {
            return (None, false);
        }
        if state.running.get() {
            return (None, false);
        }
        state.running.set(true);
        (Some(state.raw.clone()), true)
    });

    if !should_run {
        return;
    }
    let Some(raw) = raw else { return };

    cleanup(id);

    with_runtime(|rt| {
        rt.track_stack.borrow_mut().push(rt.should_track.get());
        rt.should_track.set(true);
        rt.effect_stack.borrow_mut().push(id);
        rt.active_effect.set(Some(id));
    });

    // Guaranteed-on-all-exit-paths finalizer (§4.A step 6): a `Drop` guard
    // restores the effect/tracking stacks whether `raw` returns normally or
    // unwinds, so a propagating panic still leaves the runtime's stacks
    // consistent for whatever catches it further up.
    struct InvokeGuard(EffectId);
    impl Drop for InvokeGuard {
        fn drop(&mut self) {
            with_runtime(|rt| {
                rt.effect_stack.borrow_mut().pop();
                rt.active_effect.set(rt.effect_stack.borrow().last().copied());
                if let Some(prev) = rt.track_stack.borrow_mut().pop() {
                    rt.should_track.set(prev);
                }
                if let Some(state) = rt.effects.borrow().get(self.0) {
                    state.running.set(false);
                }
            });
        }
    }
    let _guard = InvokeGuard(id);

    raw();
}

/// The effect currently running, or `None` at the top level. Read-only
/// mirror of the source's `activeEffect`, exposed for host code (e.g. a
/// renderer's debugger panel) that wants to know what triggered a given
/// read without threading an id through every call site.
pub fn active_effect() -> Option<EffectId> {
    with_runtime(|rt| rt.active_effect.get())
}

/// Removes `id` from every dep set it is currently a member of, without
/// touching `id`'s own `deps` bookkeeping (the subsequent run repopulates
/// it via `track`). Grounded on the source's `cleanupEffect`.
fn cleanup(id: EffectId) {
    let deps = with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .map(|s| std::mem::take(&mut *s.deps.borrow_mut()))
    });
    let Some(deps) = deps else { return };
    for dep in deps {
        dep.borrow_mut().shift_remove(&id);
    }
}

/// Permanently deactivates `id`. A stopped effect is never invoked again and
/// is cleaned out of the graph's dep sets immediately. Idempotent: stopping
/// an already-stopped effect does not fire `on_stop` a second time.
pub fn stop(id: EffectId) {
    let was_active = with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .map(|s| s.active.get())
            .unwrap_or(false)
    });
    if !was_active {
        return;
    }
    cleanup(id);
    with_runtime(|rt| {
        if let Some(state) = rt.effects.borrow().get(id) {
            state.active.set(false);
        }
    });
    #[cfg(feature = "diagnostics")]
    with_runtime(|rt| {
        if let Some(state) = rt.effects.borrow().get(id) {
            if let Some(hook) = &state.on_stop {
                hook();
            }
        }
    });
}

/// Suspends dependency tracking: reads inside `f` do not register the
/// active effect as a subscriber.
pub fn pause_tracking() {
    with_runtime(|rt| {
        rt.track_stack.borrow_mut().push(rt.should_track.get());
        rt.should_track.set(false);
    });
}

/// Re-enables dependency tracking after a [`pause_tracking`] call.
pub fn enable_tracking() {
    with_runtime(|rt| {
        rt.track_stack.borrow_mut().push(rt.should_track.get());
        rt.should_track.set(true);
    });
}

/// Pops the most recent [`pause_tracking`]/[`enable_tracking`] push,
/// restoring whatever tracking state was active before it.
pub fn reset_tracking() {
    with_runtime(|rt| {
        if let Some(prev) = rt.track_stack.borrow_mut().pop() {
            rt.should_track.set(prev);
        }
    });
}

/// The effect currently being run, if any, and whether tracking is enabled
/// right now. `graph::track` consults this to decide whether (and to whom)
/// a read should be attributed.
pub(crate) fn current_tracking_target() -> Option<EffectId> {
    with_runtime(|rt| {
        if !rt.should_track.get() {
            return None;
        }
        rt.effect_stack.borrow().last().copied()
    })
}

/// Registers `dep` as one of `id`'s current dependency sets, so a future
/// [`cleanup`] can remove `id` from it again.
pub(crate) fn record_dependency(id: EffectId, dep: Dep) {
    with_runtime(|rt| {
        if let Some(state) = rt.effects.borrow().get(id) {
            state.deps.borrow_mut().push(dep);
        }
    });
}

/// Dispatches a trigger to `id`: either queues it via its scheduler or runs
/// it in place, per §4.D's cross-component contract.
pub(crate) fn dispatch_trigger(id: EffectId) {
    let scheduler = with_runtime(|rt| {
        rt.effects
            .borrow()
            .get(id)
            .filter(|s| s.active.get())
            .and_then(|s| s.scheduler.clone())
    });
    match scheduler {
        Some(scheduler) => scheduler(id),
        None => invoke(id),
    }
}
