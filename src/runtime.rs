#![forbid(unsafe_code)]
//! The process-wide handle that glues the effect runtime, the
//! dependency graph, and the flush scheduler together.
//!
//! This is process-wide mutable state, locked only by the single-thread
//! assumption: no lock-free structure, no `Send`/`Sync` bound anywhere in the
//! crate. `leptos_reactive::runtime::Runtime` models its equivalent state as
//! a `thread_local!`-held struct reached through a `with_runtime` accessor;
//! this keeps that shape but drops the multi-runtime `RuntimeId` indirection
//! needed there for concurrent SSR requests, since this crate never serves
//! more than one logical runtime per thread (see DESIGN.md).

use std::cell::{Cell, RefCell};

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::{
    effect::{EffectId, EffectState},
    graph::TargetEntry,
    scheduler::SchedulerState,
};

pub(crate) type FxIndexSet<T> = IndexSet<T, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

/// Runs `f` with the current thread's [`Runtime`].
pub(crate) fn with_runtime<T>(f: impl FnOnce(&Runtime) -> T) -> T {
    RUNTIME.with(f)
}

/// The reactive graph, effect table, and scheduler state for this thread.
///
/// This type is never constructed by users: every public function in this
/// crate reaches it through [`with_runtime`].
pub(crate) struct Runtime {
    // --- Effect Runtime ---
    pub(crate) effects: RefCell<SlotMap<EffectId, EffectState>>,
    pub(crate) effect_stack: RefCell<Vec<EffectId>>,
    pub(crate) active_effect: Cell<Option<EffectId>>,
    pub(crate) should_track: Cell<bool>,
    pub(crate) track_stack: RefCell<Vec<bool>>,
    pub(crate) next_effect_id: Cell<u64>,

    // --- Dependency Graph ---
    pub(crate) targets: RefCell<FxHashMap<crate::graph::TargetId, TargetEntry>>,
    pub(crate) next_target_id: Cell<u64>,

    // --- Flush Scheduler ---
    pub(crate) scheduler: SchedulerState,
}

impl Runtime {
    fn new() -> Self {
        Self {
            effects: RefCell::new(SlotMap::with_key()),
            effect_stack: RefCell::new(Vec::new()),
            active_effect: Cell::new(None),
            should_track: Cell::new(true),
            track_stack: RefCell::new(Vec::new()),
            next_effect_id: Cell::new(0),
            targets: RefCell::new(FxHashMap::default()),
            next_target_id: Cell::new(0),
            scheduler: SchedulerState::new(),
        }
    }

    pub(crate) fn allocate_effect_numeric_id(&self) -> u64 {
        let id = self.next_effect_id.get();
        self.next_effect_id.set(id + 1);
        id
    }

    pub(crate) fn allocate_target_id(&self) -> crate::graph::TargetId {
        let id = self.next_target_id.get();
        self.next_target_id.set(id + 1);
        crate::graph::TargetId(id)
    }
}

/// Test-only reset of all process-wide reactive state.
///
/// End-to-end scenario tests each assume a pristine runtime (empty
/// queue, no effects, no tracked targets). `cargo test` gives each test
/// function its own thread and therefore its own `thread_local!` runtime,
/// but any test that spawns helper threads or otherwise shares one calls
/// this first to get a clean slate.
#[cfg(test)]
pub(crate) fn reset_runtime_for_test() {
    RUNTIME.with(|rt| {
        rt.effects.borrow_mut().clear();
        rt.effect_stack.borrow_mut().clear();
        rt.active_effect.set(None);
        rt.should_track.set(true);
        rt.track_stack.borrow_mut().clear();
        rt.targets.borrow_mut().clear();
        rt.scheduler.reset_for_test();
    });
}
