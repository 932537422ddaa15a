#![forbid(unsafe_code)]
//! The Dependency Graph: target/key/dep bookkeeping and the
//! track/trigger rule table.
//!
//! The source models targets as arbitrary host objects reached through a
//! `WeakMap`-by-identity. Rust has no weak-by-identity map over arbitrary
//! types, so targets here are represented by a monotonic [`TargetId`] handle
//! plus a liveness token (`Rc<()>`/`Weak<()>`) the graph watches rather than
//! owns — grounded on the teacher's `leptos_reactive::node` arena, which
//! also keys reactive state by an opaque id rather than by object identity,
//! though the teacher never needs the weak-liveness half since its arena
//! owns its nodes outright.
//!
//! The container shapes ([`Key`], [`TargetShape`], the CLEAR/length/keyed
//! trigger rules) are a direct transcription of §4.B's rule table; nothing
//! comparable exists in the teacher, which tracks a single dirty flag per
//! node instead of per-key deps.

use std::{cell::RefCell, fmt, rc::Rc, rc::Weak};

use rustc_hash::FxHashMap;

use crate::{
    effect::{current_tracking_target, dispatch_trigger, record_dependency, EffectId},
    runtime::{with_runtime, FxIndexSet},
};

/// Opaque handle to a tracked target. Allocated by [`crate::runtime::Runtime::allocate_target_id`];
/// never reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u64);

/// The property a read or write addresses within a target.
///
/// The source uses JS property keys (strings, the `ITERATE_KEY`/
/// `MAP_KEY_ITERATE_KEY` symbols, and numeric indices coerced to strings).
/// Rust needs a closed, hashable enum instead of open-ended symbol
/// sentinels, so iteration markers become explicit variants.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// The sole key of a single-value target ([`crate::target::ReactiveCell`]).
    Value,
    /// A numeric index into an array-like target.
    Index(usize),
    /// The `length` property of an array-like target.
    Length,
    /// A string key into a map-like target.
    Named(Rc<str>),
    /// The source's `ITERATE_KEY`: depended on by `for...in`/iteration over
    /// an array-like target, fired by any key add/delete but not by a
    /// same-length `Set`.
    Iterate,
    /// The source's `MAP_KEY_ITERATE_KEY`: depended on by iterating a
    /// map-like target's keys, fired only by add/delete, not by `Set`.
    MapKeyIterate,
}

/// What kind of read produced a [`track`] call. Carried through to
/// diagnostics hooks; the graph itself does not yet branch on it, matching
/// the source where `TrackOpTypes` is informational.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// What kind of write produced a trigger call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerOp {
    Set,
    Add,
    Delete,
    Clear,
}

/// The shape of a target, needed to decide which iteration key a keyed
/// trigger should also fire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetShape {
    /// A [`crate::target::ReactiveCell`]: one key, `Key::Value`.
    Plain,
    /// A [`crate::target::ReactiveVec`]: numeric indices plus `Length` and
    /// `Iterate`.
    Array,
    /// A [`crate::target::ReactiveMap`]: named keys plus `MapKeyIterate`.
    MapLike,
}

/// The set of effects subscribed to one `(target, key)` pair. Wrapped in
/// `Rc<RefCell<_>>` so an effect's `deps` back-reference and the graph's forward reference share the same allocation.
pub(crate) type Dep = Rc<RefCell<FxIndexSet<EffectId>>>;

pub(crate) struct TargetEntry {
    /// Downgraded from the target's owned `Rc<()>` liveness token. Once the
    /// token is dropped the target is gone and [`crate::runtime::Runtime::gc`]
    /// may purge this entry; the graph never extends the target's lifetime.
    pub(crate) alive: Weak<()>,
    pub(crate) keys: FxHashMap<Key, Dep>,
}

/// Diagnostics payload for [`crate::effect::EffectOptions::on_track`].
#[derive(Clone, Debug)]
pub struct TrackEvent {
    pub target: TargetId,
    pub key: Key,
    pub op: TrackOp,
}

/// Diagnostics payload for [`crate::effect::EffectOptions::on_trigger`].
#[derive(Clone, Debug)]
pub struct TriggerEvent {
    pub target: TargetId,
    pub key: Option<Key>,
    pub op: TriggerOp,
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({})", self.0)
    }
}

fn dep_for(target: TargetId, key: Key, alive: &Rc<()>) -> Dep {
    with_runtime(|rt| {
        let mut targets = rt.targets.borrow_mut();
        let entry = targets.entry(target).or_insert_with(|| TargetEntry {
            alive: Rc::downgrade(alive),
            keys: FxHashMap::default(),
        });
        entry
            .keys
            .entry(key)
            .or_insert_with(|| Rc::new(RefCell::new(FxIndexSet::default())))
            .clone()
    })
}

/// Records a read of `(target, key)`, subscribing the currently running
/// effect (if tracking is enabled) to it.
///
/// `alive` is the target's liveness token; callers pass their own `Rc<()>`
/// so the graph never has to own or extend target lifetime.
pub(crate) fn track_with_token(target: TargetId, key: Key, op: TrackOp, alive: &Rc<()>) {
    let Some(effect_id) = current_tracking_target() else {
        return;
    };
    let dep = dep_for(target, key.clone(), alive);
    let is_new = dep.borrow_mut().insert(effect_id);
    if is_new {
        record_dependency(effect_id, dep);
    }
    #[cfg(feature = "diagnostics")]
    emit_track_event(effect_id, target, key, op);
}

/// Test/public convenience for targets that manage their own liveness token
/// separately (kept distinct from `track_with_token` since most call sites
/// go through [`crate::target`] wrapper types that already hold one).
#[cfg(test)]
pub(crate) fn track(target: TargetId, key: Key, op: TrackOp) {
    thread_local! {
        static TEST_TOKENS: RefCell<FxHashMap<TargetId, Rc<()>>> = RefCell::new(FxHashMap::default());
    }
    let token = TEST_TOKENS.with(|t| {
        t.borrow_mut()
            .entry(target)
            .or_insert_with(|| Rc::new(()))
            .clone()
    });
    track_with_token(target, key, op, &token);
}

#[cfg(feature = "diagnostics")]
fn emit_track_event(effect_id: EffectId, target: TargetId, key: Key, op: TrackOp) {
    with_runtime(|rt| {
        if let Some(state) = rt.effects.borrow().get(effect_id) {
            if let Some(hook) = &state.on_track {
                hook(&TrackEvent { target, key, op });
            }
        }
    });
}

#[cfg(feature = "diagnostics")]
fn emit_trigger_event(effect_id: EffectId, target: TargetId, key: Option<Key>, op: TriggerOp) {
    with_runtime(|rt| {
        if let Some(state) = rt.effects.borrow().get(effect_id) {
            if let Some(hook) = &state.on_trigger {
                hook(&TriggerEvent { target, key, op });
            }
        }
    });
}

/// §4.B rule 2's admission filter: a candidate effect is added to the
/// to-run set iff it is not the effect currently running, or it is but it
/// has opted into self-recursion. Applied once per candidate, using a
/// single `active_effect()` snapshot taken by the caller so a nested
/// trigger fired from inside the loop (by an admitted, already-running
/// `allow_recurse` effect) can't shift which effect counts as "active" for
/// the rest of the same fan-out.
fn admitted(effect_id: EffectId, active: Option<EffectId>) -> bool {
    Some(effect_id) != active || crate::effect::allows_recurse(effect_id)
}

fn fire_dep(target: TargetId, key: Key, op: TriggerOp, dep: Option<Dep>) {
    let Some(dep) = dep else { return };
    let effects: Vec<EffectId> = dep.borrow().iter().copied().collect();
    let active = crate::effect::active_effect();
    for effect_id in effects {
        if !admitted(effect_id, active) {
            continue;
        }
        #[cfg(feature = "diagnostics")]
        emit_trigger_event(effect_id, target, Some(key.clone()), op);
        dispatch_trigger(effect_id);
    }
}

/// `target.clear()` fired: every dep of every key on `target` runs, since a
/// clear invalidates the whole object.
pub fn trigger_clear(target: TargetId) {
    let deps: Vec<Dep> = with_runtime(|rt| {
        rt.targets
            .borrow()
            .get(&target)
            .map(|entry| entry.keys.values().cloned().collect())
            .unwrap_or_default()
    });
    let active = crate::effect::active_effect();
    for dep in deps {
        let effects: Vec<EffectId> = dep.borrow().iter().copied().collect();
        for effect_id in effects {
            if !admitted(effect_id, active) {
                continue;
            }
            #[cfg(feature = "diagnostics")]
            emit_trigger_event(effect_id, target, None, TriggerOp::Clear);
            dispatch_trigger(effect_id);
        }
    }
}

/// An array-like target's `length` was written directly, to `new_len`.
/// Fires `Key::Length`'s dep, plus every `Key::Index(i)` dep for `i >=
/// new_len` (truncated indices), matching the source's "a length write
/// invalidates both the length dep and any index deps it invalidates".
pub fn trigger_length_set(target: TargetId, new_len: usize) {
    let (length_dep, index_deps): (Option<Dep>, Vec<(usize, Dep)>) = with_runtime(|rt| {
        let targets = rt.targets.borrow();
        let Some(entry) = targets.get(&target) else {
            return (None, Vec::new());
        };
        let length_dep = entry.keys.get(&Key::Length).cloned();
        let index_deps = entry
            .keys
            .iter()
            .filter_map(|(k, d)| match k {
                Key::Index(i) if *i >= new_len => Some((*i, d.clone())),
                _ => None,
            })
            .collect();
        (length_dep, index_deps)
    });
    fire_dep(target, Key::Length, TriggerOp::Set, length_dep);
    for (i, dep) in index_deps {
        fire_dep(target, Key::Index(i), TriggerOp::Set, Some(dep));
    }
}

/// A single keyed write. Implements §4.B's full trigger rule table:
///
/// - `Set` on an existing key: fires only that key's dep.
/// - `Add` on a new key: fires that key's dep (usually empty, harmless) plus
///   the shape's iteration dep (`Iterate` for arrays, `MapKeyIterate` for
///   map-like targets) and, for arrays, the `Length` dep.
/// - `Delete` of an existing key: fires that key's dep plus the shape's
///   iteration dep.
/// - `Clear` is handled by [`trigger_clear`], not this function.
pub fn trigger_key(target: TargetId, op: TriggerOp, key: Key, shape: TargetShape) {
    debug_assert_ne!(op, TriggerOp::Clear, "use trigger_clear for Clear");

    let key_dep = with_runtime(|rt| {
        rt.targets
            .borrow()
            .get(&target)
            .and_then(|e| e.keys.get(&key).cloned())
    });
    fire_dep(target, key.clone(), op, key_dep);

    if op == TriggerOp::Set {
        return;
    }

    let iterate_key = match shape {
        TargetShape::Plain => return,
        TargetShape::Array => Key::Iterate,
        TargetShape::MapLike => Key::MapKeyIterate,
    };
    let iterate_dep = with_runtime(|rt| {
        rt.targets
            .borrow()
            .get(&target)
            .and_then(|e| e.keys.get(&iterate_key).cloned())
    });
    fire_dep(target, iterate_key, op, iterate_dep);

    if matches!(shape, TargetShape::Array) {
        let length_dep = with_runtime(|rt| {
            rt.targets
                .borrow()
                .get(&target)
                .and_then(|e| e.keys.get(&Key::Length).cloned())
        });
        fire_dep(target, Key::Length, op, length_dep);
    }
}

/// Drops every [`TargetEntry`] whose liveness token has expired, i.e. whose
/// owning [`crate::target`] wrapper was dropped. The source relies on the
/// JS GC to reclaim `WeakMap` entries automatically; Rust has no such
/// sweep, so callers invoke this explicitly when they want to bound the
/// graph's memory.
pub fn gc() {
    with_runtime(|rt| {
        rt.targets.borrow_mut().retain(|_, entry| entry.alive.strong_count() > 0);
    });
}
