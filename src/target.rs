#![forbid(unsafe_code)]
//! Concrete reactive containers: the values effects
//! track reads of and writes trigger against.
//!
//! A "target" here is any object reachable through the proxy/reflect
//! machinery in the source language this engine's design is modeled on;
//! Rust has no transparent property-access interception, so this module
//! gives every target an explicit, typed wrapper instead. Grounded on
//! `leptos_reactive::node`'s arena-handle pattern (a small `Copy` id type
//! wrapping shared interior-mutable state) for the `Rc<RefCell<_>>`-per-value
//! shape, generalized from a single dirty-flag node to the graph's per-key
//! dep tracking.

use std::{cell::RefCell, rc::Rc};

use crate::graph::{
    track_with_token, trigger_clear, trigger_key, trigger_length_set, Key, TargetId, TargetShape,
    TrackOp, TriggerOp,
};
use crate::runtime::with_runtime;

/// Implemented by every reactive container so generic code (and future
/// container types) can reach its identity without matching on a concrete
/// type.
pub trait ReactiveTarget {
    fn target_id(&self) -> TargetId;
}

fn new_target() -> (TargetId, Rc<()>) {
    let id = with_runtime(|rt| rt.allocate_target_id());
    (id, Rc::new(()))
}

/// A single tracked value, the simplest target shape (`Key::Value` is its
/// only key). Cloning shares the underlying cell; drop the last clone to
/// let [`crate::graph::gc`] reclaim its graph entry.
pub struct ReactiveCell<T> {
    id: TargetId,
    alive: Rc<()>,
    value: Rc<RefCell<T>>,
}

impl<T> Clone for ReactiveCell<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            alive: self.alive.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T> ReactiveTarget for ReactiveCell<T> {
    fn target_id(&self) -> TargetId {
        self.id
    }
}

impl<T: Clone> ReactiveCell<T> {
    pub fn new(value: T) -> Self {
        let (id, alive) = new_target();
        Self {
            id,
            alive,
            value: Rc::new(RefCell::new(value)),
        }
    }

    /// Reads the current value, tracking a dependency on it.
    pub fn get(&self) -> T {
        track_with_token(self.id, Key::Value, TrackOp::Get, &self.alive);
        self.value.borrow().clone()
    }

    /// Writes a new value, triggering every effect subscribed to it.
    pub fn set(&self, value: T) {
        *self.value.borrow_mut() = value;
        trigger_key(self.id, TriggerOp::Set, Key::Value, TargetShape::Plain);
    }

    /// Reads without tracking and without triggering, the escape hatch for
    /// code that must inspect state outside the reactive graph.
    pub fn peek(&self) -> T {
        self.value.borrow().clone()
    }
}

/// An array-like target: indices, a `length`, and an iteration dep.
pub struct ReactiveVec<T> {
    id: TargetId,
    alive: Rc<()>,
    items: Rc<RefCell<Vec<T>>>,
}

impl<T> Clone for ReactiveVec<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            alive: self.alive.clone(),
            items: self.items.clone(),
        }
    }
}

impl<T> ReactiveTarget for ReactiveVec<T> {
    fn target_id(&self) -> TargetId {
        self.id
    }
}

impl<T: Clone> ReactiveVec<T> {
    pub fn new() -> Self {
        let (id, alive) = new_target();
        Self {
            id,
            alive,
            items: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        let (id, alive) = new_target();
        Self {
            id,
            alive,
            items: Rc::new(RefCell::new(items)),
        }
    }

    pub fn get(&self, index: usize) -> Option<T> {
        track_with_token(self.id, Key::Index(index), TrackOp::Get, &self.alive);
        self.items.borrow().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        track_with_token(self.id, Key::Length, TrackOp::Get, &self.alive);
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites an existing index. Out-of-range indices panic, matching a
    /// plain `Vec`'s `[]` semantics; use [`Self::push`]/[`Self::insert`] to
    /// grow.
    pub fn set(&self, index: usize, value: T) {
        {
            let mut items = self.items.borrow_mut();
            items[index] = value;
        }
        trigger_key(self.id, TriggerOp::Set, Key::Index(index), TargetShape::Array);
    }

    pub fn push(&self, value: T) {
        let index = {
            let mut items = self.items.borrow_mut();
            items.push(value);
            items.len() - 1
        };
        trigger_key(self.id, TriggerOp::Add, Key::Index(index), TargetShape::Array);
    }

    pub fn insert(&self, index: usize, value: T) {
        self.items.borrow_mut().insert(index, value);
        trigger_key(self.id, TriggerOp::Add, Key::Index(index), TargetShape::Array);
    }

    pub fn remove(&self, index: usize) -> T {
        let removed = self.items.borrow_mut().remove(index);
        trigger_key(self.id, TriggerOp::Delete, Key::Index(index), TargetShape::Array);
        removed
    }

    pub fn clear(&self) {
        self.items.borrow_mut().clear();
        trigger_clear(self.id);
    }

    /// Shrinks the array to `new_len`, dropping any trailing elements. A
    /// no-op (no trigger) if `new_len >= len()`, matching `Vec::truncate`.
    pub fn truncate(&self, new_len: usize) {
        let truncated = {
            let mut items = self.items.borrow_mut();
            let before = items.len();
            items.truncate(new_len);
            items.len() < before
        };
        if truncated {
            trigger_length_set(self.id, new_len);
        }
    }

    /// Tracks the iteration dep and returns a snapshot, the reactive
    /// analogue of `for...of`/`for...in` over an array.
    pub fn iter_snapshot(&self) -> Vec<T> {
        track_with_token(self.id, Key::Iterate, TrackOp::Iterate, &self.alive);
        self.items.borrow().clone()
    }
}

impl<T: Clone> Default for ReactiveVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A string-keyed map-like target.
pub struct ReactiveMap<V> {
    id: TargetId,
    alive: Rc<()>,
    entries: Rc<RefCell<rustc_hash::FxHashMap<Rc<str>, V>>>,
}

impl<V> Clone for ReactiveMap<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            alive: self.alive.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<V> ReactiveTarget for ReactiveMap<V> {
    fn target_id(&self) -> TargetId {
        self.id
    }
}

impl<V: Clone> ReactiveMap<V> {
    pub fn new() -> Self {
        let (id, alive) = new_target();
        Self {
            id,
            alive,
            entries: Rc::new(RefCell::new(rustc_hash::FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        track_with_token(
            self.id,
            Key::Named(Rc::from(key)),
            TrackOp::Get,
            &self.alive,
        );
        self.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        track_with_token(
            self.id,
            Key::Named(Rc::from(key)),
            TrackOp::Has,
            &self.alive,
        );
        self.entries.borrow().contains_key(key)
    }

    pub fn set(&self, key: &str, value: V) {
        let existed = self.entries.borrow().contains_key(key);
        let key_rc: Rc<str> = Rc::from(key);
        self.entries.borrow_mut().insert(key_rc.clone(), value);
        let op = if existed { TriggerOp::Set } else { TriggerOp::Add };
        trigger_key(self.id, op, Key::Named(key_rc), TargetShape::MapLike);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.entries.borrow_mut().remove(key);
        if removed.is_some() {
            trigger_key(
                self.id,
                TriggerOp::Delete,
                Key::Named(Rc::from(key)),
                TargetShape::MapLike,
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
        trigger_clear(self.id);
    }

    /// Tracks the map's key-iteration dep and returns a snapshot of keys,
    /// invalidated by add/delete but not by an overwrite of an existing key.
    pub fn keys_snapshot(&self) -> Vec<Rc<str>> {
        track_with_token(self.id, Key::MapKeyIterate, TrackOp::Iterate, &self.alive);
        self.entries.borrow().keys().cloned().collect()
    }
}

impl<V: Clone> Default for ReactiveMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{effect::{make_effect, EffectOptions}, runtime::reset_runtime_for_test};
    use std::cell::Cell;

    #[test]
    fn vec_push_does_not_fire_set_only_subscriber() {
        reset_runtime_for_test();
        let v: ReactiveVec<i32> = ReactiveVec::new();
        v.push(1);
        let hits = Rc::new(Cell::new(0));
        {
            let v = v.clone();
            let hits = hits.clone();
            make_effect(
                move || {
                    let _ = v.get(0);
                    hits.set(hits.get() + 1);
                },
                None,
                EffectOptions::default(),
            );
        }
        hits.set(0);
        v.push(2);
        assert_eq!(hits.get(), 0, "push must not fire an unrelated index dep");
    }

    #[test]
    fn vec_iteration_dep_fires_on_push_not_on_set() {
        reset_runtime_for_test();
        let v: ReactiveVec<i32> = ReactiveVec::from_vec(vec![1, 2, 3]);
        let hits = Rc::new(Cell::new(0));
        {
            let v = v.clone();
            let hits = hits.clone();
            make_effect(
                move || {
                    let _ = v.iter_snapshot();
                    hits.set(hits.get() + 1);
                },
                None,
                EffectOptions::default(),
            );
        }
        hits.set(0);
        v.set(0, 99);
        assert_eq!(hits.get(), 0);
        v.push(4);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn vec_truncate_fires_length_set_and_is_noop_when_not_shrinking() {
        reset_runtime_for_test();
        let v: ReactiveVec<i32> = ReactiveVec::from_vec(vec![1, 2, 3, 4]);
        let hits = Rc::new(Cell::new(0));
        {
            let v = v.clone();
            let hits = hits.clone();
            make_effect(
                move || {
                    let _ = v.len();
                    hits.set(hits.get() + 1);
                },
                None,
                EffectOptions::default(),
            );
        }
        hits.set(0);
        v.truncate(4);
        assert_eq!(hits.get(), 0, "truncate to the current length must not trigger");
        v.truncate(2);
        assert_eq!(hits.get(), 1);
        assert_eq!(v.iter_snapshot(), vec![1, 2]);
    }

    #[test]
    fn map_set_on_new_key_is_add() {
        reset_runtime_for_test();
        let m: ReactiveMap<i32> = ReactiveMap::new();
        let hits = Rc::new(Cell::new(0));
        {
            let m = m.clone();
            let hits = hits.clone();
            make_effect(
                move || {
                    let _ = m.keys_snapshot();
                    hits.set(hits.get() + 1);
                },
                None,
                EffectOptions::default(),
            );
        }
        hits.set(0);
        m.set("a", 1);
        assert_eq!(hits.get(), 1);
        hits.set(0);
        m.set("a", 2);
        assert_eq!(hits.get(), 0, "overwriting an existing key is a Set, not an Add");
    }

    #[test]
    fn cell_peek_does_not_track() {
        reset_runtime_for_test();
        let c = ReactiveCell::new(1);
        let hits = Rc::new(Cell::new(0));
        {
            let c = c.clone();
            let hits = hits.clone();
            make_effect(
                move || {
                    let _ = c.peek();
                    hits.set(hits.get() + 1);
                },
                None,
                EffectOptions::default(),
            );
        }
        hits.set(0);
        c.set(2);
        assert_eq!(hits.get(), 0, "peek must not subscribe");
    }
}
